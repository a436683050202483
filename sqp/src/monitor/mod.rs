//! Run metrics, error records, alerting and pipeline-scoped logging.

mod alert;
mod analysis;
mod base;
mod types;

pub use alert::{Alert, AlertChannel, AlertSeverity, AlertType};
pub use analysis::{DashboardMetrics, PerformanceAnalysis, RunSummary};
pub use base::{ErrorContext, PipelineMonitor};
pub use types::{ErrorRecord, LogRecord, RunMetrics, RunStatus, StepMetrics};
