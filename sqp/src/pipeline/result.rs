use uuid::Uuid;

use crate::error::{ErrorKind, SyncError};
use crate::monitor::{Alert, RunMetrics};

/// Error message returned when another run holds the pipeline lock.
pub const ALREADY_RUNNING_MESSAGE: &str = "Pipeline is already running";

/// Options of a single [`super::PipelineOrchestrator::execute`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Skips steps checkpointed as completed by the previous, failed run.
    pub resume_from_failure: bool,
}

impl ExecuteOptions {
    pub fn resume() -> Self {
        Self {
            resume_from_failure: true,
        }
    }
}

/// Structured outcome of a run. Returned on every path, including lock conflicts.
#[derive(Debug, Clone)]
pub struct PipelineRunResult {
    pub success: bool,
    /// Id of the monitored run, absent when the run never started.
    pub run_id: Option<Uuid>,
    pub steps_completed: usize,
    pub total_steps: usize,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Non-fatal data-quality and freshness observations.
    pub warnings: Vec<String>,
    pub alerts: Vec<Alert>,
    pub metrics: Option<RunMetrics>,
}

impl PipelineRunResult {
    /// Result of a run that never acquired the lock.
    pub(crate) fn not_started(total_steps: usize, error: &SyncError) -> Self {
        Self {
            success: false,
            run_id: None,
            steps_completed: 0,
            total_steps,
            error: Some(error.message()),
            error_kind: Some(error.kind()),
            warnings: Vec::new(),
            alerts: Vec::new(),
            metrics: None,
        }
    }

    pub(crate) fn already_running(total_steps: usize) -> Self {
        let error = SyncError::from((ErrorKind::LockConflict, ALREADY_RUNNING_MESSAGE));
        Self::not_started(total_steps, &error)
    }
}
