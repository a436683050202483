use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::SyncResult;
use crate::monitor::{ErrorRecord, LogRecord, RunMetrics};

/// Append-mostly storage of run metrics, errors and logs.
pub trait MonitorStore {
    /// Inserts or replaces the metrics of a run, keyed by run id.
    fn save_run_metrics(&self, run: &RunMetrics) -> impl Future<Output = SyncResult<()>> + Send;

    /// Returns up to `limit` runs of `pipeline_id`, most recently started first.
    fn get_recent_runs(
        &self,
        pipeline_id: &str,
        limit: usize,
    ) -> impl Future<Output = SyncResult<Vec<RunMetrics>>> + Send;

    fn insert_error(&self, error: &ErrorRecord) -> impl Future<Output = SyncResult<()>> + Send;

    /// Returns the errors recorded at or after `since`, newest first.
    fn get_errors_since(
        &self,
        pipeline_id: &str,
        since: DateTime<Utc>,
    ) -> impl Future<Output = SyncResult<Vec<ErrorRecord>>> + Send;

    fn insert_log(&self, log: &LogRecord) -> impl Future<Output = SyncResult<()>> + Send;

    /// Returns up to `limit` log entries, newest first.
    fn get_recent_logs(
        &self,
        pipeline_id: &str,
        limit: usize,
    ) -> impl Future<Output = SyncResult<Vec<LogRecord>>> + Send;

    /// Deletes runs, errors and logs older than `cutoff` and returns how many rows were deleted.
    fn delete_monitor_data_before(
        &self,
        pipeline_id: &str,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = SyncResult<u64>> + Send;
}
