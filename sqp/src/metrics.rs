//! Metric names and labels emitted by the sync runtime.

/// Label for the pipeline id.
pub const PIPELINE_ID_LABEL: &str = "pipeline_id";

/// Label for the step name.
pub const STEP_LABEL: &str = "step";

/// Label for the error kind.
pub const ERROR_KIND_LABEL: &str = "error_kind";

/// Label for the terminal status of a run.
pub const STATUS_LABEL: &str = "status";

/// Label for the alert type.
pub const ALERT_TYPE_LABEL: &str = "alert_type";

// Run metrics

/// Counter of finished runs, labelled by status.
pub const SQP_RUNS_TOTAL: &str = "sqp_runs_total";

/// Histogram of run durations in seconds.
pub const SQP_RUN_DURATION_SECONDS: &str = "sqp_run_duration_seconds";

/// Counter of runs rejected because another run held the lock.
pub const SQP_LOCK_CONFLICTS_TOTAL: &str = "sqp_lock_conflicts_total";

// Step metrics

/// Counter of step attempts.
pub const SQP_STEP_ATTEMPTS_TOTAL: &str = "sqp_step_attempts_total";

/// Counter of failed step attempts, labelled by error kind.
pub const SQP_STEP_FAILURES_TOTAL: &str = "sqp_step_failures_total";

/// Counter of scheduled retries.
pub const SQP_STEP_RETRIES_TOTAL: &str = "sqp_step_retries_total";

/// Histogram of successful step durations in seconds.
pub const SQP_STEP_DURATION_SECONDS: &str = "sqp_step_duration_seconds";

/// Counter of records processed by steps.
pub const SQP_RECORDS_PROCESSED_TOTAL: &str = "sqp_records_processed_total";

// Alerting

/// Counter of raised alerts, labelled by alert type.
pub const SQP_ALERTS_TOTAL: &str = "sqp_alerts_total";

/// Counter of alert deliveries that failed.
pub const SQP_ALERT_DISPATCH_FAILURES_TOTAL: &str = "sqp_alert_dispatch_failures_total";

// Connection pool

/// Counter of successful client acquisitions.
pub const SQP_POOL_ACQUIRES_TOTAL: &str = "sqp_pool_acquires_total";

/// Counter of acquisitions that timed out.
pub const SQP_POOL_ACQUIRE_TIMEOUTS_TOTAL: &str = "sqp_pool_acquire_timeouts_total";

/// Counter of clients evicted after a failed health check or idle timeout.
pub const SQP_POOL_EVICTIONS_TOTAL: &str = "sqp_pool_evictions_total";

/// Gauge of open clients.
pub const SQP_POOL_SIZE: &str = "sqp_pool_size";

/// Gauge of clients currently handed out.
pub const SQP_POOL_IN_USE: &str = "sqp_pool_in_use";
