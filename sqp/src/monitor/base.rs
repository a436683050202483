use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::{counter, histogram};
use sqp_config::shared::{AlertThresholds, LogLevel, MonitorConfig, PipelineConfig};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::metrics::{
    ALERT_TYPE_LABEL, PIPELINE_ID_LABEL, SQP_ALERT_DISPATCH_FAILURES_TOTAL, SQP_ALERTS_TOTAL,
    SQP_RECORDS_PROCESSED_TOTAL, SQP_RUN_DURATION_SECONDS, SQP_RUNS_TOTAL, STATUS_LABEL,
    STEP_LABEL, SQP_STEP_DURATION_SECONDS,
};
use crate::monitor::analysis::{self, DashboardMetrics, PerformanceAnalysis};
use crate::monitor::{
    Alert, AlertChannel, AlertSeverity, AlertType, ErrorRecord, LogRecord, RunMetrics, RunStatus,
    StepMetrics,
};
use crate::store::monitor::MonitorStore;
use crate::types::PipelineId;

/// Number of most recent runs summarized by [`PipelineMonitor::get_dashboard_metrics`].
const DASHBOARD_RUN_LIMIT: usize = 100;

/// Window of [`DashboardMetrics::recent_errors`].
const RECENT_ERRORS_WINDOW: chrono::Duration = chrono::Duration::hours(24);

/// Where an error happened, attached to its [`ErrorRecord`].
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub step: Option<String>,
    pub attempt: Option<u32>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn step(step: impl Into<String>) -> Self {
        Self {
            step: Some(step.into()),
            ..Self::default()
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// Run started by this monitor, kept after it ends until the next run starts.
    current_run: Option<RunMetrics>,
    /// Date of the newest record synced so far.
    data_freshness: Option<DateTime<Utc>>,
}

/// Records metrics and errors of the runs of one pipeline and raises alerts.
///
/// Persistence failures are logged and swallowed: monitoring never changes the outcome of a
/// run. Cloning is cheap and clones share the current run and the registered channels.
#[derive(Clone)]
pub struct PipelineMonitor<S> {
    pipeline_id: PipelineId,
    thresholds: AlertThresholds,
    alert_channels: Vec<String>,
    config: MonitorConfig,
    store: S,
    inner: Arc<Mutex<Inner>>,
    channels: Arc<RwLock<HashMap<String, Arc<dyn AlertChannel>>>>,
}

impl<S> PipelineMonitor<S>
where
    S: MonitorStore + Send + Sync,
{
    pub fn new(pipeline: &PipelineConfig, config: MonitorConfig, store: S) -> Self {
        Self {
            pipeline_id: pipeline.id.clone(),
            thresholds: pipeline.alert_thresholds.clone(),
            alert_channels: pipeline.alert_channels.clone(),
            config,
            store,
            inner: Arc::new(Mutex::new(Inner::default())),
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `channel` under `name`, replacing any channel with the same name.
    pub fn register_alert_channel(&self, name: impl Into<String>, channel: Arc<dyn AlertChannel>) {
        let name = name.into();
        debug!(pipeline_id = %self.pipeline_id, channel = %name, "alert channel registered");
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, channel);
    }

    /// Starts tracking a new run and returns its id.
    pub async fn start_pipeline(&self) -> Uuid {
        let run_id = Uuid::new_v4();
        let run = RunMetrics::started(run_id, self.pipeline_id.clone());
        self.inner().current_run = Some(run.clone());

        info!(pipeline_id = %self.pipeline_id, %run_id, "pipeline run started");
        self.persist_run(&run).await;

        run_id
    }

    /// Id of the run in flight, if any.
    pub fn current_run_id(&self) -> Option<Uuid> {
        self.inner()
            .current_run
            .as_ref()
            .filter(|run| !run.is_finished())
            .map(|run| run.run_id)
    }

    /// Snapshot of the current or last run started by this monitor.
    pub fn current_run(&self) -> Option<RunMetrics> {
        self.inner().current_run.clone()
    }

    /// Finishes the current run with `status`.
    pub async fn end_pipeline(&self, status: RunStatus, error: Option<&SyncError>) {
        let run = {
            let mut inner = self.inner();
            let Some(run) = inner.current_run.as_mut() else {
                warn!(pipeline_id = %self.pipeline_id, "no run in flight to end");
                return;
            };

            let now = Utc::now();
            run.status = status;
            run.end_time = Some(now);
            run.duration_ms = Some((now - run.start_time).num_milliseconds().max(0) as u64);
            run.error = error.map(SyncError::message);
            run.clone()
        };

        counter!(
            SQP_RUNS_TOTAL,
            PIPELINE_ID_LABEL => self.pipeline_id.clone(),
            STATUS_LABEL => status.as_static_str()
        )
        .increment(1);
        if let Some(duration_ms) = run.duration_ms {
            histogram!(SQP_RUN_DURATION_SECONDS, PIPELINE_ID_LABEL => self.pipeline_id.clone())
                .record(duration_ms as f64 / 1000.0);
        }

        info!(
            pipeline_id = %self.pipeline_id,
            run_id = %run.run_id,
            %status,
            duration_ms = ?run.duration_ms,
            records_processed = run.records_processed,
            "pipeline run ended"
        );
        self.persist_run(&run).await;
    }

    /// Records the latest attempt of a step in the current run.
    pub async fn record_step_metrics(&self, metrics: StepMetrics) {
        if metrics.success {
            histogram!(
                SQP_STEP_DURATION_SECONDS,
                PIPELINE_ID_LABEL => self.pipeline_id.clone(),
                STEP_LABEL => metrics.step_name.clone()
            )
            .record(metrics.duration_ms as f64 / 1000.0);
            counter!(
                SQP_RECORDS_PROCESSED_TOTAL,
                PIPELINE_ID_LABEL => self.pipeline_id.clone(),
                STEP_LABEL => metrics.step_name.clone()
            )
            .increment(metrics.records_processed);
        }

        let run = {
            let mut inner = self.inner();
            let Some(run) = inner.current_run.as_mut() else {
                warn!(pipeline_id = %self.pipeline_id, step = %metrics.step_name, "step metrics recorded without a run");
                return;
            };
            run.upsert_step(metrics);
            run.clone()
        };

        self.persist_run(&run).await;
    }

    /// Persists an error of the current run.
    pub async fn record_error(&self, error: &SyncError, context: ErrorContext) {
        let mut metadata = context.metadata;
        if let Some(attempt) = context.attempt {
            metadata.insert("attempt".to_string(), attempt.into());
        }

        let record = ErrorRecord {
            pipeline_id: self.pipeline_id.clone(),
            run_id: self.current_run_id(),
            step: context.step,
            error_kind: error.kind().as_static_str().to_string(),
            message: error.message(),
            context: metadata,
            created_at: Utc::now(),
        };

        warn!(
            pipeline_id = %self.pipeline_id,
            step = ?record.step,
            attempt = ?context.attempt,
            error_kind = %record.error_kind,
            error = %record.message,
            "pipeline error recorded"
        );

        if let Err(err) = self.store.insert_error(&record).await {
            error!(pipeline_id = %self.pipeline_id, error = %err.message(), "failed to persist pipeline error");
        }
    }

    /// Records the date of the newest synced record, checked by the data freshness alert.
    pub fn record_data_freshness(&self, newest_record: DateTime<Utc>) {
        let mut inner = self.inner();
        if inner.data_freshness.is_none_or(|current| current < newest_record) {
            inner.data_freshness = Some(newest_record);
        }
    }

    pub fn data_freshness(&self) -> Option<DateTime<Utc>> {
        self.inner().data_freshness
    }

    /// Evaluates every alert threshold and dispatches the resulting alerts.
    ///
    /// Each check runs independently. A check whose input cannot be loaded is skipped.
    pub async fn check_alerts(&self) -> Vec<Alert> {
        let now = Utc::now();
        let mut alerts = Vec::new();

        match self.recent_runs(self.config.error_rate_window as usize).await {
            Ok(runs) => {
                let rate = analysis::error_rate(&runs);
                if rate > 0.0 && rate >= self.thresholds.error_rate {
                    alerts.push(
                        Alert::new(
                            AlertType::ErrorRate,
                            AlertSeverity::Critical,
                            self.pipeline_id.clone(),
                            format!(
                                "Error rate {:.1}% over the last {} runs exceeds the {:.1}% threshold",
                                rate * 100.0,
                                runs.len(),
                                self.thresholds.error_rate * 100.0
                            ),
                        )
                        .with_metadata("error_rate", rate)
                        .with_metadata("threshold", self.thresholds.error_rate)
                        .with_metadata("runs", runs.len()),
                    );
                }
            }
            Err(err) => {
                warn!(pipeline_id = %self.pipeline_id, error = %err.message(), "skipping error rate alert check");
            }
        }

        if let Some(threshold) = self.thresholds.execution_time_ms {
            let elapsed_ms = self
                .inner()
                .current_run
                .as_ref()
                .map(|run| run.elapsed_ms(now));
            if let Some(elapsed_ms) = elapsed_ms.filter(|elapsed_ms| *elapsed_ms > threshold) {
                alerts.push(
                    Alert::new(
                        AlertType::ExecutionTime,
                        AlertSeverity::Warning,
                        self.pipeline_id.clone(),
                        format!("Run took {elapsed_ms}ms, above the {threshold}ms threshold"),
                    )
                    .with_metadata("execution_time_ms", elapsed_ms)
                    .with_metadata("threshold_ms", threshold),
                );
            }
        }

        if let (Some(threshold), Some(newest)) =
            (self.thresholds.data_freshness_ms, self.data_freshness())
        {
            let age_ms = (now - newest).num_milliseconds().max(0) as u64;
            if age_ms > threshold {
                alerts.push(
                    Alert::new(
                        AlertType::DataFreshness,
                        AlertSeverity::Warning,
                        self.pipeline_id.clone(),
                        format!(
                            "Newest record is from {}, older than the {threshold}ms threshold",
                            newest.to_rfc3339()
                        ),
                    )
                    .with_metadata("data_age_ms", age_ms)
                    .with_metadata("threshold_ms", threshold),
                );
            }
        }

        if let Some(threshold) = self.thresholds.memory_usage_bytes {
            match process_memory_bytes() {
                Some(used) if used > threshold => {
                    alerts.push(
                        Alert::new(
                            AlertType::MemoryUsage,
                            AlertSeverity::Warning,
                            self.pipeline_id.clone(),
                            format!(
                                "Process uses {used} bytes of memory, above the {threshold} bytes threshold"
                            ),
                        )
                        .with_metadata("memory_usage_bytes", used)
                        .with_metadata("threshold_bytes", threshold),
                    );
                }
                Some(_) => {}
                None => {
                    debug!(pipeline_id = %self.pipeline_id, "process memory usage unavailable");
                }
            }
        }

        for alert in &alerts {
            counter!(
                SQP_ALERTS_TOTAL,
                PIPELINE_ID_LABEL => self.pipeline_id.clone(),
                ALERT_TYPE_LABEL => alert.alert_type.as_static_str()
            )
            .increment(1);
            self.send_alert(alert).await;
        }

        alerts
    }

    /// Persists `alert` for audit and delivers it to every configured channel.
    ///
    /// Delivery failures and channels that were never registered are logged, never returned.
    pub async fn send_alert(&self, alert: &Alert) {
        let mut audit_metadata = alert.metadata.clone();
        audit_metadata.insert("alert_type".to_string(), alert.alert_type.as_static_str().into());
        audit_metadata.insert("severity".to_string(), alert.severity.as_static_str().into());
        self.persist_log(alert.severity.log_level(), alert.message.clone(), audit_metadata)
            .await;

        let mut deliveries = Vec::new();
        for name in &self.alert_channels {
            let channel = self
                .channels
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(name)
                .cloned();

            match channel {
                Some(channel) => deliveries.push(async move { (name, channel.send(alert).await) }),
                None => {
                    let err = crate::sync_error!(
                        ErrorKind::AlertDispatchFailed,
                        "Alert channel is not registered",
                        format!("channel `{name}`")
                    );
                    self.dispatch_failed(name, alert, &err).await;
                }
            }
        }

        for (name, result) in join_all(deliveries).await {
            if let Err(err) = result {
                self.dispatch_failed(name, alert, &err).await;
            }
        }
    }

    async fn dispatch_failed(&self, channel: &str, alert: &Alert, err: &SyncError) {
        counter!(
            SQP_ALERT_DISPATCH_FAILURES_TOTAL,
            PIPELINE_ID_LABEL => self.pipeline_id.clone(),
            ALERT_TYPE_LABEL => alert.alert_type.as_static_str()
        )
        .increment(1);

        let mut metadata = serde_json::Map::new();
        metadata.insert("channel".to_string(), channel.into());
        metadata.insert("alert_type".to_string(), alert.alert_type.as_static_str().into());
        metadata.insert(
            "error_kind".to_string(),
            ErrorKind::AlertDispatchFailed.as_static_str().into(),
        );
        self.log(
            LogLevel::Error,
            format!("Failed to dispatch alert to `{channel}`: {}", err.message()),
            metadata,
        )
        .await;
    }

    /// Emits a pipeline-scoped log entry if `level` passes the configured minimum level.
    ///
    /// Warnings and errors are also persisted.
    pub async fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) {
        if level < self.config.log_level {
            return;
        }

        let message = message.into();
        let run_id = self.current_run_id();
        match level {
            LogLevel::Debug => debug!(pipeline_id = %self.pipeline_id, ?run_id, ?metadata, "{message}"),
            LogLevel::Info => info!(pipeline_id = %self.pipeline_id, ?run_id, ?metadata, "{message}"),
            LogLevel::Warning => warn!(pipeline_id = %self.pipeline_id, ?run_id, ?metadata, "{message}"),
            LogLevel::Error => error!(pipeline_id = %self.pipeline_id, ?run_id, ?metadata, "{message}"),
        }

        if level.is_persisted() {
            self.persist_log(level, message, metadata).await;
        }
    }

    /// Fraction of failed steps across the configured window of recent runs.
    pub async fn get_error_rate(&self) -> SyncResult<f64> {
        let runs = self
            .recent_runs(self.config.error_rate_window as usize)
            .await?;

        Ok(analysis::error_rate(&runs))
    }

    /// Records per second of the current run, or of the last persisted run.
    pub async fn get_throughput(&self) -> SyncResult<f64> {
        let now = Utc::now();
        if let Some(run) = self.current_run() {
            return Ok(run.throughput(now));
        }

        let runs = self.recent_runs(1).await?;

        Ok(runs.first().map(|run| run.throughput(now)).unwrap_or(0.0))
    }

    /// Compares the current, or last, run duration with recent successful runs.
    pub async fn analyze_performance(&self) -> SyncResult<PerformanceAnalysis> {
        let runs = self
            .recent_runs(self.config.baseline_window as usize + 1)
            .await?;
        let current = self.current_run().or_else(|| runs.first().cloned());

        Ok(PerformanceAnalysis::compute(current.as_ref(), &runs, Utc::now()))
    }

    pub async fn get_dashboard_metrics(&self) -> SyncResult<DashboardMetrics> {
        let now = Utc::now();
        let runs = self.recent_runs(DASHBOARD_RUN_LIMIT).await?;
        let recent_errors = self
            .store
            .get_errors_since(&self.pipeline_id, now - RECENT_ERRORS_WINDOW)
            .await?
            .len();
        let current = self.current_run();

        Ok(DashboardMetrics::compute(
            &self.pipeline_id,
            &runs,
            current.as_ref(),
            recent_errors,
            now,
        ))
    }

    /// Deletes runs, errors and logs older than `days_to_keep` days.
    pub async fn cleanup_old_data(&self, days_to_keep: u32) -> SyncResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days_to_keep));
        let deleted = self
            .store
            .delete_monitor_data_before(&self.pipeline_id, cutoff)
            .await?;

        info!(pipeline_id = %self.pipeline_id, deleted, days_to_keep, "monitoring data cleaned up");

        Ok(deleted)
    }

    async fn recent_runs(&self, limit: usize) -> SyncResult<Vec<RunMetrics>> {
        self.store.get_recent_runs(&self.pipeline_id, limit).await
    }

    async fn persist_run(&self, run: &RunMetrics) {
        if let Err(err) = self.store.save_run_metrics(run).await {
            error!(
                pipeline_id = %self.pipeline_id,
                run_id = %run.run_id,
                error = %err.message(),
                "failed to persist run metrics"
            );
        }
    }

    async fn persist_log(
        &self,
        level: LogLevel,
        message: String,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) {
        let record = LogRecord {
            pipeline_id: self.pipeline_id.clone(),
            run_id: self.current_run_id(),
            level,
            message,
            metadata,
            created_at: Utc::now(),
        };

        if let Err(err) = self.store.insert_log(&record).await {
            error!(pipeline_id = %self.pipeline_id, error = %err.message(), "failed to persist pipeline log");
        }
    }
}

/// Resident set size of the current process, in bytes.
fn process_memory_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = sysinfo::System::new();
    system.refresh_process(pid);

    system.process(pid).map(|process| process.memory())
}
