use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use metrics::counter;
use sqp_config::shared::{LogLevel, MonitorConfig, PipelineConfig, PipelineStepConfig, StepType};
use tracing::{debug, error, info, warn};

use crate::clients::ClientFactory;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::metrics::{
    ERROR_KIND_LABEL, PIPELINE_ID_LABEL, SQP_LOCK_CONFLICTS_TOTAL, SQP_STEP_ATTEMPTS_TOTAL,
    SQP_STEP_FAILURES_TOTAL, SQP_STEP_RETRIES_TOTAL, STEP_LABEL,
};
use crate::monitor::{ErrorContext, PipelineMonitor, RunStatus, StepMetrics};
use crate::pipeline::policy::{build_error_handling_policy, retry_delay};
use crate::pipeline::quality::QualityGate;
use crate::pipeline::result::{ExecuteOptions, PipelineRunResult};
use crate::pipeline::step::{StepCapabilities, StepOutput, target_table};
use crate::pool::ConnectionPool;
use crate::schedule::NextRunCalculator;
use crate::state::{PipelineStateManager, PipelineStatus, StateUpdate};
use crate::store::monitor::MonitorStore;
use crate::store::state::StateStore;
use crate::{bail, sync_error};

/// How long [`PipelineOrchestrator::shutdown`] waits for a run in flight to reach a step
/// boundary before releasing its lock.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Progress of a run, kept outside of the step loop so that failed runs still report it.
#[derive(Debug, Default)]
struct RunProgress {
    steps_completed: usize,
    warnings: Vec<String>,
}

/// Drives the runs of one pipeline.
///
/// A run takes the single-flight lock, executes the configured steps in order with retries,
/// checkpoints every step output and always releases the lock, whatever the outcome.
pub struct PipelineOrchestrator<S, F: ClientFactory> {
    config: Arc<PipelineConfig>,
    state: PipelineStateManager<S>,
    monitor: PipelineMonitor<S>,
    pool: ConnectionPool<F>,
    capabilities: StepCapabilities,
    scheduler: Arc<dyn NextRunCalculator>,
    quality_gate: QualityGate,
    shutdown_tx: ShutdownTx,
    shut_down: AtomicBool,
    /// Held for the whole duration of a run started by this orchestrator.
    run_guard: tokio::sync::Mutex<()>,
}

impl<S, F> PipelineOrchestrator<S, F>
where
    S: StateStore + MonitorStore + Clone + Send + Sync + 'static,
    F: ClientFactory,
{
    pub fn new(
        config: PipelineConfig,
        monitor_config: MonitorConfig,
        store: S,
        pool: ConnectionPool<F>,
        capabilities: StepCapabilities,
        scheduler: Arc<dyn NextRunCalculator>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let (shutdown_tx, _) = create_shutdown_channel();
        let quality_gate = QualityGate::new(
            config.quality.clone(),
            config.alert_thresholds.data_freshness(),
        );

        Ok(Self {
            state: PipelineStateManager::new(&config, store.clone()),
            monitor: PipelineMonitor::new(&config, monitor_config, store),
            config: Arc::new(config),
            pool,
            capabilities,
            scheduler,
            quality_gate,
            shutdown_tx,
            shut_down: AtomicBool::new(false),
            run_guard: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state_manager(&self) -> &PipelineStateManager<S> {
        &self.state
    }

    pub fn monitor(&self) -> &PipelineMonitor<S> {
        &self.monitor
    }

    pub fn pool(&self) -> &ConnectionPool<F> {
        &self.pool
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Returns the configured cron expression.
    pub fn get_schedule(&self) -> &str {
        &self.config.schedule
    }

    pub fn calculate_next_run(&self, from: DateTime<Utc>) -> SyncResult<DateTime<Utc>> {
        self.scheduler.next_run(&self.config.schedule, from)
    }

    /// Executes one run of the pipeline.
    ///
    /// Never fails: lock conflicts, step failures and data-quality violations are all reported
    /// through the returned [`PipelineRunResult`].
    pub async fn execute(&self, options: ExecuteOptions) -> PipelineRunResult {
        let total_steps = self.config.steps.len();

        let Ok(_run_guard) = self.run_guard.try_lock() else {
            return self.lock_conflict(total_steps);
        };

        if self.shutdown_tx.is_shutdown() {
            let err = sync_error!(ErrorKind::PipelineCancelled, "Pipeline is shutting down");
            return PipelineRunResult::not_started(total_steps, &err);
        }

        match self.state.lock_pipeline().await {
            Ok(true) => {}
            Ok(false) => return self.lock_conflict(total_steps),
            Err(err) => {
                error!(pipeline_id = %self.config.id, error = %err.message(), "failed to acquire the pipeline lock");
                return PipelineRunResult::not_started(total_steps, &err);
            }
        }

        let run_id = self.monitor.start_pipeline().await;
        let mut progress = RunProgress::default();

        let outcome = self.run_steps(options, &mut progress).await;
        let error = self.finish_run(outcome).await;
        let alerts = self.monitor.check_alerts().await;
        self.release_lock().await;

        PipelineRunResult {
            success: error.is_none(),
            run_id: Some(run_id),
            steps_completed: progress.steps_completed,
            total_steps,
            error: error.as_ref().map(SyncError::message),
            error_kind: error.as_ref().map(SyncError::kind),
            warnings: progress.warnings,
            alerts,
            metrics: self.monitor.current_run(),
        }
    }

    /// Stops the orchestrator. Calling it again has no effect.
    ///
    /// A run in flight stops at its next step boundary and releases its lock. If it does not
    /// get there within [`SHUTDOWN_GRACE_PERIOD`], its lock is released here.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!(pipeline_id = %self.config.id, "orchestrator already shut down");
            return;
        }

        info!(pipeline_id = %self.config.id, "shutting down pipeline orchestrator");
        self.shutdown_tx.shutdown();
        self.pool.close().await;

        match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, self.run_guard.lock()).await {
            Ok(_run_guard) => self.release_lock().await,
            Err(_) => {
                warn!(
                    pipeline_id = %self.config.id,
                    "run in flight did not stop in time, releasing its lock"
                );
                if let Err(err) = self
                    .state
                    .update_state(StateUpdate::status(PipelineStatus::Cancelled))
                    .await
                {
                    warn!(pipeline_id = %self.config.id, error = %err.message(), "failed to mark the run as cancelled");
                }
                self.release_lock().await;
            }
        }
    }

    fn lock_conflict(&self, total_steps: usize) -> PipelineRunResult {
        counter!(SQP_LOCK_CONFLICTS_TOTAL, PIPELINE_ID_LABEL => self.config.id.clone())
            .increment(1);
        info!(pipeline_id = %self.config.id, "pipeline is already running, skipping run");

        PipelineRunResult::already_running(total_steps)
    }

    async fn run_steps(&self, options: ExecuteOptions, progress: &mut RunProgress) -> SyncResult<()> {
        self.state
            .update_state(StateUpdate::status(PipelineStatus::Running))
            .await?;

        let mut outputs: HashMap<String, serde_json::Value> = HashMap::new();
        let mut completed: HashSet<String> = HashSet::new();
        let mut start_index = 0;

        let recovery = if options.resume_from_failure {
            Some(self.state.get_recovery_point().await?)
        } else {
            None
        };

        match recovery.filter(|recovery| recovery.can_recover) {
            Some(recovery) => {
                for (index, step) in self.config.steps.iter().enumerate() {
                    let Some(data) = recovery.step_data.get(&step.name) else {
                        break;
                    };
                    outputs.insert(step.name.clone(), data.clone());
                    completed.insert(step.name.clone());
                    start_index = index + 1;
                }
                progress.steps_completed = start_index;

                self.monitor
                    .log(
                        LogLevel::Info,
                        format!("resuming run at step `{}`", recovery.next_step.unwrap_or_default()),
                        serde_json::Map::new(),
                    )
                    .await;
            }
            None => self.tolerate(self.state.clear_step_data().await, "clear step data")?,
        }

        for (index, step) in self.config.steps.iter().enumerate().skip(start_index) {
            if let Some(missing) = step
                .dependencies
                .iter()
                .find(|dependency| !completed.contains(dependency.as_str()))
            {
                bail!(
                    ErrorKind::DependencyNotMet,
                    "Step dependency did not succeed",
                    format!("step `{}` depends on `{missing}`", step.name)
                );
            }

            if self.shutdown_tx.is_shutdown() {
                bail!(
                    ErrorKind::PipelineCancelled,
                    "Pipeline run cancelled",
                    format!("shutdown requested before step `{}`", step.name)
                );
            }

            let update = StateUpdate::default().with_current_step(Some(step.name.clone()));
            self.tolerate(self.state.update_state(update).await.map(|_| ()), "record current step")?;

            let input = self.step_input(index, step, &outputs);
            let output = self.execute_step_with_retry(step, input).await?;

            self.tolerate(
                self.state.save_step_data(&step.name, output.data.clone()).await,
                "checkpoint step output",
            )?;

            outputs.insert(step.name.clone(), output.data);
            completed.insert(step.name.clone());
            progress.steps_completed += 1;
        }

        self.check_quality(&outputs, progress)
    }

    /// Input of a step: the output of its last dependency, or else of the preceding step.
    fn step_input(
        &self,
        index: usize,
        step: &PipelineStepConfig,
        outputs: &HashMap<String, serde_json::Value>,
    ) -> serde_json::Value {
        let source = match step.dependencies.last() {
            Some(dependency) => Some(dependency.as_str()),
            None => index
                .checked_sub(1)
                .map(|previous| self.config.steps[previous].name.as_str()),
        };

        source
            .and_then(|name| outputs.get(name))
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }

    async fn execute_step_with_retry(
        &self,
        step: &PipelineStepConfig,
        input: serde_json::Value,
    ) -> SyncResult<StepOutput> {
        let max_attempts = if step.retryable {
            self.config.max_retries.saturating_add(1)
        } else {
            1
        };
        let mut attempt = 0;

        loop {
            attempt += 1;
            counter!(
                SQP_STEP_ATTEMPTS_TOTAL,
                PIPELINE_ID_LABEL => self.config.id.clone(),
                STEP_LABEL => step.name.clone()
            )
            .increment(1);

            let started = Utc::now();
            debug!(pipeline_id = %self.config.id, step = %step.name, attempt, "executing step");

            let err = match self.invoke_step(step, input.clone()).await {
                Ok(output) => {
                    let records = output.record_count();
                    self.monitor
                        .record_step_metrics(StepMetrics::finished(
                            step.name.clone(),
                            started,
                            attempt,
                            records,
                            None,
                        ))
                        .await;
                    info!(pipeline_id = %self.config.id, step = %step.name, attempt, records, "step completed");

                    return Ok(output);
                }
                Err(err) => err,
            };

            counter!(
                SQP_STEP_FAILURES_TOTAL,
                PIPELINE_ID_LABEL => self.config.id.clone(),
                STEP_LABEL => step.name.clone(),
                ERROR_KIND_LABEL => err.kind().as_static_str()
            )
            .increment(1);
            self.monitor
                .record_error(&err, ErrorContext::step(step.name.clone()).with_attempt(attempt))
                .await;
            self.monitor
                .record_step_metrics(StepMetrics::finished(
                    step.name.clone(),
                    started,
                    attempt,
                    0,
                    Some(err.message()),
                ))
                .await;

            let policy = build_error_handling_policy(&err);
            if !policy.is_retryable() || attempt >= max_attempts {
                if let Some(solution) = policy.solution() {
                    warn!(pipeline_id = %self.config.id, step = %step.name, solution, "step failed permanently");
                }
                if let Err(mark_err) = self.state.mark_step_failed(&step.name, &err.message()).await {
                    warn!(pipeline_id = %self.config.id, step = %step.name, error = %mark_err.message(), "failed to checkpoint step failure");
                }

                return Err(sync_error!(
                    ErrorKind::StepFailed,
                    "Pipeline step failed",
                    format!(
                        "step `{}` failed after {attempt} attempt(s): {}",
                        step.name,
                        err.message()
                    ),
                    source: err
                ));
            }

            let delay = retry_delay(self.config.retry_delay_ms, attempt);
            counter!(
                SQP_STEP_RETRIES_TOTAL,
                PIPELINE_ID_LABEL => self.config.id.clone(),
                STEP_LABEL => step.name.clone()
            )
            .increment(1);
            info!(
                pipeline_id = %self.config.id,
                step = %step.name,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "retrying step after failure"
            );

            tokio::time::sleep(delay).await;
        }
    }

    /// Runs the capability of a step once, bounded by the step timeout.
    ///
    /// A panicking capability fails the attempt instead of unwinding through the run.
    async fn invoke_step(
        &self,
        step: &PipelineStepConfig,
        input: serde_json::Value,
    ) -> SyncResult<StepOutput> {
        let call = AssertUnwindSafe(self.call_capability(step, input)).catch_unwind();

        let result = match step.timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => bail!(
                    ErrorKind::OperationTimeout,
                    "Step timed out",
                    format!("step `{}` exceeded {}ms", step.name, timeout.as_millis())
                ),
            },
            None => call.await,
        };

        result.unwrap_or_else(|panic| {
            Err(sync_error!(
                ErrorKind::StepFailed,
                "Step capability panicked",
                panic_message(panic.as_ref())
            ))
        })
    }

    async fn call_capability(
        &self,
        step: &PipelineStepConfig,
        input: serde_json::Value,
    ) -> SyncResult<StepOutput> {
        match step.step_type {
            StepType::Extract => {
                let Some(extractor) = &self.capabilities.extractor else {
                    return Err(missing_capability(step));
                };
                extractor.extract(step).await
            }
            StepType::Transform => {
                let Some(transformer) = &self.capabilities.transformer else {
                    return Err(missing_capability(step));
                };
                transformer.transform(input, step).await
            }
            StepType::Load => {
                let Some(syncer) = &self.capabilities.syncer else {
                    return Err(missing_capability(step));
                };

                let table = target_table(step);
                let outcome = syncer.sync(input, table).await?;
                if !outcome.success {
                    bail!(
                        ErrorKind::SyncRejected,
                        "Sync reported failure",
                        format!("syncing into `{table}` did not succeed")
                    );
                }

                Ok(StepOutput::new(serde_json::json!({
                    "target_table": table,
                    "records_processed": outcome.records_processed,
                }))
                .with_metadata("record_count", outcome.records_processed))
            }
            StepType::Custom => {
                let Some(custom) = self.capabilities.custom_for(step) else {
                    return Err(missing_capability(step));
                };
                custom.run(input, step).await
            }
        }
    }

    /// Runs the data-quality gate on the last array output of the run.
    fn check_quality(
        &self,
        outputs: &HashMap<String, serde_json::Value>,
        progress: &mut RunProgress,
    ) -> SyncResult<()> {
        let records = self
            .config
            .steps
            .iter()
            .rev()
            .find_map(|step| outputs.get(&step.name).and_then(serde_json::Value::as_array));
        let Some(records) = records else {
            debug!(pipeline_id = %self.config.id, "no record output to check");
            return Ok(());
        };

        let report = self.quality_gate.check(records, Utc::now());
        if let Some(newest) = report.newest_record {
            self.monitor.record_data_freshness(newest);
        }
        progress.warnings.extend(report.warnings.iter().cloned());

        match report.to_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Moves the state to its terminal status and ends the monitored run.
    ///
    /// Returns the error the run failed with.
    async fn finish_run(&self, outcome: SyncResult<()>) -> Option<SyncError> {
        let err = match outcome {
            Ok(()) => {
                let update = StateUpdate::status(PipelineStatus::Completed)
                    .with_current_step(None)
                    .with_last_success_time(Utc::now());

                match self.state.update_state(update).await {
                    Ok(_) => {
                        self.monitor.end_pipeline(RunStatus::Success, None).await;
                        return None;
                    }
                    Err(err) if err.kind() != ErrorKind::LockConflict => {
                        warn!(pipeline_id = %self.config.id, error = %err.message(), "failed to record run completion");
                        self.monitor.end_pipeline(RunStatus::Success, None).await;
                        return None;
                    }
                    Err(err) => err,
                }
            }
            Err(err) => err,
        };

        // Step failures were recorded per attempt.
        if err.kind() != ErrorKind::StepFailed {
            self.monitor.record_error(&err, ErrorContext::default()).await;
        }

        let (status, run_status) = if err.kind() == ErrorKind::PipelineCancelled {
            (PipelineStatus::Cancelled, RunStatus::Cancelled)
        } else {
            (PipelineStatus::Failed, RunStatus::Failed)
        };
        if let Err(update_err) = self.state.update_state(StateUpdate::status(status)).await {
            warn!(
                pipeline_id = %self.config.id,
                %status,
                error = %update_err.message(),
                "failed to record run failure"
            );
        }
        self.monitor.end_pipeline(run_status, Some(&err)).await;

        error!(pipeline_id = %self.config.id, error = %err.message(), "pipeline run failed");

        Some(err)
    }

    async fn release_lock(&self) {
        match self.state.unlock_pipeline().await {
            Ok(true) => {}
            Ok(false) => debug!(pipeline_id = %self.config.id, "no pipeline lock to release"),
            Err(err) => {
                error!(pipeline_id = %self.config.id, error = %err.message(), "failed to release the pipeline lock")
            }
        }
    }

    /// Logs a failed bookkeeping write and carries on, unless the lock was lost.
    fn tolerate(&self, result: SyncResult<()>, operation: &str) -> SyncResult<()> {
        match result {
            Err(err) if err.kind() == ErrorKind::LockConflict => Err(err),
            Err(err) => {
                warn!(pipeline_id = %self.config.id, operation, error = %err.message(), "state write failed, continuing");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }
}

fn missing_capability(step: &PipelineStepConfig) -> SyncError {
    sync_error!(
        ErrorKind::ConfigError,
        "No capability registered for step",
        format!("step `{}` of type {}", step.name, step.step_type)
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }

    "unknown panic".to_string()
}
