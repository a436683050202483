use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use sqp::clients::ClientFactory;
use sqp::clients::bigquery::BigQueryClientFactory;
use sqp::pipeline::{
    ExecuteOptions, PipelineOrchestrator, PipelineRunResult, StepCapabilities,
};
use sqp::pool::ConnectionPool;
use sqp::store::both::memory::MemoryStore;
use sqp::store::both::postgres::PostgresStore;
use sqp::store::monitor::MonitorStore;
use sqp::store::state::StateStore;
use sqp_config::shared::{
    IntoConnectOptions, PgConnectionConfig, PipelineConfig, RunnerConfig, StoreConfig,
    WebhookChannelConfig,
};
use sqp_postgres::migrations::apply_store_migrations;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::notification::{LOG_CHANNEL_NAME, TracingAlertChannel, WebhookAlertChannel};
use crate::schedule::CronCalculator;
use crate::steps::{AggregationTransformer, PostgresSyncer, WarehouseExtractor};

const SINK_MAX_CONNECTIONS: u32 = 4;

const SINK_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How the runner drives the pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Executes a single run and returns instead of following the schedule.
    pub once: bool,
    /// Resumes the first run from the checkpoints of the previous failed run.
    pub resume_from_failure: bool,
}

/// Starts the runner with the provided configuration.
///
/// Applies store migrations when the state lives in Postgres, wires the step capabilities and
/// alert channels into an orchestrator and runs the pipeline until a shutdown signal arrives.
pub async fn start_runner_with_config(
    config: RunnerConfig,
    options: RunOptions,
) -> RunnerResult<()> {
    info!(pipeline_id = %config.pipeline.id, "starting sqp runner");

    log_config(&config);

    match config.store.clone() {
        StoreConfig::Memory => {
            warn!("using memory store, pipeline state is lost on restart");
            run_with_store(config, MemoryStore::new(), options).await
        }
        StoreConfig::Postgres { connection } => {
            apply_store_migrations(&connection).await?;

            let store = PostgresStore::new(&connection);
            let result = run_with_store(config, store.clone(), options).await;
            store.close().await;

            result
        }
    }
}

async fn run_with_store<S>(config: RunnerConfig, store: S, options: RunOptions) -> RunnerResult<()>
where
    S: StateStore + MonitorStore + Clone + Send + Sync + 'static,
{
    let factory = BigQueryClientFactory::new(
        config.warehouse.project_id.clone(),
        config.warehouse.service_account_key.clone(),
    );
    let pool = ConnectionPool::new(factory, config.pool.clone());
    pool.warm_up().await?;

    let sink = create_sink_pool(&config.sink);
    let capabilities = StepCapabilities::new()
        .with_extractor(Arc::new(WarehouseExtractor::new(pool.clone())))
        .with_transformer(Arc::new(AggregationTransformer))
        .with_syncer(Arc::new(PostgresSyncer::new(sink.clone())));

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        config.pipeline,
        config.monitor,
        store,
        pool,
        capabilities,
        Arc::new(CronCalculator),
    )?);
    register_alert_channels(&orchestrator, &config.webhooks)?;

    let signal_handle = spawn_signal_listener(orchestrator.clone());

    let result = if options.once {
        run_once(&orchestrator, options).await
    } else {
        run_scheduled(&orchestrator, options).await
    };

    orchestrator.shutdown().await;
    signal_handle.abort();
    let _ = signal_handle.await;
    sink.close().await;

    info!("sqp runner stopped");

    result
}

fn create_sink_pool(config: &PgConnectionConfig) -> PgPool {
    PgPoolOptions::new()
        .min_connections(0)
        .max_connections(SINK_MAX_CONNECTIONS)
        .idle_timeout(Some(SINK_IDLE_TIMEOUT))
        .connect_lazy_with(config.with_db())
}

fn register_alert_channels<S, F>(
    orchestrator: &PipelineOrchestrator<S, F>,
    webhooks: &[WebhookChannelConfig],
) -> RunnerResult<()>
where
    S: StateStore + MonitorStore + Clone + Send + Sync + 'static,
    F: ClientFactory,
{
    let monitor = orchestrator.monitor();
    monitor.register_alert_channel(LOG_CHANNEL_NAME, Arc::new(TracingAlertChannel));

    for webhook in webhooks {
        let channel = WebhookAlertChannel::new(webhook)?;
        debug!(channel = channel.name(), "registering webhook alert channel");
        monitor.register_alert_channel(channel.name().to_string(), Arc::new(channel));
    }

    for name in &orchestrator.config().alert_channels {
        let known = name == LOG_CHANNEL_NAME || webhooks.iter().any(|webhook| &webhook.name == name);
        if !known {
            warn!(channel = %name, "alert channel is not configured, its alerts will be dropped");
        }
    }

    Ok(())
}

/// Shuts the orchestrator down on SIGINT or SIGTERM.
fn spawn_signal_listener<S, F>(
    orchestrator: Arc<PipelineOrchestrator<S, F>>,
) -> tokio::task::JoinHandle<()>
where
    S: StateStore + MonitorStore + Clone + Send + Sync + 'static,
    F: ClientFactory,
{
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(error = %err, "failed to register SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("sigint (ctrl+c) received, shutting down pipeline");
            }
            _ = sigterm.recv() => {
                info!("sigterm received, shutting down pipeline");
            }
        }

        orchestrator.shutdown().await;
    })
}

async fn run_once<S, F>(
    orchestrator: &PipelineOrchestrator<S, F>,
    options: RunOptions,
) -> RunnerResult<()>
where
    S: StateStore + MonitorStore + Clone + Send + Sync + 'static,
    F: ClientFactory,
{
    let result = orchestrator
        .execute(ExecuteOptions {
            resume_from_failure: options.resume_from_failure,
        })
        .await;
    log_run_result(orchestrator.config(), &result);

    if result.success {
        return Ok(());
    }

    Err(RunnerError::RunFailed {
        message: result.error.unwrap_or_default(),
        kind: result.error_kind,
    })
}

/// Runs the pipeline at every occurrence of its schedule until shutdown.
///
/// A run following a failed one resumes from its checkpoints.
async fn run_scheduled<S, F>(
    orchestrator: &PipelineOrchestrator<S, F>,
    options: RunOptions,
) -> RunnerResult<()>
where
    S: StateStore + MonitorStore + Clone + Send + Sync + 'static,
    F: ClientFactory,
{
    let mut shutdown_rx = orchestrator.shutdown_tx().subscribe();
    let mut execute_options = ExecuteOptions {
        resume_from_failure: options.resume_from_failure,
    };

    loop {
        let now = Utc::now();
        let next_run = orchestrator.calculate_next_run(now)?;
        let wait = (next_run - now).to_std().unwrap_or_default();

        info!(
            pipeline_id = %orchestrator.config().id,
            schedule = orchestrator.get_schedule(),
            %next_run,
            "waiting for next scheduled run"
        );

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown_rx.wait() => {
                info!("shutdown requested, leaving schedule loop");
                break;
            }
        }

        let result = orchestrator.execute(execute_options).await;
        log_run_result(orchestrator.config(), &result);

        execute_options = ExecuteOptions {
            resume_from_failure: !result.success && result.run_id.is_some(),
        };
    }

    Ok(())
}

fn log_run_result(pipeline: &PipelineConfig, result: &PipelineRunResult) {
    for warning in &result.warnings {
        warn!(pipeline_id = %pipeline.id, warning = %warning, "pipeline run warning");
    }

    if result.success {
        info!(
            pipeline_id = %pipeline.id,
            run_id = ?result.run_id,
            steps_completed = result.steps_completed,
            total_steps = result.total_steps,
            alerts = result.alerts.len(),
            "pipeline run succeeded"
        );
    } else {
        error!(
            pipeline_id = %pipeline.id,
            run_id = ?result.run_id,
            steps_completed = result.steps_completed,
            total_steps = result.total_steps,
            error_kind = ?result.error_kind,
            error = result.error.as_deref().unwrap_or_default(),
            "pipeline run failed"
        );
    }
}

fn log_config(config: &RunnerConfig) {
    let pipeline = &config.pipeline;
    debug!(
        pipeline_id = %pipeline.id,
        name = %pipeline.name,
        schedule = %pipeline.schedule,
        steps = pipeline.steps.len(),
        max_retries = pipeline.max_retries,
        retry_delay_ms = pipeline.retry_delay_ms,
        "using pipeline config"
    );
    debug!(
        min_clients = config.pool.min_clients,
        max_clients = config.pool.max_clients,
        acquire_timeout_ms = config.pool.acquire_timeout_ms,
        "using pool config"
    );
    debug!(project_id = %config.warehouse.project_id, "using bigquery warehouse config");

    match &config.store {
        StoreConfig::Memory => debug!("using memory store config"),
        StoreConfig::Postgres { connection } => debug!(
            host = %connection.host,
            port = connection.port,
            dbname = %connection.name,
            "using postgres store config"
        ),
    }

    debug!(
        host = %config.sink.host,
        port = config.sink.port,
        dbname = %config.sink.name,
        webhooks = config.webhooks.len(),
        "using sink config"
    );
}
