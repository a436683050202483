use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use sqp_config::shared::{IntoConnectOptions, LogLevel, PgConnectionConfig};
use sqp_postgres::monitor::{self as monitor_rows, PipelineErrorRow, PipelineLogRow, RunMetricsRow};
use sqp_postgres::state::{self as state_rows, PipelineStateRow, StateTransitionRow};
use sqp_postgres::types::PipelineStatusType;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::monitor::{ErrorRecord, LogRecord, RunMetrics, RunStatus};
use crate::state::{PipelineState, PipelineStatus, StateTransition};
use crate::store::monitor::MonitorStore;
use crate::store::state::StateStore;
use crate::sync_error;

/// Maximum number of connections in the pool.
const MAX_POOL_CONNECTIONS: u32 = 2;

/// Duration after which idle connections are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates a lazily connected pool whose idle connections are closed after [`IDLE_TIMEOUT`].
///
/// Runs are short and far apart, so connections are only kept open while a run is writing.
fn create_database_pool(config: &PgConnectionConfig) -> PgPool {
    let options = config.with_db();

    PgPoolOptions::new()
        .min_connections(0)
        .max_connections(MAX_POOL_CONNECTIONS)
        .idle_timeout(Some(IDLE_TIMEOUT))
        .connect_lazy_with(options)
}

impl From<PipelineStatus> for PipelineStatusType {
    fn from(value: PipelineStatus) -> Self {
        match value {
            PipelineStatus::Idle => PipelineStatusType::Idle,
            PipelineStatus::Locked => PipelineStatusType::Locked,
            PipelineStatus::Running => PipelineStatusType::Running,
            PipelineStatus::Completed => PipelineStatusType::Completed,
            PipelineStatus::Failed => PipelineStatusType::Failed,
            PipelineStatus::Cancelled => PipelineStatusType::Cancelled,
        }
    }
}

impl From<PipelineStatusType> for PipelineStatus {
    fn from(value: PipelineStatusType) -> Self {
        match value {
            PipelineStatusType::Idle => PipelineStatus::Idle,
            PipelineStatusType::Locked => PipelineStatus::Locked,
            PipelineStatusType::Running => PipelineStatus::Running,
            PipelineStatusType::Completed => PipelineStatus::Completed,
            PipelineStatusType::Failed => PipelineStatus::Failed,
            PipelineStatusType::Cancelled => PipelineStatus::Cancelled,
        }
    }
}

impl TryFrom<&PipelineState> for PipelineStateRow {
    type Error = SyncError;

    fn try_from(state: &PipelineState) -> Result<Self, Self::Error> {
        Ok(PipelineStateRow {
            pipeline_id: state.pipeline_id.clone(),
            status: state.status.into(),
            lock_id: state.lock_id,
            locked_at: state.locked_at,
            last_run_time: state.last_run_time,
            last_success_time: state.last_success_time,
            current_step: state.current_step.clone(),
            step_data: serde_json::to_value(&state.step_data)?,
            metadata: serde_json::Value::Object(state.metadata.clone()),
            updated_at: state.updated_at,
        })
    }
}

impl TryFrom<PipelineStateRow> for PipelineState {
    type Error = SyncError;

    fn try_from(row: PipelineStateRow) -> Result<Self, Self::Error> {
        Ok(PipelineState {
            pipeline_id: row.pipeline_id,
            status: row.status.into(),
            lock_id: row.lock_id,
            locked_at: row.locked_at,
            last_run_time: row.last_run_time,
            last_success_time: row.last_success_time,
            current_step: row.current_step,
            step_data: serde_json::from_value(row.step_data)?,
            metadata: json_object(row.metadata),
            updated_at: row.updated_at,
        })
    }
}

impl From<&RunMetrics> for RunMetricsRow {
    fn from(run: &RunMetrics) -> Self {
        RunMetricsRow {
            run_id: run.run_id,
            pipeline_id: run.pipeline_id.clone(),
            status: run.status.as_static_str().to_string(),
            start_time: run.start_time,
            end_time: run.end_time,
            duration_ms: run.duration_ms.map(|duration| duration as i64),
            records_processed: run.records_processed as i64,
            steps: serde_json::to_value(&run.steps).unwrap_or_default(),
            error: run.error.clone(),
        }
    }
}

impl TryFrom<RunMetricsRow> for RunMetrics {
    type Error = SyncError;

    fn try_from(row: RunMetricsRow) -> Result<Self, Self::Error> {
        let status: RunStatus = row.status.parse().map_err(|err: String| {
            sync_error!(ErrorKind::InvalidData, "Invalid run status in metrics row", err)
        })?;

        Ok(RunMetrics {
            run_id: row.run_id,
            pipeline_id: row.pipeline_id,
            status,
            start_time: row.start_time,
            end_time: row.end_time,
            duration_ms: row.duration_ms.map(|duration| duration.max(0) as u64),
            records_processed: row.records_processed.max(0) as u64,
            steps: serde_json::from_value(row.steps)?,
            error: row.error,
        })
    }
}

fn json_object(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

fn page_size(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Postgres implementation of [`StateStore`] and [`MonitorStore`] over the `sqp` schema.
///
/// Every call goes to the database, there is no cache: the lock compare-and-set must observe
/// writes of other processes.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a store over a lazily connected pool. No connection is opened until first use.
    pub fn new(config: &PgConnectionConfig) -> Self {
        Self {
            pool: create_database_pool(config),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl StateStore for PostgresStore {
    async fn get_pipeline_state(&self, pipeline_id: &str) -> SyncResult<Option<PipelineState>> {
        let row = state_rows::get_pipeline_state(&self.pool, pipeline_id).await?;

        row.map(PipelineState::try_from).transpose()
    }

    async fn save_pipeline_state(&self, state: &PipelineState) -> SyncResult<()> {
        let row = PipelineStateRow::try_from(state)?;
        state_rows::upsert_pipeline_state(&self.pool, &row).await?;

        Ok(())
    }

    async fn try_replace_lock(
        &self,
        expected_lock_id: Option<Uuid>,
        state: &PipelineState,
    ) -> SyncResult<bool> {
        let row = PipelineStateRow::try_from(state)?;
        let replaced = state_rows::try_replace_pipeline_lock(&self.pool, expected_lock_id, &row).await?;

        debug!(
            pipeline_id = %state.pipeline_id,
            expected_lock_id = ?expected_lock_id,
            replaced,
            "pipeline state compare-and-set"
        );

        Ok(replaced)
    }

    async fn append_state_transition(&self, transition: &StateTransition) -> SyncResult<()> {
        let row = StateTransitionRow {
            pipeline_id: transition.pipeline_id.clone(),
            from_status: transition.from_status.map(Into::into),
            to_status: transition.to_status.into(),
            forced: transition.forced,
            lock_id: transition.lock_id,
            metadata: serde_json::Value::Object(transition.metadata.clone()),
            created_at: transition.created_at,
        };
        state_rows::insert_state_transition(&self.pool, &row).await?;

        Ok(())
    }

    async fn get_state_history(
        &self,
        pipeline_id: &str,
        limit: usize,
        offset: usize,
    ) -> SyncResult<Vec<StateTransition>> {
        let rows = state_rows::get_state_history(
            &self.pool,
            pipeline_id,
            page_size(limit),
            page_size(offset),
        )
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StateTransition {
                pipeline_id: row.pipeline_id,
                from_status: row.from_status.map(Into::into),
                to_status: row.to_status.into(),
                forced: row.forced,
                lock_id: row.lock_id,
                metadata: json_object(row.metadata),
                created_at: row.created_at,
            })
            .collect())
    }

    async fn delete_state_history_before(
        &self,
        pipeline_id: &str,
        cutoff: DateTime<Utc>,
    ) -> SyncResult<u64> {
        Ok(state_rows::delete_state_history_before(&self.pool, pipeline_id, cutoff).await?)
    }
}

impl MonitorStore for PostgresStore {
    async fn save_run_metrics(&self, run: &RunMetrics) -> SyncResult<()> {
        monitor_rows::upsert_run_metrics(&self.pool, &RunMetricsRow::from(run)).await?;

        Ok(())
    }

    async fn get_recent_runs(&self, pipeline_id: &str, limit: usize) -> SyncResult<Vec<RunMetrics>> {
        let rows = monitor_rows::get_recent_runs(&self.pool, pipeline_id, page_size(limit)).await?;

        rows.into_iter().map(RunMetrics::try_from).collect()
    }

    async fn insert_error(&self, error: &ErrorRecord) -> SyncResult<()> {
        let row = PipelineErrorRow {
            pipeline_id: error.pipeline_id.clone(),
            run_id: error.run_id,
            step: error.step.clone(),
            error_kind: error.error_kind.clone(),
            message: error.message.clone(),
            context: serde_json::Value::Object(error.context.clone()),
            created_at: error.created_at,
        };
        monitor_rows::insert_pipeline_error(&self.pool, &row).await?;

        Ok(())
    }

    async fn get_errors_since(
        &self,
        pipeline_id: &str,
        since: DateTime<Utc>,
    ) -> SyncResult<Vec<ErrorRecord>> {
        let rows = monitor_rows::get_errors_since(&self.pool, pipeline_id, since).await?;

        Ok(rows
            .into_iter()
            .map(|row| ErrorRecord {
                pipeline_id: row.pipeline_id,
                run_id: row.run_id,
                step: row.step,
                error_kind: row.error_kind,
                message: row.message,
                context: json_object(row.context),
                created_at: row.created_at,
            })
            .collect())
    }

    async fn insert_log(&self, log: &LogRecord) -> SyncResult<()> {
        let row = PipelineLogRow {
            pipeline_id: log.pipeline_id.clone(),
            run_id: log.run_id,
            level: log.level.as_static_str().to_string(),
            message: log.message.clone(),
            metadata: serde_json::Value::Object(log.metadata.clone()),
            created_at: log.created_at,
        };
        monitor_rows::insert_pipeline_log(&self.pool, &row).await?;

        Ok(())
    }

    async fn get_recent_logs(&self, pipeline_id: &str, limit: usize) -> SyncResult<Vec<LogRecord>> {
        let rows = monitor_rows::get_recent_logs(&self.pool, pipeline_id, page_size(limit)).await?;

        rows.into_iter()
            .map(|row| {
                let level: LogLevel = row.level.parse().map_err(|err: String| {
                    sync_error!(ErrorKind::InvalidData, "Invalid level in log row", err)
                })?;

                Ok(LogRecord {
                    pipeline_id: row.pipeline_id,
                    run_id: row.run_id,
                    level,
                    message: row.message,
                    metadata: json_object(row.metadata),
                    created_at: row.created_at,
                })
            })
            .collect()
    }

    async fn delete_monitor_data_before(
        &self,
        pipeline_id: &str,
        cutoff: DateTime<Utc>,
    ) -> SyncResult<u64> {
        Ok(monitor_rows::delete_monitor_data_before(&self.pool, pipeline_id, cutoff).await?)
    }
}
