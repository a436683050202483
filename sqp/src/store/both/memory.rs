use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::monitor::{ErrorRecord, LogRecord, RunMetrics};
use crate::state::{PipelineState, StateTransition};
use crate::store::monitor::MonitorStore;
use crate::store::state::StateStore;

#[derive(Debug, Default)]
struct Inner {
    states: BTreeMap<String, PipelineState>,
    /// Transitions per pipeline in insertion order.
    history: HashMap<String, Vec<StateTransition>>,
    runs: HashMap<Uuid, RunMetrics>,
    errors: Vec<ErrorRecord>,
    logs: Vec<LogRecord>,
}

/// In-memory implementation of [`StateStore`] and [`MonitorStore`].
///
/// Everything is lost when the process exits. Clones share the same data, which makes the store
/// usable by several managers and monitors at once, for example in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every error recorded for `pipeline_id`, oldest first.
    pub async fn errors(&self, pipeline_id: &str) -> Vec<ErrorRecord> {
        let inner = self.inner.lock().await;
        inner
            .errors
            .iter()
            .filter(|error| error.pipeline_id == pipeline_id)
            .cloned()
            .collect()
    }

    /// Returns every log entry recorded for `pipeline_id`, oldest first.
    pub async fn logs(&self, pipeline_id: &str) -> Vec<LogRecord> {
        let inner = self.inner.lock().await;
        inner
            .logs
            .iter()
            .filter(|log| log.pipeline_id == pipeline_id)
            .cloned()
            .collect()
    }
}

impl StateStore for MemoryStore {
    async fn get_pipeline_state(&self, pipeline_id: &str) -> SyncResult<Option<PipelineState>> {
        let inner = self.inner.lock().await;

        Ok(inner.states.get(pipeline_id).cloned())
    }

    async fn save_pipeline_state(&self, state: &PipelineState) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .states
            .insert(state.pipeline_id.clone(), state.clone());

        Ok(())
    }

    async fn try_replace_lock(
        &self,
        expected_lock_id: Option<Uuid>,
        state: &PipelineState,
    ) -> SyncResult<bool> {
        let mut inner = self.inner.lock().await;

        let stored_lock_id = inner
            .states
            .get(&state.pipeline_id)
            .and_then(|stored| stored.lock_id);
        if stored_lock_id != expected_lock_id {
            return Ok(false);
        }

        inner
            .states
            .insert(state.pipeline_id.clone(), state.clone());

        Ok(true)
    }

    async fn append_state_transition(&self, transition: &StateTransition) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .history
            .entry(transition.pipeline_id.clone())
            .or_default()
            .push(transition.clone());

        Ok(())
    }

    async fn get_state_history(
        &self,
        pipeline_id: &str,
        limit: usize,
        offset: usize,
    ) -> SyncResult<Vec<StateTransition>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .history
            .get(pipeline_id)
            .map(|history| {
                history
                    .iter()
                    .rev()
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_state_history_before(
        &self,
        pipeline_id: &str,
        cutoff: DateTime<Utc>,
    ) -> SyncResult<u64> {
        let mut inner = self.inner.lock().await;
        let Some(history) = inner.history.get_mut(pipeline_id) else {
            return Ok(0);
        };

        let before = history.len();
        history.retain(|transition| transition.created_at >= cutoff);

        Ok((before - history.len()) as u64)
    }
}

impl MonitorStore for MemoryStore {
    async fn save_run_metrics(&self, run: &RunMetrics) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner.runs.insert(run.run_id, run.clone());

        Ok(())
    }

    async fn get_recent_runs(&self, pipeline_id: &str, limit: usize) -> SyncResult<Vec<RunMetrics>> {
        let inner = self.inner.lock().await;

        let mut runs: Vec<RunMetrics> = inner
            .runs
            .values()
            .filter(|run| run.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        runs.truncate(limit);

        Ok(runs)
    }

    async fn insert_error(&self, error: &ErrorRecord) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner.errors.push(error.clone());

        Ok(())
    }

    async fn get_errors_since(
        &self,
        pipeline_id: &str,
        since: DateTime<Utc>,
    ) -> SyncResult<Vec<ErrorRecord>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .errors
            .iter()
            .rev()
            .filter(|error| error.pipeline_id == pipeline_id && error.created_at >= since)
            .cloned()
            .collect())
    }

    async fn insert_log(&self, log: &LogRecord) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner.logs.push(log.clone());

        Ok(())
    }

    async fn get_recent_logs(&self, pipeline_id: &str, limit: usize) -> SyncResult<Vec<LogRecord>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .logs
            .iter()
            .rev()
            .filter(|log| log.pipeline_id == pipeline_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_monitor_data_before(
        &self,
        pipeline_id: &str,
        cutoff: DateTime<Utc>,
    ) -> SyncResult<u64> {
        let mut inner = self.inner.lock().await;

        let runs_before = inner.runs.len();
        inner
            .runs
            .retain(|_, run| run.pipeline_id != pipeline_id || run.start_time >= cutoff);
        let errors_before = inner.errors.len();
        inner
            .errors
            .retain(|error| error.pipeline_id != pipeline_id || error.created_at >= cutoff);
        let logs_before = inner.logs.len();
        inner
            .logs
            .retain(|log| log.pipeline_id != pipeline_id || log.created_at >= cutoff);

        Ok((runs_before - inner.runs.len()
            + errors_before - inner.errors.len()
            + logs_before - inner.logs.len()) as u64)
    }
}
