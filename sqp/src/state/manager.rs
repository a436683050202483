use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use sqp_config::shared::PipelineConfig;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, SyncResult};
use crate::state::{
    PipelineState, PipelineStatus, RecoveryPoint, StateTransition, StateUpdate, StepCheckpoint,
};
use crate::store::state::StateStore;
use crate::types::PipelineId;
use crate::{bail, sync_error};

/// Page of the transition history requested through [`PipelineStateManager::get_history`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryQuery {
    pub limit: usize,
    pub offset: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Sole writer of the state row of one pipeline.
///
/// The manager remembers the lock id it acquired, so writes made while holding the lock fail
/// with [`ErrorKind::LockConflict`] once another run took the lock over.
#[derive(Debug)]
pub struct PipelineStateManager<S> {
    pipeline_id: PipelineId,
    step_order: Vec<String>,
    stale_lock_timeout: Duration,
    store: S,
    held_lock: Mutex<Option<Uuid>>,
}

impl<S> PipelineStateManager<S>
where
    S: StateStore + Send + Sync,
{
    pub fn new(config: &PipelineConfig, store: S) -> Self {
        Self {
            pipeline_id: config.id.clone(),
            step_order: config.step_names(),
            stale_lock_timeout: config.stale_lock_timeout(),
            store,
            held_lock: Mutex::new(None),
        }
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// Lock id acquired by this manager and not yet released.
    pub fn held_lock(&self) -> Option<Uuid> {
        *self.held_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_held_lock(&self, lock_id: Option<Uuid>) {
        *self.held_lock.lock().unwrap_or_else(PoisonError::into_inner) = lock_id;
    }

    /// Returns the stored state, or an idle state if the pipeline never ran.
    pub async fn get_state(&self) -> SyncResult<PipelineState> {
        let state = self.store.get_pipeline_state(&self.pipeline_id).await?;

        Ok(state.unwrap_or_else(|| PipelineState::idle(self.pipeline_id.clone())))
    }

    /// Applies a partial update and records a transition when the status changes.
    ///
    /// Fails with [`ErrorKind::InvalidStateTransition`] for illegal status changes.
    pub async fn update_state(&self, update: StateUpdate) -> SyncResult<PipelineState> {
        let (previous, state) = self
            .modify(|state| {
                if let Some(next) = update.status {
                    if !state.status.can_transition_to(next) {
                        bail!(
                            ErrorKind::InvalidStateTransition,
                            "Illegal pipeline status transition",
                            format!("{} -> {}", state.status, next)
                        );
                    }
                }
                update.apply_to(state);

                Ok(())
            })
            .await?;

        if previous.status != state.status {
            debug!(
                pipeline_id = %self.pipeline_id,
                from = %previous.status,
                to = %state.status,
                "pipeline status changed"
            );
            self.record_transition(Some(previous.status), &state, false, serde_json::Map::new())
                .await;
        }

        Ok(state)
    }

    /// Tries to take the single-flight lock of the pipeline.
    ///
    /// Returns `false` without waiting when another holder owns a lock younger than the stale
    /// lock timeout. A stale lock is replaced by a new lock id and the takeover is recorded as a
    /// forced transition.
    pub async fn lock_pipeline(&self) -> SyncResult<bool> {
        let stored = self.store.get_pipeline_state(&self.pipeline_id).await?;
        let exists = stored.is_some();
        let current = stored.unwrap_or_else(|| PipelineState::idle(self.pipeline_id.clone()));
        let now = Utc::now();

        let mut forced = false;
        if current.is_locked() {
            if !current.is_lock_stale(now, self.stale_lock_timeout) {
                info!(
                    pipeline_id = %self.pipeline_id,
                    lock_id = ?current.lock_id,
                    "pipeline is locked by another run"
                );
                return Ok(false);
            }

            warn!(
                pipeline_id = %self.pipeline_id,
                stale_lock_id = ?current.lock_id,
                locked_at = ?current.locked_at,
                "taking over stale pipeline lock"
            );
            forced = true;
        } else if !current.status.can_transition_to(PipelineStatus::Locked) {
            // An unlocked row outside of idle is left over from an interrupted unlock.
            forced = true;
        }

        let lock_id = Uuid::new_v4();
        let mut next = current.clone();
        next.status = PipelineStatus::Locked;
        next.lock_id = Some(lock_id);
        next.locked_at = Some(now);
        next.last_run_time = Some(now);
        next.current_step = None;
        next.updated_at = now;

        if !self.store.try_replace_lock(current.lock_id, &next).await? {
            info!(pipeline_id = %self.pipeline_id, "pipeline lock was acquired concurrently");
            return Ok(false);
        }
        self.set_held_lock(Some(lock_id));

        let mut metadata = serde_json::Map::new();
        if let Some(previous_lock_id) = current.lock_id {
            metadata.insert(
                "previous_lock_id".to_string(),
                serde_json::Value::String(previous_lock_id.to_string()),
            );
        }
        let from_status = exists.then_some(current.status);
        self.record_transition(from_status, &next, forced, metadata).await;

        info!(pipeline_id = %self.pipeline_id, %lock_id, forced, "pipeline locked");

        Ok(true)
    }

    /// Releases the lock acquired by this manager and returns the pipeline to idle.
    ///
    /// Step checkpoints are kept for recovery. Returns `false` when this manager holds no lock
    /// or the lock was taken over by another holder, which is left untouched.
    pub async fn unlock_pipeline(&self) -> SyncResult<bool> {
        let Some(lock_id) = self.held_lock() else {
            debug!(pipeline_id = %self.pipeline_id, "no pipeline lock held, nothing to release");
            return Ok(false);
        };

        let current = self.get_state().await?;
        if current.lock_id != Some(lock_id) {
            warn!(
                pipeline_id = %self.pipeline_id,
                %lock_id,
                current_lock_id = ?current.lock_id,
                "pipeline lock was taken over, leaving it in place"
            );
            self.set_held_lock(None);
            return Ok(false);
        }

        let now = Utc::now();
        let mut next = current.clone();
        // A run interrupted while running is cancelled on its way back to idle.
        let interrupted = current.status == PipelineStatus::Running;
        next.status = PipelineStatus::Idle;
        next.lock_id = None;
        next.locked_at = None;
        next.current_step = None;
        next.updated_at = now;

        if !self.store.try_replace_lock(Some(lock_id), &next).await? {
            warn!(pipeline_id = %self.pipeline_id, %lock_id, "pipeline lock changed while unlocking");
            self.set_held_lock(None);
            return Ok(false);
        }
        self.set_held_lock(None);

        let mut from_status = current.status;
        if interrupted {
            let mut cancelled = current.clone();
            cancelled.status = PipelineStatus::Cancelled;
            self.record_transition(Some(from_status), &cancelled, false, serde_json::Map::new())
                .await;
            from_status = PipelineStatus::Cancelled;
        }
        if from_status != PipelineStatus::Idle {
            self.record_transition(Some(from_status), &next, false, serde_json::Map::new())
                .await;
        }

        info!(pipeline_id = %self.pipeline_id, %lock_id, "pipeline unlocked");

        Ok(true)
    }

    /// Checkpoints the output of a completed step.
    pub async fn save_step_data(&self, step: &str, data: serde_json::Value) -> SyncResult<()> {
        self.modify(|state| {
            state
                .step_data
                .insert(step.to_string(), StepCheckpoint::completed(data));
            state.current_step = Some(step.to_string());

            Ok(())
        })
        .await?;

        Ok(())
    }

    /// Marks a step as failed without discarding earlier checkpoints.
    pub async fn mark_step_failed(&self, step: &str, error: &str) -> SyncResult<()> {
        self.modify(|state| {
            state
                .step_data
                .insert(step.to_string(), StepCheckpoint::failed(error));
            state.current_step = Some(step.to_string());

            Ok(())
        })
        .await?;

        Ok(())
    }

    /// Returns the checkpointed output of a completed step.
    pub async fn get_step_data(&self, step: &str) -> SyncResult<Option<serde_json::Value>> {
        let state = self.get_state().await?;

        Ok(state
            .step_data
            .get(step)
            .filter(|checkpoint| checkpoint.is_completed())
            .map(|checkpoint| checkpoint.data.clone()))
    }

    pub async fn clear_step_data(&self) -> SyncResult<()> {
        self.modify(|state| {
            state.step_data.clear();
            state.current_step = None;

            Ok(())
        })
        .await?;

        Ok(())
    }

    /// Derives where a failed run can resume, following the configured step order.
    pub async fn get_recovery_point(&self) -> SyncResult<RecoveryPoint> {
        let state = self.get_state().await?;

        Ok(RecoveryPoint::derive(&state, &self.step_order))
    }

    /// Returns a page of status transitions, newest first.
    pub async fn get_history(&self, query: HistoryQuery) -> SyncResult<Vec<StateTransition>> {
        self.store
            .get_state_history(&self.pipeline_id, query.limit, query.offset)
            .await
    }

    /// Deletes transitions older than `days_to_keep` days and returns how many were deleted.
    pub async fn cleanup_history(&self, days_to_keep: u32) -> SyncResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days_to_keep));
        let deleted = self
            .store
            .delete_state_history_before(&self.pipeline_id, cutoff)
            .await?;

        info!(pipeline_id = %self.pipeline_id, deleted, days_to_keep, "state history cleaned up");

        Ok(deleted)
    }

    /// Forces the pipeline back to idle, dropping any lock, checkpoints and metadata.
    pub async fn reset(&self) -> SyncResult<()> {
        let current = self.get_state().await?;

        let mut next = PipelineState::idle(self.pipeline_id.clone());
        next.last_run_time = current.last_run_time;
        next.last_success_time = current.last_success_time;
        self.store.save_pipeline_state(&next).await?;
        self.set_held_lock(None);

        if current.status != PipelineStatus::Idle || current.is_locked() {
            self.record_transition(Some(current.status), &next, true, serde_json::Map::new())
                .await;
        }

        warn!(pipeline_id = %self.pipeline_id, previous_status = %current.status, "pipeline state reset");

        Ok(())
    }

    /// Reads the state, applies `change` and writes it back with a compare-and-set on the lock.
    ///
    /// Returns the previous and the written state.
    async fn modify<Change>(&self, change: Change) -> SyncResult<(PipelineState, PipelineState)>
    where
        Change: FnOnce(&mut PipelineState) -> SyncResult<()>,
    {
        let previous = self.get_state().await?;

        if let Some(held) = self.held_lock() {
            if previous.lock_id != Some(held) {
                bail!(
                    ErrorKind::LockConflict,
                    "Pipeline lock is held by another run",
                    format!(
                        "lock {held} was replaced by {:?} for pipeline {}",
                        previous.lock_id, self.pipeline_id
                    )
                );
            }
        }

        let mut next = previous.clone();
        change(&mut next)?;
        next.updated_at = Utc::now();

        if !self.store.try_replace_lock(previous.lock_id, &next).await? {
            return Err(sync_error!(
                ErrorKind::LockConflict,
                "Pipeline state changed concurrently",
                format!("the lock of pipeline {} changed during the update", self.pipeline_id)
            ));
        }

        Ok((previous, next))
    }

    /// Appends a transition to the history. Failures are logged and never propagated.
    async fn record_transition(
        &self,
        from_status: Option<PipelineStatus>,
        state: &PipelineState,
        forced: bool,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) {
        let transition = StateTransition {
            pipeline_id: self.pipeline_id.clone(),
            from_status,
            to_status: state.status,
            forced,
            lock_id: state.lock_id,
            metadata,
            created_at: Utc::now(),
        };

        if let Err(err) = self.store.append_state_transition(&transition).await {
            warn!(
                pipeline_id = %self.pipeline_id,
                error = %err.message(),
                "failed to record state transition"
            );
        }
    }
}
