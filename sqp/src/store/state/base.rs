use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::SyncResult;
use crate::state::{PipelineState, StateTransition};

/// Storage of pipeline state rows and their transition history.
///
/// The lock field is only ever written through [`StateStore::try_replace_lock`], which makes
/// the single-flight guarantee independent of how a store resolves write conflicts.
pub trait StateStore {
    /// Returns the state row of `pipeline_id`, if one was ever written.
    fn get_pipeline_state(
        &self,
        pipeline_id: &str,
    ) -> impl Future<Output = SyncResult<Option<PipelineState>>> + Send;

    /// Writes `state` unconditionally. Reserved for administrative resets.
    fn save_pipeline_state(
        &self,
        state: &PipelineState,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Atomically writes `state` if the stored lock id equals `expected_lock_id`.
    ///
    /// `None` matches an unlocked row as well as a missing row. Returns whether the write
    /// happened.
    fn try_replace_lock(
        &self,
        expected_lock_id: Option<Uuid>,
        state: &PipelineState,
    ) -> impl Future<Output = SyncResult<bool>> + Send;

    /// Appends an entry to the transition history.
    fn append_state_transition(
        &self,
        transition: &StateTransition,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Returns a page of the transition history, newest first.
    fn get_state_history(
        &self,
        pipeline_id: &str,
        limit: usize,
        offset: usize,
    ) -> impl Future<Output = SyncResult<Vec<StateTransition>>> + Send;

    /// Deletes history entries created before `cutoff` and returns how many were deleted.
    fn delete_state_history_before(
        &self,
        pipeline_id: &str,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = SyncResult<u64>> + Send;
}
