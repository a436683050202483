use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::PipelineStatus;

/// Outcome stored for a step checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

/// Persisted output of a step, used to resume a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCheckpoint {
    pub status: StepStatus,
    #[serde(default)]
    pub data: serde_json::Value,
    pub saved_at: DateTime<Utc>,
}

impl StepCheckpoint {
    pub fn completed(data: serde_json::Value) -> Self {
        Self {
            status: StepStatus::Completed,
            data,
            saved_at: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            data: serde_json::json!({ "error": error.into() }),
            saved_at: Utc::now(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// State row of a pipeline. One row exists per pipeline id and survives restarts.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineState {
    pub pipeline_id: String,
    pub status: PipelineStatus,
    /// Holder of the single-flight lock, if any.
    pub lock_id: Option<Uuid>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub current_step: Option<String>,
    pub step_data: BTreeMap<String, StepCheckpoint>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    /// State of a pipeline that never ran.
    pub fn idle(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            status: PipelineStatus::Idle,
            lock_id: None,
            locked_at: None,
            last_run_time: None,
            last_success_time: None,
            current_step: None,
            step_data: BTreeMap::new(),
            metadata: serde_json::Map::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock_id.is_some()
    }

    /// Returns whether the lock was taken longer than `stale_after` ago.
    ///
    /// A lock without a timestamp is treated as stale.
    pub fn is_lock_stale(&self, now: DateTime<Utc>, stale_after: std::time::Duration) -> bool {
        let Some(locked_at) = self.locked_at else {
            return true;
        };

        match chrono::Duration::from_std(stale_after) {
            Ok(stale_after) => now - locked_at > stale_after,
            Err(_) => false,
        }
    }
}

/// Partial update applied by [`crate::state::PipelineStateManager::update_state`].
///
/// `None` fields are left untouched. Metadata entries are merged into the existing map.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub status: Option<PipelineStatus>,
    pub current_step: Option<Option<String>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl StateUpdate {
    pub fn status(status: PipelineStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_current_step(mut self, step: Option<String>) -> Self {
        self.current_step = Some(step);
        self
    }

    pub fn with_last_run_time(mut self, time: DateTime<Utc>) -> Self {
        self.last_run_time = Some(time);
        self
    }

    pub fn with_last_success_time(mut self, time: DateTime<Utc>) -> Self {
        self.last_success_time = Some(time);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub(crate) fn apply_to(self, state: &mut PipelineState) {
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(current_step) = self.current_step {
            state.current_step = current_step;
        }
        if let Some(time) = self.last_run_time {
            state.last_run_time = Some(time);
        }
        if let Some(time) = self.last_success_time {
            state.last_success_time = Some(time);
        }
        state.metadata.extend(self.metadata);
    }
}

/// Entry of the status transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub pipeline_id: String,
    /// `None` for the first row of a pipeline.
    pub from_status: Option<PipelineStatus>,
    pub to_status: PipelineStatus,
    /// Set for stale-lock takeovers and administrative resets.
    pub forced: bool,
    pub lock_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Where a failed run can be resumed from. Derived from [`PipelineState`], never stored.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecoveryPoint {
    pub can_recover: bool,
    pub last_completed_step: Option<String>,
    pub next_step: Option<String>,
    /// Outputs of the completed steps, keyed by step name.
    pub step_data: BTreeMap<String, serde_json::Value>,
}

impl RecoveryPoint {
    /// Derives the recovery point from the checkpoints of `state`, following `step_order`.
    ///
    /// Only the leading run of completed steps counts: a gap stops the scan.
    pub fn derive(state: &PipelineState, step_order: &[String]) -> Self {
        let mut recovery = RecoveryPoint::default();

        for (index, step) in step_order.iter().enumerate() {
            match state.step_data.get(step) {
                Some(checkpoint) if checkpoint.is_completed() => {
                    recovery.last_completed_step = Some(step.clone());
                    recovery
                        .step_data
                        .insert(step.clone(), checkpoint.data.clone());
                    recovery.next_step = step_order.get(index + 1).cloned();
                }
                _ => {
                    if recovery.last_completed_step.is_none() {
                        recovery.next_step = Some(step.clone());
                    }
                    break;
                }
            }
        }

        recovery.can_recover =
            recovery.last_completed_step.is_some() && recovery.next_step.is_some();

        recovery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn steps() -> Vec<String> {
        vec!["extract".into(), "transform".into(), "load".into()]
    }

    #[test]
    fn recovery_resumes_after_last_completed_step() {
        let mut state = PipelineState::idle("sqp");
        state
            .step_data
            .insert("extract".into(), StepCheckpoint::completed(json!([1, 2])));
        state
            .step_data
            .insert("transform".into(), StepCheckpoint::failed("boom"));

        let recovery = RecoveryPoint::derive(&state, &steps());

        assert!(recovery.can_recover);
        assert_eq!(recovery.last_completed_step.as_deref(), Some("extract"));
        assert_eq!(recovery.next_step.as_deref(), Some("transform"));
        assert_eq!(recovery.step_data["extract"], json!([1, 2]));
    }

    #[test]
    fn nothing_to_recover_without_checkpoints_or_when_all_steps_completed() {
        let state = PipelineState::idle("sqp");
        let recovery = RecoveryPoint::derive(&state, &steps());
        assert!(!recovery.can_recover);
        assert_eq!(recovery.next_step.as_deref(), Some("extract"));

        let mut state = PipelineState::idle("sqp");
        for step in steps() {
            state
                .step_data
                .insert(step, StepCheckpoint::completed(json!(null)));
        }
        let recovery = RecoveryPoint::derive(&state, &steps());
        assert!(!recovery.can_recover);
        assert_eq!(recovery.last_completed_step.as_deref(), Some("load"));
        assert_eq!(recovery.next_step, None);
    }

    #[test]
    fn lock_staleness_uses_locked_at() {
        let now = Utc::now();
        let mut state = PipelineState::idle("sqp");
        state.lock_id = Some(Uuid::new_v4());
        state.locked_at = Some(now - chrono::Duration::minutes(6));

        let five_minutes = std::time::Duration::from_secs(300);
        assert!(state.is_lock_stale(now, five_minutes));

        state.locked_at = Some(now - chrono::Duration::minutes(1));
        assert!(!state.is_lock_stale(now, five_minutes));
    }

    #[test]
    fn update_merges_metadata_and_keeps_untouched_fields() {
        let mut state = PipelineState::idle("sqp");
        state.current_step = Some("extract".into());
        state.metadata.insert("a".into(), json!(1));

        StateUpdate::status(PipelineStatus::Locked)
            .with_metadata("b", json!(2))
            .apply_to(&mut state);

        assert_eq!(state.status, PipelineStatus::Locked);
        assert_eq!(state.current_step.as_deref(), Some("extract"));
        assert_eq!(state.metadata.len(), 2);
    }
}
