use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a pipeline as persisted in its state row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Idle,
    Locked,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn as_static_str(&self) -> &'static str {
        match self {
            PipelineStatus::Idle => "idle",
            PipelineStatus::Locked => "locked",
            PipelineStatus::Running => "running",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Cancelled => "cancelled",
        }
    }

    /// Returns whether moving from `self` to `next` is a legal transition.
    ///
    /// Writing the same status again is always allowed and is not a transition.
    pub fn can_transition_to(&self, next: PipelineStatus) -> bool {
        use PipelineStatus::*;

        if *self == next {
            return true;
        }

        matches!(
            (*self, next),
            (_, Cancelled)
                | (Idle, Locked)
                | (Locked, Running)
                | (Locked, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Locked | Completed | Failed | Cancelled, Idle)
        )
    }

    /// Returns whether the status ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Failed | PipelineStatus::Cancelled
        )
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_static_str())
    }
}
