//! Persisted pipeline state: status machine, step checkpoints and the single-flight lock.

mod manager;
mod pipeline;
mod status;

pub use manager::{HistoryQuery, PipelineStateManager};
pub use pipeline::{
    PipelineState, RecoveryPoint, StateTransition, StateUpdate, StepCheckpoint, StepStatus,
};
pub use status::PipelineStatus;
