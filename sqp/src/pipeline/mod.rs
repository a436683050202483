//! Step execution: the orchestrator, its injected step capabilities, retry policy and the
//! data-quality gate applied to the final output of a run.

mod orchestrator;
pub mod policy;
mod quality;
mod result;
mod step;

pub use orchestrator::PipelineOrchestrator;
pub use quality::{QualityGate, QualityReport};
pub use result::{ALREADY_RUNNING_MESSAGE, ExecuteOptions, PipelineRunResult};
pub use step::{
    CustomStep, Extractor, StepCapabilities, StepOutput, SyncOutcome, Syncer, Transformer,
    target_table,
};
