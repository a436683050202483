//! Coordination primitives shared by the orchestrator and the runner.

pub mod shutdown;
