//! Tracing and metrics setup shared by the sync runtime binaries and tests.

pub mod metrics;
pub mod tracing;
