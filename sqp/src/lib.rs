//! Batch pipeline runtime that moves search query performance data from an analytical warehouse
//! into a relational store.
//!
//! The runtime is made of a few cooperating pieces:
//!
//! - [`pool::ConnectionPool`] hands out warehouse clients with health checks and idle eviction.
//! - [`aggregation`] buckets records into calendar periods and derives ratios, shares and
//!   period-over-period deltas.
//! - [`state::PipelineStateManager`] persists run status, step checkpoints and the single-flight
//!   lock of a pipeline.
//! - [`monitor::PipelineMonitor`] records run metrics and errors, evaluates alert thresholds and
//!   dispatches alerts to registered channels.
//! - [`pipeline::PipelineOrchestrator`] drives a run: it locks the pipeline, executes the
//!   configured steps with retries, checkpoints their output and always releases the lock.
//!
//! Persistence goes through the [`store`] traits, backed either by memory or by Postgres.

pub mod aggregation;
pub mod clients;
pub mod concurrency;
pub mod error;
mod macros;
pub mod metrics;
pub mod monitor;
pub mod pipeline;
pub mod pool;
pub mod schedule;
pub mod state;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
