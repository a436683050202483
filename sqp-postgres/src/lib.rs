//! Postgres persistence for sync pipelines.
//!
//! All tables live in the `sqp` schema, created by [`migrations::apply_store_migrations`].
//! Functions take a pool or executor and return raw rows; conversions into runtime types happen
//! in the core crate.

pub mod migrations;
pub mod monitor;
pub mod state;
pub mod types;
