//! Persistence of pipeline state and monitoring data.
//!
//! [`state::StateStore`] and [`monitor::MonitorStore`] abstract the relational metadata store.
//! [`both::memory::MemoryStore`] and [`both::postgres::PostgresStore`] implement both.

pub mod both;
pub mod monitor;
pub mod state;
