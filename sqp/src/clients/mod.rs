//! Warehouse clients handed out by [`crate::pool::ConnectionPool`].

mod base;
#[cfg(feature = "bigquery")]
pub mod bigquery;

pub use base::{ClientFactory, QueryCost, QueryParam, WarehouseClient};
