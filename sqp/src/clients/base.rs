use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::types::Record;

/// Price of scanning one tebibyte with on-demand warehouse pricing, in USD.
pub const COST_PER_TIB_USD: f64 = 6.25;

const BYTES_PER_TIB: f64 = 1024.0 * 1024.0 * 1024.0 * 1024.0;

/// A named query parameter, referenced as `@name` in SQL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParam {
    pub name: String,
    pub value: serde_json::Value,
}

impl QueryParam {
    pub fn new(name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Estimated cost of running a query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueryCost {
    pub bytes_processed: u64,
    pub cost_usd: f64,
}

impl QueryCost {
    /// Prices `bytes_processed` at [`COST_PER_TIB_USD`].
    pub fn from_bytes(bytes_processed: u64) -> Self {
        Self {
            bytes_processed,
            cost_usd: bytes_processed as f64 / BYTES_PER_TIB * COST_PER_TIB_USD,
        }
    }
}

/// A connection to the analytical warehouse.
///
/// Clients are owned by the pool and used by one caller at a time.
pub trait WarehouseClient: Send + Sync + 'static {
    /// Runs `sql` with named parameters and returns every row.
    fn query(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> impl Future<Output = SyncResult<Vec<Record>>> + Send;

    /// Returns whether the client can still serve queries.
    fn test_connection(&self) -> impl Future<Output = bool> + Send;

    /// Estimates the bytes scanned by `sql` without running it.
    fn estimate_query_cost(&self, sql: &str) -> impl Future<Output = SyncResult<QueryCost>> + Send;

    /// Releases the resources held by the client.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Creates new warehouse clients for the pool.
pub trait ClientFactory: Send + Sync + 'static {
    type Client: WarehouseClient;

    fn create_client(&self) -> impl Future<Output = SyncResult<Self::Client>> + Send;
}
