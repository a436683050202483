use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::bail;
use crate::clients::{ClientFactory, QueryCost, QueryParam, WarehouseClient};
use crate::error::{ErrorKind, SyncResult};
use crate::types::Record;

#[derive(Debug)]
struct Shared {
    created: AtomicU64,
    closed: AtomicU64,
    healthy: AtomicBool,
    fail_creation: AtomicBool,
    health_check_delay_ms: AtomicU64,
    rows: Vec<Record>,
}

/// Factory of [`MockClient`]s with switches for health and creation failures.
///
/// Every client gets a unique identity, which lets tests tell reused clients from new ones.
#[derive(Debug, Clone)]
pub struct MockClientFactory {
    shared: Arc<Shared>,
}

impl MockClientFactory {
    pub fn new() -> Self {
        Self::with_rows(Vec::new())
    }

    /// Clients answer every query with `rows`.
    pub fn with_rows(rows: Vec<Record>) -> Self {
        Self {
            shared: Arc::new(Shared {
                created: AtomicU64::new(0),
                closed: AtomicU64::new(0),
                healthy: AtomicBool::new(true),
                fail_creation: AtomicBool::new(false),
                health_check_delay_ms: AtomicU64::new(0),
                rows,
            }),
        }
    }

    /// Makes the health check of every client, existing or future, return `healthy`.
    pub fn set_healthy(&self, healthy: bool) {
        self.shared.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_fail_creation(&self, fail: bool) {
        self.shared.fail_creation.store(fail, Ordering::SeqCst);
    }

    /// Makes every health check take `delay` before answering.
    pub fn set_health_check_delay(&self, delay: Duration) {
        self.shared
            .health_check_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn created(&self) -> u64 {
        self.shared.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Default for MockClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientFactory for MockClientFactory {
    type Client = MockClient;

    async fn create_client(&self) -> SyncResult<MockClient> {
        if self.shared.fail_creation.load(Ordering::SeqCst) {
            bail!(ErrorKind::NetworkError, "Mock client creation failed");
        }

        let identity = self.shared.created.fetch_add(1, Ordering::SeqCst) + 1;

        Ok(MockClient {
            identity,
            shared: self.shared.clone(),
        })
    }
}

#[derive(Debug)]
pub struct MockClient {
    identity: u64,
    shared: Arc<Shared>,
}

impl MockClient {
    /// Unique, 1-based creation order of the client.
    pub fn identity(&self) -> u64 {
        self.identity
    }
}

impl WarehouseClient for MockClient {
    async fn query(&self, _sql: &str, _params: &[QueryParam]) -> SyncResult<Vec<Record>> {
        Ok(self.shared.rows.clone())
    }

    async fn test_connection(&self) -> bool {
        let delay_ms = self.shared.health_check_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        self.shared.healthy.load(Ordering::SeqCst)
    }

    async fn estimate_query_cost(&self, sql: &str) -> SyncResult<QueryCost> {
        Ok(QueryCost::from_bytes(sql.len() as u64))
    }

    async fn close(&self) {
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
    }
}
