use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use crate::clients::{ClientFactory, WarehouseClient};
use crate::pool::connection::PoolInner;

/// Exclusive handle on a pooled client, returned to the pool when dropped.
pub struct PooledClient<F: ClientFactory> {
    id: u64,
    client: Option<F::Client>,
    pool: Arc<PoolInner<F>>,
    // Released after the client is checked back in.
    _permit: OwnedSemaphorePermit,
}

impl<F: ClientFactory> PooledClient<F> {
    pub(super) fn new(
        id: u64,
        client: F::Client,
        pool: Arc<PoolInner<F>>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            id,
            client: Some(client),
            pool,
            _permit: permit,
        }
    }

    /// Identity of the pool slot, stable across acquisitions of the same client.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<F: ClientFactory> Deref for PooledClient<F> {
    type Target = F::Client;

    fn deref(&self) -> &F::Client {
        // The client is only taken out in `drop`.
        match &self.client {
            Some(client) => client,
            None => unreachable!("pooled client accessed after release"),
        }
    }
}

impl<F: ClientFactory> Drop for PooledClient<F> {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };

        let Some(orphan) = self.pool.check_in(self.id, client) else {
            return;
        };

        debug!(client_id = self.id, "closing client released after pool close");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { orphan.close().await });
            }
            Err(_) => drop(orphan),
        }
    }
}
