use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use metrics::{counter, gauge};
use sqp_config::shared::PoolConfig;
use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bail;
use crate::clients::{ClientFactory, WarehouseClient};
use crate::error::{ErrorKind, SyncResult};
use crate::metrics::{
    SQP_POOL_ACQUIRE_TIMEOUTS_TOTAL, SQP_POOL_ACQUIRES_TOTAL, SQP_POOL_EVICTIONS_TOTAL,
    SQP_POOL_IN_USE, SQP_POOL_SIZE,
};
use crate::pool::PooledClient;

/// Delay between two attempts at creating a client while acquiring.
const CLIENT_CREATION_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// A client slot tracked by the pool.
///
/// `client` is taken out while the slot is in use and put back on release.
#[derive(Debug)]
struct PoolEntry<C> {
    id: u64,
    client: Option<C>,
    in_use: bool,
    last_used_at: Instant,
}

#[derive(Debug)]
pub(super) struct PoolState<C> {
    entries: Vec<PoolEntry<C>>,
    next_id: u64,
    closed: bool,
}

impl<C> PoolState<C> {
    fn in_use_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.in_use).count()
    }

    fn record_gauges(&self) {
        gauge!(SQP_POOL_SIZE).set(self.entries.len() as f64);
        gauge!(SQP_POOL_IN_USE).set(self.in_use_count() as f64);
    }
}

pub(super) struct PoolInner<F: ClientFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Client>>,
    /// One permit per client that may be handed out. Closed when the pool closes.
    pub(super) permits: Arc<Semaphore>,
}

impl<F: ClientFactory> PoolInner<F> {
    fn state(&self) -> MutexGuard<'_, PoolState<F::Client>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Puts a client back into its slot.
    ///
    /// Returns the client when the pool is closed or the slot is gone so the caller closes it.
    pub(super) fn check_in(&self, id: u64, client: F::Client) -> Option<F::Client> {
        let mut state = self.state();
        if state.closed {
            state.entries.retain(|entry| entry.id != id);
            return Some(client);
        }

        let Some(entry) = state.entries.iter_mut().find(|entry| entry.id == id) else {
            return Some(client);
        };
        entry.client = Some(client);
        entry.in_use = false;
        entry.last_used_at = Instant::now();
        state.record_gauges();

        None
    }

    /// Marks the first idle slot as in use and takes its client.
    fn check_out_idle(self: &Arc<Self>) -> SyncResult<Option<CheckedOut<F>>> {
        let mut state = self.state();
        if state.closed {
            bail!(ErrorKind::PoolClosed, "Connection pool is closed");
        }

        let checked_out = state
            .entries
            .iter_mut()
            .find(|entry| !entry.in_use && entry.client.is_some())
            .and_then(|entry| {
                entry.in_use = true;
                entry.client.take().map(|client| CheckedOut {
                    id: entry.id,
                    client: Some(client),
                    pool: self.clone(),
                })
            });
        state.record_gauges();

        Ok(checked_out)
    }

    fn remove_entry(&self, id: u64) {
        let mut state = self.state();
        state.entries.retain(|entry| entry.id != id);
        state.record_gauges();
    }

    /// Registers a freshly created client, either in use or idle.
    fn register(&self, client: Option<F::Client>, in_use: bool) -> SyncResult<u64> {
        let mut state = self.state();
        if state.closed {
            bail!(ErrorKind::PoolClosed, "Connection pool is closed");
        }

        let id = state.next_id;
        state.next_id += 1;
        state.entries.push(PoolEntry {
            id,
            client,
            in_use,
            last_used_at: Instant::now(),
        });
        state.record_gauges();

        Ok(id)
    }

    /// Removes idle clients unused for longer than the idle timeout, never going below
    /// `min_clients`.
    fn evict_idle(&self) -> Vec<F::Client> {
        let idle_timeout = self.config.idle_timeout();
        let min_clients = self.config.min_clients as usize;

        let mut state = self.state();
        let mut evicted = Vec::new();
        let mut index = 0;
        while index < state.entries.len() && state.entries.len() > min_clients {
            let entry = &state.entries[index];
            if !entry.in_use && entry.last_used_at.elapsed() >= idle_timeout {
                if let Some(client) = state.entries.remove(index).client {
                    evicted.push(client);
                }
            } else {
                index += 1;
            }
        }
        state.record_gauges();

        evicted
    }
}

/// An idle client taken out of its slot to be health-checked.
///
/// Unless handed out, the slot is removed and the client closed when this is dropped, so an
/// acquisition cancelled during the health check leaves no slot behind.
struct CheckedOut<F: ClientFactory> {
    id: u64,
    client: Option<F::Client>,
    pool: Arc<PoolInner<F>>,
}

impl<F: ClientFactory> CheckedOut<F> {
    async fn is_healthy(&self) -> bool {
        match &self.client {
            Some(client) => client.test_connection().await,
            None => false,
        }
    }

    fn hand_out(mut self) -> Option<(u64, F::Client)> {
        self.client.take().map(|client| (self.id, client))
    }

    async fn discard(mut self) {
        self.pool.remove_entry(self.id);
        if let Some(client) = self.client.take() {
            client.close().await;
        }
    }
}

impl<F: ClientFactory> Drop for CheckedOut<F> {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };

        debug!(client_id = self.id, "dropping client checked out by a cancelled acquisition");
        self.pool.remove_entry(self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { client.close().await });
            }
            Err(_) => drop(client),
        }
    }
}

/// Bounded pool of warehouse clients created by a [`ClientFactory`].
///
/// Cloning is cheap and every clone refers to the same pool.
pub struct ConnectionPool<F: ClientFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ClientFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ClientFactory> ConnectionPool<F> {
    /// Creates an empty pool and starts its idle sweep.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let max_clients = config.max_clients as usize;
        let inner = Arc::new(PoolInner {
            factory,
            config,
            state: Mutex::new(PoolState {
                entries: Vec::new(),
                next_id: 0,
                closed: false,
            }),
            permits: Arc::new(Semaphore::new(max_clients)),
        });

        spawn_idle_sweep(Arc::downgrade(&inner), inner.config.idle_check_interval());

        Self { inner }
    }

    /// Opens `min_clients` idle clients up front.
    pub async fn warm_up(&self) -> SyncResult<()> {
        let missing = (self.inner.config.min_clients as usize).saturating_sub(self.size());
        for _ in 0..missing {
            let client = self.inner.factory.create_client().await.map_err(|err| {
                crate::sync_error!(
                    ErrorKind::ClientCreationFailed,
                    "Failed to create warehouse client",
                    err.message(),
                    source: err
                )
            })?;

            self.inner.register(Some(client), false)?;
        }

        info!(clients = missing, "connection pool warmed up");

        Ok(())
    }

    /// Acquires a client for exclusive use.
    ///
    /// Waits up to `acquire_timeout_ms` for a free slot and fails with
    /// [`ErrorKind::ConnectionTimeout`]. Fails immediately with [`ErrorKind::PoolClosed`] once
    /// the pool is closed. Unhealthy idle clients are replaced transparently.
    pub async fn acquire(&self) -> SyncResult<PooledClient<F>> {
        let acquire_timeout = self.inner.config.acquire_timeout();
        let deadline = Instant::now() + acquire_timeout;

        let permit =
            match tokio::time::timeout_at(deadline, self.inner.permits.clone().acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => bail!(ErrorKind::PoolClosed, "Connection pool is closed"),
                Err(_) => {
                    counter!(SQP_POOL_ACQUIRE_TIMEOUTS_TOTAL).increment(1);
                    bail!(
                        ErrorKind::ConnectionTimeout,
                        "Timed out acquiring a warehouse client",
                        format!(
                            "no client became available within {}ms",
                            acquire_timeout.as_millis()
                        )
                    );
                }
            };

        // Holding a permit guarantees either an idle slot or room for a new client.
        if let Some(checked_out) = self.inner.check_out_idle()? {
            if checked_out.is_healthy().await {
                if let Some((id, client)) = checked_out.hand_out() {
                    counter!(SQP_POOL_ACQUIRES_TOTAL).increment(1);
                    return Ok(PooledClient::new(id, client, self.inner.clone(), permit));
                }
            } else {
                warn!(client_id = checked_out.id, "evicting unhealthy warehouse client");
                counter!(SQP_POOL_EVICTIONS_TOTAL).increment(1);
                checked_out.discard().await;
            }
        }

        loop {
            match self.inner.factory.create_client().await {
                Ok(client) => {
                    let id = match self.inner.register(None, true) {
                        Ok(id) => id,
                        Err(err) => {
                            client.close().await;
                            return Err(err);
                        }
                    };
                    debug!(client_id = id, "created warehouse client");
                    counter!(SQP_POOL_ACQUIRES_TOTAL).increment(1);

                    return Ok(PooledClient::new(id, client, self.inner.clone(), permit));
                }
                Err(err) => {
                    warn!(error = %err.message(), "failed to create warehouse client, retrying");

                    if self.is_closed() {
                        bail!(ErrorKind::PoolClosed, "Connection pool is closed");
                    }

                    if Instant::now() + CLIENT_CREATION_RETRY_INTERVAL >= deadline {
                        counter!(SQP_POOL_ACQUIRE_TIMEOUTS_TOTAL).increment(1);
                        bail!(
                            ErrorKind::ConnectionTimeout,
                            "Timed out acquiring a warehouse client",
                            format!("last client creation error: {}", err.message()),
                            source: err
                        );
                    }

                    tokio::time::sleep(CLIENT_CREATION_RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Returns a client to the pool. Equivalent to dropping the guard.
    pub fn release(&self, client: PooledClient<F>) {
        drop(client);
    }

    /// Runs `op` with an acquired client.
    ///
    /// The client is released when `op` drops its guard, on success, error or panic alike.
    pub async fn with_client<T, Op, Fut>(&self, op: Op) -> SyncResult<T>
    where
        Op: FnOnce(PooledClient<F>) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let client = self.acquire().await?;
        op(client).await
    }

    /// Closes every idle client and rejects further acquisitions.
    ///
    /// Clients in use are closed when their guards are dropped. Calling this more than once has
    /// no further effect.
    pub async fn close(&self) {
        self.inner.permits.close();

        let clients = {
            let mut state = self.inner.state();
            if state.closed {
                return;
            }
            state.closed = true;

            let clients: Vec<F::Client> = state
                .entries
                .iter_mut()
                .filter_map(|entry| entry.client.take())
                .collect();
            state.entries.retain(|entry| entry.in_use);
            state.record_gauges();

            clients
        };

        let closed = clients.len();
        for client in clients {
            client.close().await;
        }

        info!(closed_clients = closed, "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    /// Number of open clients, idle or in use.
    pub fn size(&self) -> usize {
        self.inner.state().entries.len()
    }

    pub fn idle_count(&self) -> usize {
        let state = self.inner.state();
        state.entries.len() - state.in_use_count()
    }

    pub fn in_use_count(&self) -> usize {
        self.inner.state().in_use_count()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

/// Periodically evicts idle clients until the pool is dropped or closed.
fn spawn_idle_sweep<F: ClientFactory>(pool: Weak<PoolInner<F>>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(inner) = pool.upgrade() else {
                break;
            };
            if inner.state().closed {
                break;
            }

            let evicted = inner.evict_idle();
            drop(inner);

            if !evicted.is_empty() {
                debug!(evicted = evicted.len(), "evicting idle warehouse clients");
                counter!(SQP_POOL_EVICTIONS_TOTAL).increment(evicted.len() as u64);
            }
            for client in evicted {
                client.close().await;
            }
        }
    });
}
