//! Bounded pool of warehouse clients.
//!
//! [`ConnectionPool`] hands out exclusive [`PooledClient`] guards. Waiting callers queue on a
//! semaphore sized to `max_clients`, idle clients are health-checked before reuse and a
//! background sweep evicts clients idle for longer than `idle_timeout_ms`, keeping at least
//! `min_clients` open.

mod connection;
mod guard;

pub use connection::ConnectionPool;
pub use guard::PooledClient;
