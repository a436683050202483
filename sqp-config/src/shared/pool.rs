use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Sizing and timing of the warehouse client pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Clients kept open even when idle.
    #[serde(default = "default_min_clients")]
    pub min_clients: u32,
    /// Upper bound on simultaneously open clients.
    #[serde(default = "default_max_clients")]
    pub max_clients: u32,
    /// How long `acquire` waits for a free client before failing.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Idle time after which a client is evicted, down to `min_clients`.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Interval of the idle eviction sweep.
    #[serde(default = "default_idle_check_interval_ms")]
    pub idle_check_interval_ms: u64,
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_clients == 0 {
            return Err(ValidationError::MaxClientsZero);
        }

        if self.min_clients > self.max_clients {
            return Err(ValidationError::MinClientsExceedsMax {
                min: self.min_clients,
                max: self.max_clients,
            });
        }

        if self.idle_check_interval_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "pool.idle_check_interval_ms".to_string(),
                constraint: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_clients: default_min_clients(),
            max_clients: default_max_clients(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            idle_check_interval_ms: default_idle_check_interval_ms(),
        }
    }
}

fn default_min_clients() -> u32 {
    1
}

fn default_max_clients() -> u32 {
    5
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_idle_check_interval_ms() -> u64 {
    60_000
}
