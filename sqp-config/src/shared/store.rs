use serde::Deserialize;

use crate::shared::{PgConnectionConfig, ValidationError};

/// Backend holding pipeline state, run metrics, errors and logs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StoreConfig {
    /// Process-local store, lost on restart.
    Memory,
    /// Postgres store in the `sqp` schema.
    Postgres {
        #[serde(flatten)]
        connection: PgConnectionConfig,
    },
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            StoreConfig::Memory => Ok(()),
            StoreConfig::Postgres { connection } => connection.validate(),
        }
    }
}
