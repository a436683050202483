//! Configuration types and loading for search query performance sync pipelines.
//!
//! [`load_config`] reads layered configuration from the `configuration` directory and
//! `APP_`-prefixed environment variables. The [`shared`] module holds the typed
//! configuration consumed by the core runtime and the runner binary.

mod environment;
mod load;
pub mod shared;

pub use environment::Environment;
pub use load::{Config, LoadConfigError, load_config, load_config_from};
