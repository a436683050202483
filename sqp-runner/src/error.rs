use std::error::Error;

use sqp::error::{ErrorKind, SyncError};
use thiserror::Error;

/// Result type for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Error type of the runner binary.
///
/// Wraps [`SyncError`] for pipeline errors and adds variants for process setup.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{0}")]
    Sync(#[from] SyncError),

    #[error("configuration error: {0}")]
    Config(#[source] Box<dyn Error + Send + Sync>),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A single run requested with `--once` did not succeed.
    #[error("pipeline run failed: {message}")]
    RunFailed {
        message: String,
        kind: Option<ErrorKind>,
    },
}

impl RunnerError {
    /// Creates a configuration error from any source.
    pub fn config<E: Error + Send + Sync + 'static>(err: E) -> Self {
        RunnerError::Config(Box::new(err))
    }

    /// Returns a short category label for this error.
    pub fn category(&self) -> &'static str {
        match self {
            RunnerError::Sync(_) => "pipeline error",
            RunnerError::Config(_) => "configuration error",
            RunnerError::Migration(_) => "migration error",
            RunnerError::Io(_) => "i/o error",
            RunnerError::RunFailed { .. } => "run failure",
        }
    }

    /// Kind of the underlying pipeline error, if any.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            RunnerError::Sync(err) => Some(err.kind()),
            RunnerError::RunFailed { kind, .. } => *kind,
            _ => None,
        }
    }
}
