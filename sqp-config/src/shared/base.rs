use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("`pool.max_clients` cannot be zero")]
    MaxClientsZero,
    #[error("`pool.min_clients` ({min}) cannot exceed `pool.max_clients` ({max})")]
    MinClientsExceedsMax { min: u32, max: u32 },
    #[error("pipeline `{0}` has an empty schedule expression")]
    EmptySchedule(String),
    #[error("pipeline `{0}` has no steps")]
    NoSteps(String),
    #[error("step name `{0}` is used more than once")]
    DuplicateStep(String),
    #[error("step `{step}` depends on `{dependency}` which is not configured before it")]
    UnknownDependency { step: String, dependency: String },
    #[error("step `{0}` depends on itself")]
    SelfDependency(String),
    #[error("invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}
