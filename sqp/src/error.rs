//! Error types and result definitions for sync pipeline operations.
//!
//! [`SyncError`] carries an [`ErrorKind`] used for retry classification, a static description,
//! optional dynamic detail, an optional source error, the callsite location and a captured
//! backtrace. Several errors can be aggregated into a single [`SyncError`].

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

use sqp_config::shared::ValidationError as ConfigValidationError;

/// Result type for sync operations using [`SyncError`] as the error type.
pub type SyncResult<T> = Result<T, SyncError>;

/// Payload stored for single [`SyncError`] instances.
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the sync runtime.
#[derive(Debug, Clone)]
pub struct SyncError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Multiple aggregated errors.
    Many {
        errors: Vec<SyncError>,
        location: &'static Location<'static>,
    },
}

/// Categories of failures, grouped by the component that raises them.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Connection pool
    ConnectionTimeout,
    PoolClosed,
    ClientCreationFailed,

    // Warehouse and sink access
    QueryFailed,
    AuthenticationError,
    PermissionDenied,
    NetworkError,
    OperationTimeout,
    QuotaExceeded,

    // Data
    ValidationError,
    InvalidData,

    // State and orchestration
    LockConflict,
    InvalidStateTransition,
    DependencyNotMet,
    StepFailed,
    SyncRejected,
    PipelineCancelled,

    // Monitoring
    AlertDispatchFailed,

    // Configuration, storage and encoding
    ConfigError,
    StoreError,
    SerializationError,
    DeserializationError,
    IoError,

    Unknown,
}

impl ErrorKind {
    /// Returns the stable snake case name persisted with error records.
    pub fn as_static_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionTimeout => "connection_timeout",
            ErrorKind::PoolClosed => "pool_closed",
            ErrorKind::ClientCreationFailed => "client_creation_failed",
            ErrorKind::QueryFailed => "query_failed",
            ErrorKind::AuthenticationError => "authentication_error",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::OperationTimeout => "operation_timeout",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::InvalidData => "invalid_data",
            ErrorKind::LockConflict => "lock_conflict",
            ErrorKind::InvalidStateTransition => "invalid_state_transition",
            ErrorKind::DependencyNotMet => "dependency_not_met",
            ErrorKind::StepFailed => "step_failed",
            ErrorKind::SyncRejected => "sync_rejected",
            ErrorKind::PipelineCancelled => "pipeline_cancelled",
            ErrorKind::AlertDispatchFailed => "alert_dispatch_failed",
            ErrorKind::ConfigError => "config_error",
            ErrorKind::StoreError => "store_error",
            ErrorKind::SerializationError => "serialization_error",
            ErrorKind::DeserializationError => "deserialization_error",
            ErrorKind::IoError => "io_error",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl SyncError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, returns the kind of the first error or [`ErrorKind::Unknown`]
    /// if there is none.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every [`ErrorKind`] contained in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => errors.iter().flat_map(|err| err.kinds()).collect(),
        }
    }

    /// Returns the static description, or the first one for aggregated errors.
    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.description.as_ref(),
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.description())
                .unwrap_or("multiple errors"),
        }
    }

    /// Returns the dynamic detail, or the first available one for aggregated errors.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns a single line `description: detail` message suitable for results and storage.
    pub fn message(&self) -> String {
        match self.detail() {
            Some(detail) if !detail.trim().is_empty() => {
                format!("{}: {}", self.description(), detail)
            }
            _ => self.description().to_string(),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating error, exposed through [`error::Error::source`].
    ///
    /// Has no effect on aggregated errors, which forward their first error as source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        SyncError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for SyncError {
    fn eq(&self, other: &SyncError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl Hash for SyncError {
    /// Hashes only the kind and static description so occurrences of the same failure group
    /// together regardless of detail or location.
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.repr).hash(state);
        match &self.repr {
            ErrorRepr::Single(payload) => {
                payload.kind.hash(state);
                payload.description.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                write_block("Detail", payload.detail.as_deref(), f)?;

                let backtrace = format!("{}", payload.backtrace);
                if !backtrace.trim().is_empty() {
                    write_block("Backtrace", Some(&backtrace), f)?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = format!("{error}");
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for SyncError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

/// Writes an indented, titled block of lines.
fn write_block(title: &str, content: Option<&str>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let Some(content) = content else {
        return Ok(());
    };

    if content.trim().is_empty() {
        return write!(f, "\n  {title}: <empty>");
    }

    write!(f, "\n  {title}:")?;
    for line in content.lines() {
        if line.trim().is_empty() {
            write!(f, "\n    ")?;
        } else {
            write!(f, "\n    {line}")?;
        }
    }

    Ok(())
}

/// Creates a [`SyncError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for SyncError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> SyncError {
        SyncError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

/// Creates a [`SyncError`] from an error kind, static description and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for SyncError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> SyncError {
        SyncError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned as is.
impl<E> From<Vec<E>> for SyncError
where
    E: Into<SyncError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> SyncError {
        let location = Location::caller();
        let mut errors: Vec<SyncError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1 {
            if let Some(error) = errors.pop() {
                return error;
            }
        }

        SyncError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for SyncError {
    #[track_caller]
    fn from(err: std::io::Error) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Maps I/O failures to [`ErrorKind::IoError`] and everything else to
/// [`ErrorKind::DeserializationError`].
impl From<serde_json::Error> for SyncError {
    #[track_caller]
    fn from(err: serde_json::Error) -> SyncError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => {
                (ErrorKind::DeserializationError, "JSON deserialization failed")
            }
        };

        let detail = err.to_string();
        SyncError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<uuid::Error> for SyncError {
    #[track_caller]
    fn from(err: uuid::Error) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::InvalidData,
            Cow::Borrowed("UUID parsing failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<chrono::ParseError> for SyncError {
    #[track_caller]
    fn from(err: chrono::ParseError) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::InvalidData,
            Cow::Borrowed("Date parsing failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<tokio::time::error::Elapsed> for SyncError {
    #[track_caller]
    fn from(err: tokio::time::error::Elapsed) -> SyncError {
        SyncError::from_components(
            ErrorKind::OperationTimeout,
            Cow::Borrowed("Operation timed out"),
            None,
            Some(Arc::new(err)),
        )
    }
}

impl From<ConfigValidationError> for SyncError {
    #[track_caller]
    fn from(err: ConfigValidationError) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Invalid configuration"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Maps [`sqlx::Error`] to a kind based on the failure and, for database errors, the SQLSTATE
/// class.
impl From<sqlx::Error> for SyncError {
    #[track_caller]
    fn from(err: sqlx::Error) -> SyncError {
        let (kind, description) = match &err {
            sqlx::Error::PoolTimedOut => (
                ErrorKind::ConnectionTimeout,
                "Timed out acquiring a database connection",
            ),
            sqlx::Error::PoolClosed => (ErrorKind::PoolClosed, "Database pool is closed"),
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                (ErrorKind::NetworkError, "Database connection failed")
            }
            sqlx::Error::Database(database_error) => {
                classify_sqlstate(database_error.code().as_deref().unwrap_or_default())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                (ErrorKind::DeserializationError, "Database value decoding failed")
            }
            _ => (ErrorKind::StoreError, "Database operation failed"),
        };

        let detail = err.to_string();
        SyncError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

fn classify_sqlstate(code: &str) -> (ErrorKind, &'static str) {
    match code {
        "42501" => (ErrorKind::PermissionDenied, "Database permission denied"),
        "57014" => (ErrorKind::OperationTimeout, "Database query canceled"),
        _ => match code.get(..2).unwrap_or_default() {
            "08" | "57" => (ErrorKind::NetworkError, "Database connection failed"),
            "28" => (ErrorKind::AuthenticationError, "Database authentication failed"),
            "22" | "23" => (ErrorKind::ValidationError, "Database rejected the data"),
            "40" => (ErrorKind::NetworkError, "Database transaction rolled back"),
            "53" => (ErrorKind::QuotaExceeded, "Database resources exhausted"),
            "42" => (ErrorKind::QueryFailed, "Database query is invalid"),
            _ => (ErrorKind::StoreError, "Database operation failed"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_joins_description_and_detail() {
        let err = SyncError::from((ErrorKind::QueryFailed, "Query failed", "table not found"));
        assert_eq!(err.message(), "Query failed: table not found");

        let err = SyncError::from((ErrorKind::QueryFailed, "Query failed"));
        assert_eq!(err.message(), "Query failed");
    }

    #[test]
    fn single_element_vec_is_unwrapped() {
        let err = SyncError::from(vec![SyncError::from((ErrorKind::PoolClosed, "closed"))]);
        assert_eq!(err.kind(), ErrorKind::PoolClosed);
        assert!(err.backtrace().is_some());
    }

    #[test]
    fn aggregated_errors_report_all_kinds() {
        let err = SyncError::from(vec![
            SyncError::from((ErrorKind::NetworkError, "network")),
            SyncError::from((ErrorKind::StoreError, "store")),
        ]);
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert_eq!(err.kinds(), vec![ErrorKind::NetworkError, ErrorKind::StoreError]);
        assert!(err.to_string().starts_with("[Many] 2 errors aggregated"));
    }

    #[test]
    fn sqlstate_classes_map_to_kinds() {
        assert_eq!(classify_sqlstate("28P01").0, ErrorKind::AuthenticationError);
        assert_eq!(classify_sqlstate("42501").0, ErrorKind::PermissionDenied);
        assert_eq!(classify_sqlstate("42P01").0, ErrorKind::QueryFailed);
        assert_eq!(classify_sqlstate("40001").0, ErrorKind::NetworkError);
        assert_eq!(classify_sqlstate("").0, ErrorKind::StoreError);
    }
}
