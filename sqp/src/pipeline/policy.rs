use std::time::Duration;

use crate::error::{ErrorKind, SyncError};

/// Upper bound of the delay between two attempts of a step.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Word sequences identifying failures that will not go away on retry.
///
/// Words match message tokens by prefix, status codes only as whole tokens.
const FATAL_MESSAGE_PATTERNS: &[&[&str]] = &[
    &["authentication"],
    &["unauthenticated"],
    &["unauthorized"],
    &["permission"],
    &["forbidden"],
    &["access", "denied"],
    &["credential"],
    &["401"],
    &["403"],
];

/// Retry behavior for a classified error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryDirective {
    /// The step is attempted again after a backoff delay.
    Retry,
    /// The step fails immediately.
    NoRetry,
}

/// Policy describing how a failed step attempt is handled.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ErrorHandlingPolicy {
    retry_directive: RetryDirective,
    solution: Option<&'static str>,
}

impl ErrorHandlingPolicy {
    const fn new(retry_directive: RetryDirective, solution: Option<&'static str>) -> Self {
        Self {
            retry_directive,
            solution,
        }
    }

    pub fn retry_directive(&self) -> RetryDirective {
        self.retry_directive
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_directive == RetryDirective::Retry
    }

    /// Returns an optional operator-facing solution message.
    pub fn solution(&self) -> Option<&'static str> {
        self.solution
    }
}

/// Builds the [`ErrorHandlingPolicy`] of an error.
///
/// Classification uses the error kind. Errors without a meaningful kind are classified by
/// inspecting their message: credential and permission failures are fatal, everything else is
/// retried.
pub fn build_error_handling_policy(error: &SyncError) -> ErrorHandlingPolicy {
    match error.kind() {
        ErrorKind::ConnectionTimeout
        | ErrorKind::ClientCreationFailed
        | ErrorKind::NetworkError
        | ErrorKind::OperationTimeout
        | ErrorKind::QuotaExceeded
        | ErrorKind::SyncRejected
        | ErrorKind::StoreError
        | ErrorKind::IoError => ErrorHandlingPolicy::new(RetryDirective::Retry, None),

        ErrorKind::AuthenticationError => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Verify the warehouse and sink credentials."),
        ),
        ErrorKind::PermissionDenied => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Grant the service account access to the queried datasets and target tables."),
        ),
        ErrorKind::QueryFailed => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Fix the SQL configured for the step."),
        ),
        ErrorKind::ValidationError | ErrorKind::InvalidData => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Inspect the source records that failed the data-quality checks."),
        ),
        ErrorKind::ConfigError | ErrorKind::DependencyNotMet => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Fix the pipeline configuration."),
        ),
        ErrorKind::PoolClosed
        | ErrorKind::PipelineCancelled
        | ErrorKind::LockConflict
        | ErrorKind::InvalidStateTransition
        | ErrorKind::SerializationError
        | ErrorKind::DeserializationError
        | ErrorKind::AlertDispatchFailed => ErrorHandlingPolicy::new(RetryDirective::NoRetry, None),

        _ => classify_by_message(&error.message()),
    }
}

fn classify_by_message(message: &str) -> ErrorHandlingPolicy {
    let message = message.to_lowercase();
    let tokens: Vec<&str> = message
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .collect();

    if FATAL_MESSAGE_PATTERNS
        .iter()
        .any(|pattern| contains_words(&tokens, pattern))
    {
        return ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Verify the credentials and permissions used by the step."),
        );
    }

    ErrorHandlingPolicy::new(RetryDirective::Retry, None)
}

fn contains_words(tokens: &[&str], pattern: &[&str]) -> bool {
    tokens.windows(pattern.len()).any(|window| {
        window.iter().zip(pattern).all(|(token, word)| {
            if word.bytes().all(|byte| byte.is_ascii_digit()) {
                token == word
            } else {
                token.starts_with(word)
            }
        })
    })
}

/// Delay before retry number `attempt` (1-based), doubling from `base_delay_ms` and capped at
/// [`MAX_RETRY_DELAY`].
pub fn retry_delay(base_delay_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let delay_ms = base_delay_ms.saturating_mul(1u64 << exponent);

    Duration::from_millis(delay_ms).min(MAX_RETRY_DELAY)
}
