//! Next fire time computation for pipeline schedules.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::bail;
use crate::error::{ErrorKind, SyncResult};

/// Computes when a pipeline runs next from its schedule expression.
///
/// Parsing of the expression is left to the implementation, which keeps the orchestrator
/// independent of any particular cron dialect.
pub trait NextRunCalculator: Send + Sync {
    /// Returns the first fire time strictly after `from`.
    fn next_run(&self, schedule: &str, from: DateTime<Utc>) -> SyncResult<DateTime<Utc>>;
}

/// Fires at a fixed interval and ignores the schedule expression.
#[derive(Debug, Clone, Copy)]
pub struct FixedInterval {
    interval: Duration,
}

impl FixedInterval {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl NextRunCalculator for FixedInterval {
    fn next_run(&self, _schedule: &str, from: DateTime<Utc>) -> SyncResult<DateTime<Utc>> {
        let Ok(interval) = chrono::Duration::from_std(self.interval) else {
            bail!(
                ErrorKind::ConfigError,
                "Schedule interval out of range",
                format!("{:?}", self.interval)
            );
        };
        if interval <= chrono::Duration::zero() {
            bail!(ErrorKind::ConfigError, "Schedule interval must be positive");
        }

        Ok(from + interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_interval_adds_the_interval() {
        let from = DateTime::parse_from_rfc3339("2024-01-15T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let calculator = FixedInterval::new(Duration::from_secs(90));

        let next = calculator.next_run("ignored", from).unwrap();

        assert_eq!(next, from + chrono::Duration::seconds(90));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let calculator = FixedInterval::new(Duration::ZERO);

        let err = calculator.next_run("", Utc::now()).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }
}
