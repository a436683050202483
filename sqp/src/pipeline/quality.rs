use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqp_config::shared::QualityConfig;

use crate::error::{ErrorKind, SyncError};
use crate::sync_error;

/// Number of individual violations spelled out in the error message.
const MAX_REPORTED_VIOLATIONS: usize = 10;

/// Outcome of the data-quality checks on the final output of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualityReport {
    pub records_checked: usize,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
    /// Newest value of the configured date field.
    pub newest_record: Option<DateTime<Utc>>,
}

impl QualityReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Converts the violations into a [`ErrorKind::ValidationError`], if there are any.
    pub fn to_error(&self) -> Option<SyncError> {
        if self.passed() {
            return None;
        }

        let mut detail = self
            .violations
            .iter()
            .take(MAX_REPORTED_VIOLATIONS)
            .cloned()
            .collect::<Vec<_>>()
            .join("; ");
        if self.violations.len() > MAX_REPORTED_VIOLATIONS {
            detail.push_str(&format!(
                "; and {} more",
                self.violations.len() - MAX_REPORTED_VIOLATIONS
            ));
        }

        Some(sync_error!(
            ErrorKind::ValidationError,
            "Data quality check failed",
            detail = detail
        ))
    }
}

/// Checks records for required identifiers, non-negative metrics and stale dates.
#[derive(Debug, Clone)]
pub struct QualityGate {
    config: QualityConfig,
    max_age: Option<chrono::Duration>,
}

impl QualityGate {
    /// Records dated more than `max_age` before the check produce a warning.
    pub fn new(config: QualityConfig, max_age: Option<std::time::Duration>) -> Self {
        Self {
            config,
            max_age: max_age.and_then(|age| chrono::Duration::from_std(age).ok()),
        }
    }

    pub fn check(&self, records: &[serde_json::Value], now: DateTime<Utc>) -> QualityReport {
        let mut report = QualityReport {
            records_checked: records.len(),
            ..QualityReport::default()
        };

        for (index, record) in records.iter().enumerate() {
            let Some(record) = record.as_object() else {
                report
                    .violations
                    .push(format!("record {index} is not an object"));
                continue;
            };

            for field in &self.config.required_fields {
                if is_blank(record.get(field)) {
                    report
                        .violations
                        .push(format!("record {index} is missing `{field}`"));
                }
            }

            for field in &self.config.non_negative_fields {
                let Some(value) = record.get(field).and_then(as_number) else {
                    continue;
                };
                if value < 0.0 {
                    report
                        .violations
                        .push(format!("record {index} has negative `{field}` ({value})"));
                }
            }

            if let Some(date) = record.get(&self.config.date_field).and_then(parse_date) {
                if report.newest_record.is_none_or(|newest| newest < date) {
                    report.newest_record = Some(date);
                }
            }
        }

        if let (Some(max_age), Some(newest)) = (self.max_age, report.newest_record) {
            let age = now - newest;
            if age > max_age {
                report.warnings.push(format!(
                    "newest record dated {} is {} hours old",
                    newest.date_naive(),
                    age.num_hours()
                ));
            }
        }

        report
    }
}

fn is_blank(value: Option<&serde_json::Value>) -> bool {
    match value {
        None | Some(serde_json::Value::Null) => true,
        Some(serde_json::Value::String(value)) => value.trim().is_empty(),
        Some(_) => false,
    }
}

fn as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(number) => number.as_f64(),
        serde_json::Value::String(value) => value.trim().parse().ok(),
        _ => None,
    }
}

/// Accepts RFC 3339 timestamps and plain `YYYY-MM-DD` dates.
fn parse_date(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    let value = value.as_str()?;

    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Some(timestamp.with_timezone(&Utc));
    }

    let date = NaiveDate::parse_from_str(value.get(..10)?, "%Y-%m-%d").ok()?;
    Some(date.and_time(NaiveTime::MIN).and_utc())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-20T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn clean_records_pass() {
        let gate = QualityGate::new(QualityConfig::default(), None);
        let records = vec![
            json!({"query": "shoes", "asin": "B01", "impressions": 10, "clicks": "2", "date": "2024-01-15"}),
            json!({"query": "socks", "asin": "B02", "impressions": 0, "date": "2024-01-16"}),
        ];

        let report = gate.check(&records, now());

        assert!(report.passed());
        assert_eq!(report.records_checked, 2);
        assert_eq!(report.to_error(), None);
        assert_eq!(
            report.newest_record.map(|date| date.date_naive().to_string()),
            Some("2024-01-16".to_string())
        );
    }

    #[test]
    fn negative_metrics_and_missing_identifiers_fail() {
        let gate = QualityGate::new(QualityConfig::default(), None);
        let records = vec![
            json!({"query": "shoes", "asin": "B01", "clicks": -1}),
            json!({"query": " ", "impressions": 5}),
            json!(42),
        ];

        let report = gate.check(&records, now());

        assert_eq!(report.violations.len(), 4);
        let err = report.to_error().unwrap();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(err.message().contains("negative `clicks`"));
        assert!(err.message().contains("record 1 is missing `asin`"));
    }

    #[test]
    fn stale_records_only_warn() {
        let gate = QualityGate::new(
            QualityConfig::default(),
            Some(Duration::from_secs(2 * 24 * 60 * 60)),
        );
        let records = vec![json!({"query": "shoes", "asin": "B01", "date": "2024-01-10"})];

        let report = gate.check(&records, now());

        assert!(report.passed());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("2024-01-10"));
    }

    #[test]
    fn violation_messages_are_capped() {
        let gate = QualityGate::new(QualityConfig::default(), None);
        let records = vec![json!({"query": "q", "asin": "a", "impressions": -1}); 15];

        let message = gate.check(&records, now()).to_error().unwrap().message();

        assert!(message.ends_with("and 5 more"));
    }
}
