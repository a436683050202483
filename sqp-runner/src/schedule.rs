//! Cron schedules for pipeline runs.
//!
//! Pipelines use the five-field `minute hour day-of-month month day-of-week` format with
//! day-of-week `0` or `7` meaning Sunday. The `cron` crate expects a leading seconds field and
//! counts weekdays from 1, so numeric weekdays are rewritten to their names before parsing.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use sqp::error::{ErrorKind, SyncResult};
use sqp::schedule::NextRunCalculator;
use sqp::{bail, sync_error};

const WEEKDAY_NAMES: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Computes run times from five-field cron expressions, in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct CronCalculator;

impl NextRunCalculator for CronCalculator {
    fn next_run(&self, schedule: &str, from: DateTime<Utc>) -> SyncResult<DateTime<Utc>> {
        let cron = parse_schedule(schedule)?;

        cron.after(&from).next().ok_or_else(|| {
            sync_error!(
                ErrorKind::ConfigError,
                "Schedule has no upcoming run",
                format!("`{schedule}` never fires after {from}")
            )
        })
    }
}

fn parse_schedule(expression: &str) -> SyncResult<Schedule> {
    let fields = expression.split_whitespace().collect::<Vec<_>>();
    let [minute, hour, day_of_month, month, day_of_week] = fields.as_slice() else {
        bail!(
            ErrorKind::ConfigError,
            "Invalid cron expression",
            format!("`{expression}` must have exactly five fields")
        );
    };

    let day_of_week = normalize_day_of_week(day_of_week)?;
    let normalized = format!("0 {minute} {hour} {day_of_month} {month} {day_of_week}");

    Schedule::from_str(&normalized).map_err(|err| {
        sync_error!(
            ErrorKind::ConfigError,
            "Invalid cron expression",
            format!("`{expression}`: {err}"),
            source: err
        )
    })
}

/// Rewrites numeric weekdays (`0`-`7`, Sunday first) as names, keeping steps untouched.
fn normalize_day_of_week(field: &str) -> SyncResult<String> {
    let mut parts = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (part, None),
        };

        let range = range
            .split('-')
            .map(weekday_name)
            .collect::<SyncResult<Vec<_>>>()?
            .join("-");

        parts.push(match step {
            Some(step) => format!("{range}/{step}"),
            None => range,
        });
    }

    Ok(parts.join(","))
}

fn weekday_name(value: &str) -> SyncResult<String> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
        return Ok(value.to_string());
    }

    match value.parse::<usize>().ok().and_then(|day| WEEKDAY_NAMES.get(day)) {
        Some(name) => Ok((*name).to_string()),
        None => bail!(
            ErrorKind::ConfigError,
            "Invalid cron expression",
            format!("day of week `{value}` is out of range 0-7")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(timestamp: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(timestamp)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn daily_schedule_fires_next_day() {
        let next = CronCalculator
            .next_run("0 3 * * *", at("2024-01-15T10:00:00Z"))
            .unwrap();

        assert_eq!(next, at("2024-01-16T03:00:00Z"));
    }

    #[test]
    fn numeric_weekdays_count_from_sunday() {
        // 2024-01-15 is a Monday.
        let monday = CronCalculator
            .next_run("30 6 * * 1", at("2024-01-15T07:00:00Z"))
            .unwrap();
        assert_eq!(monday, at("2024-01-22T06:30:00Z"));

        let sunday = CronCalculator
            .next_run("0 0 * * 0", at("2024-01-15T07:00:00Z"))
            .unwrap();
        assert_eq!(sunday, at("2024-01-21T00:00:00Z"));

        let weekdays = CronCalculator
            .next_run("0 9 * * 1-5", at("2024-01-19T10:00:00Z"))
            .unwrap();
        assert_eq!(weekdays, at("2024-01-22T09:00:00Z"));
    }

    #[test]
    fn steps_are_supported() {
        let next = CronCalculator
            .next_run("*/15 * * * *", at("2024-01-15T10:07:00Z"))
            .unwrap();

        assert_eq!(next, at("2024-01-15T10:15:00Z"));
    }

    #[test]
    fn malformed_expressions_are_config_errors() {
        for expression in ["0 3 * *", "0 3 * * 9", "not a cron"] {
            let err = CronCalculator
                .next_run(expression, at("2024-01-15T10:00:00Z"))
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ConfigError, "{expression}");
        }
    }
}
