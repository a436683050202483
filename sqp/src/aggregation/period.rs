use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, Months, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{ErrorKind, SyncError, SyncResult};

/// Calendar granularity records are bucketed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl PeriodType {
    pub fn as_static_str(&self) -> &'static str {
        match self {
            PeriodType::Weekly => "weekly",
            PeriodType::Monthly => "monthly",
            PeriodType::Quarterly => "quarterly",
            PeriodType::Yearly => "yearly",
        }
    }

    /// Length of the period in calendar months, `None` for weeks.
    fn months(&self) -> Option<u32> {
        match self {
            PeriodType::Weekly => None,
            PeriodType::Monthly => Some(1),
            PeriodType::Quarterly => Some(3),
            PeriodType::Yearly => Some(12),
        }
    }
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_static_str())
    }
}

impl FromStr for PeriodType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "weekly" | "week" => Ok(PeriodType::Weekly),
            "monthly" | "month" => Ok(PeriodType::Monthly),
            "quarterly" | "quarter" => Ok(PeriodType::Quarterly),
            "yearly" | "year" => Ok(PeriodType::Yearly),
            other => bail!(
                ErrorKind::ConfigError,
                "Unknown period type",
                format!("`{other}` is not one of weekly, monthly, quarterly or yearly")
            ),
        }
    }
}

/// Inclusive first and last day of a calendar period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeriodBounds {
    pub period_type: PeriodType,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl PeriodBounds {
    /// Returns the period of `period_type` containing `date`.
    ///
    /// Weeks begin on `week_start`. Quarters are three-month blocks starting in January.
    pub fn containing(
        date: NaiveDate,
        period_type: PeriodType,
        week_start: Weekday,
    ) -> SyncResult<PeriodBounds> {
        let start = match period_type {
            PeriodType::Weekly => {
                let offset = (date.weekday().num_days_from_monday() + 7
                    - week_start.num_days_from_monday())
                    % 7;
                date.checked_sub_days(Days::new(offset as u64))
            }
            PeriodType::Monthly => date.with_day(1),
            PeriodType::Quarterly => {
                let first_month = date.month0() / 3 * 3 + 1;
                NaiveDate::from_ymd_opt(date.year(), first_month, 1)
            }
            PeriodType::Yearly => NaiveDate::from_ymd_opt(date.year(), 1, 1),
        };

        match start {
            Some(start) => Self::starting_at(start, period_type),
            None => out_of_range(date),
        }
    }

    fn starting_at(start: NaiveDate, period_type: PeriodType) -> SyncResult<PeriodBounds> {
        let next_start = match period_type.months() {
            None => start.checked_add_days(Days::new(7)),
            Some(months) => start.checked_add_months(Months::new(months)),
        };

        match next_start.and_then(|next_start| next_start.pred_opt()) {
            Some(end) => Ok(PeriodBounds {
                period_type,
                start,
                end,
            }),
            None => out_of_range(start),
        }
    }

    /// Returns the immediately preceding period of the same type.
    ///
    /// Uses calendar months rather than day offsets, so the previous month of March 2024 is
    /// February 2024 with its 29 days.
    pub fn previous(&self) -> SyncResult<PeriodBounds> {
        let start = match self.period_type.months() {
            None => self.start.checked_sub_days(Days::new(7)),
            Some(months) => self.start.checked_sub_months(Months::new(months)),
        };

        match start {
            Some(start) => Self::starting_at(start, self.period_type),
            None => out_of_range(self.start),
        }
    }

    /// Returns the deterministic key identifying this period.
    ///
    /// Weekly keys are the week start date (`2024-01-14`), monthly `2024-01`, quarterly
    /// `2024-Q1` and yearly `2024`.
    pub fn key(&self) -> String {
        match self.period_type {
            PeriodType::Weekly => self.start.format("%Y-%m-%d").to_string(),
            PeriodType::Monthly => self.start.format("%Y-%m").to_string(),
            PeriodType::Quarterly => {
                format!("{}-Q{}", self.start.year(), self.start.month0() / 3 + 1)
            }
            PeriodType::Yearly => self.start.year().to_string(),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

fn out_of_range<T>(date: NaiveDate) -> SyncResult<T> {
    bail!(
        ErrorKind::InvalidData,
        "Date is outside of the supported calendar range",
        date.to_string()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    fn key(d: NaiveDate, period_type: PeriodType) -> String {
        PeriodBounds::containing(d, period_type, Weekday::Sun)
            .unwrap()
            .key()
    }

    #[test]
    fn period_keys_follow_calendar_buckets() {
        assert_eq!(key(date(2024, 1, 15), PeriodType::Monthly), "2024-01");
        assert_eq!(key(date(2024, 1, 15), PeriodType::Quarterly), "2024-Q1");
        assert_eq!(key(date(2024, 1, 15), PeriodType::Yearly), "2024");
        assert_eq!(key(date(2024, 4, 15), PeriodType::Quarterly), "2024-Q2");
        assert_eq!(key(date(2024, 10, 15), PeriodType::Quarterly), "2024-Q4");
        assert_eq!(key(date(2024, 3, 31), PeriodType::Quarterly), "2024-Q1");
        assert_eq!(key(date(2024, 7, 1), PeriodType::Quarterly), "2024-Q3");
    }

    #[test]
    fn weeks_start_on_sunday_by_default() {
        // 2024-01-15 is a Monday.
        assert_eq!(key(date(2024, 1, 15), PeriodType::Weekly), "2024-01-14");
        assert_eq!(key(date(2024, 1, 14), PeriodType::Weekly), "2024-01-14");
        assert_eq!(key(date(2024, 1, 20), PeriodType::Weekly), "2024-01-14");

        let monday_weeks =
            PeriodBounds::containing(date(2024, 1, 14), PeriodType::Weekly, Weekday::Mon).unwrap();
        assert_eq!(monday_weeks.start, date(2024, 1, 8));
        assert_eq!(monday_weeks.end, date(2024, 1, 14));
    }

    #[test]
    fn weeks_cross_year_boundaries() {
        let bounds =
            PeriodBounds::containing(date(2025, 1, 1), PeriodType::Weekly, Weekday::Sun).unwrap();
        assert_eq!(bounds.start, date(2024, 12, 29));
        assert_eq!(bounds.end, date(2025, 1, 4));
    }

    #[test]
    fn month_ends_respect_leap_years() {
        let leap =
            PeriodBounds::containing(date(2024, 2, 10), PeriodType::Monthly, Weekday::Sun).unwrap();
        assert_eq!(leap.end, date(2024, 2, 29));

        let common =
            PeriodBounds::containing(date(2023, 2, 10), PeriodType::Monthly, Weekday::Sun).unwrap();
        assert_eq!(common.end, date(2023, 2, 28));

        let quarter =
            PeriodBounds::containing(date(2024, 5, 5), PeriodType::Quarterly, Weekday::Sun).unwrap();
        assert_eq!(quarter.start, date(2024, 4, 1));
        assert_eq!(quarter.end, date(2024, 6, 30));

        let year =
            PeriodBounds::containing(date(2024, 5, 5), PeriodType::Yearly, Weekday::Sun).unwrap();
        assert_eq!(year.end, date(2024, 12, 31));
    }

    #[test]
    fn previous_period_uses_calendar_arithmetic() {
        let march =
            PeriodBounds::containing(date(2024, 3, 31), PeriodType::Monthly, Weekday::Sun).unwrap();
        let february = march.previous().unwrap();
        assert_eq!(february.start, date(2024, 2, 1));
        assert_eq!(february.end, date(2024, 2, 29));

        let q1 =
            PeriodBounds::containing(date(2024, 2, 1), PeriodType::Quarterly, Weekday::Sun).unwrap();
        assert_eq!(q1.previous().unwrap().key(), "2023-Q4");

        let year =
            PeriodBounds::containing(date(2024, 2, 1), PeriodType::Yearly, Weekday::Sun).unwrap();
        assert_eq!(year.previous().unwrap().key(), "2023");

        let week =
            PeriodBounds::containing(date(2024, 1, 3), PeriodType::Weekly, Weekday::Sun).unwrap();
        assert_eq!(week.previous().unwrap().key(), "2023-12-24");
    }

    #[test]
    fn parses_period_type_names() {
        assert_eq!("Weekly".parse::<PeriodType>().unwrap(), PeriodType::Weekly);
        assert_eq!("quarter".parse::<PeriodType>().unwrap(), PeriodType::Quarterly);
        assert_eq!(
            "daily".parse::<PeriodType>().unwrap_err().kind(),
            ErrorKind::ConfigError
        );
    }
}
