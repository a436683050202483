use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::aggregation::{PeriodBounds, PeriodType, SearchQueryRecord};
use crate::error::SyncResult;

/// Divides `numerator` by `denominator`, returning 0 instead of NaN or infinity.
pub fn safe_divide(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        return 0.0;
    }

    let result = numerator / denominator;
    if result.is_finite() { result } else { 0.0 }
}

/// Options of [`aggregate_by_period`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationOptions {
    /// Computes each asin's share of its query's totals within a period.
    pub include_share_metrics: bool,
    /// First day of weekly periods.
    pub week_start: Weekday,
}

impl Default for AggregationOptions {
    fn default() -> Self {
        Self {
            include_share_metrics: false,
            week_start: Weekday::Sun,
        }
    }
}

/// Totals and ratios of one `(period, query, asin)` group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub period_key: String,
    pub period_type: PeriodType,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub query: String,
    pub asin: String,
    pub total_impressions: u64,
    pub total_clicks: u64,
    pub total_purchases: u64,
    /// Clicks per impression.
    pub avg_ctr: f64,
    /// Purchases per click.
    pub avg_cvr: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impression_share: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub click_share: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_share: Option<f64>,
}

impl AggregatedMetrics {
    fn bounds(&self) -> PeriodBounds {
        PeriodBounds {
            period_type: self.period_type,
            start: self.period_start,
            end: self.period_end,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    impressions: u64,
    clicks: u64,
    purchases: u64,
}

impl Totals {
    fn add(&mut self, impressions: u64, clicks: u64, purchases: u64) {
        self.impressions = self.impressions.saturating_add(impressions);
        self.clicks = self.clicks.saturating_add(clicks);
        self.purchases = self.purchases.saturating_add(purchases);
    }
}

/// Buckets `records` into calendar periods and sums them per `(period, query, asin)`.
///
/// Empty input yields an empty result.
pub fn aggregate_by_period(
    records: &[SearchQueryRecord],
    period_type: PeriodType,
    options: AggregationOptions,
) -> SyncResult<Vec<AggregatedMetrics>> {
    let mut groups: BTreeMap<(PeriodBounds, String, String), Totals> = BTreeMap::new();
    for record in records {
        let bounds = PeriodBounds::containing(record.date, period_type, options.week_start)?;
        groups
            .entry((bounds, record.query.clone(), record.asin.clone()))
            .or_default()
            .add(record.impressions, record.clicks, record.purchases);
    }

    let cohort_totals = if options.include_share_metrics {
        let mut cohorts: HashMap<(PeriodBounds, &str), Totals> = HashMap::new();
        for ((bounds, query, _), totals) in &groups {
            cohorts.entry((*bounds, query.as_str())).or_default().add(
                totals.impressions,
                totals.clicks,
                totals.purchases,
            );
        }
        Some(cohorts)
    } else {
        None
    };

    let aggregated = groups
        .iter()
        .map(|((bounds, query, asin), totals)| {
            let cohort = cohort_totals
                .as_ref()
                .and_then(|cohorts| cohorts.get(&(*bounds, query.as_str())));

            AggregatedMetrics {
                period_key: bounds.key(),
                period_type,
                period_start: bounds.start,
                period_end: bounds.end,
                query: query.clone(),
                asin: asin.clone(),
                total_impressions: totals.impressions,
                total_clicks: totals.clicks,
                total_purchases: totals.purchases,
                avg_ctr: safe_divide(totals.clicks as f64, totals.impressions as f64),
                avg_cvr: safe_divide(totals.purchases as f64, totals.clicks as f64),
                impression_share: cohort.map(|cohort| {
                    safe_divide(totals.impressions as f64, cohort.impressions as f64)
                }),
                click_share: cohort
                    .map(|cohort| safe_divide(totals.clicks as f64, cohort.clicks as f64)),
                purchase_share: cohort
                    .map(|cohort| safe_divide(totals.purchases as f64, cohort.purchases as f64)),
            }
        })
        .collect();

    Ok(aggregated)
}

/// Change of one metric against the previous period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricChange {
    pub current: f64,
    pub previous: f64,
    pub absolute_change: f64,
    /// Relative change in percent, 0 when the previous value is 0.
    pub percent_change: f64,
}

impl MetricChange {
    fn new(current: f64, previous: f64) -> Self {
        let absolute_change = current - previous;
        Self {
            current,
            previous,
            absolute_change,
            percent_change: safe_divide(absolute_change, previous) * 100.0,
        }
    }
}

/// Period-over-period comparison of one `(query, asin)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodComparison {
    pub period_key: String,
    pub previous_period_key: String,
    pub period_type: PeriodType,
    pub query: String,
    pub asin: String,
    /// Whether the previous period had data for this pair. Previous values are 0 otherwise.
    pub has_previous: bool,
    pub impressions: MetricChange,
    pub clicks: MetricChange,
    pub purchases: MetricChange,
    pub ctr: MetricChange,
    pub cvr: MetricChange,
}

/// Compares every row of `current_period_data` with the row of the same `(query, asin)` in the
/// immediately preceding period of `period_type`.
///
/// Rows of other period types are ignored.
pub fn calculate_period_comparison(
    current_period_data: &[AggregatedMetrics],
    period_type: PeriodType,
) -> SyncResult<Vec<PeriodComparison>> {
    let rows: Vec<&AggregatedMetrics> = current_period_data
        .iter()
        .filter(|row| row.period_type == period_type)
        .collect();

    let by_key: HashMap<(&str, &str, &str), &AggregatedMetrics> = rows
        .iter()
        .map(|row| {
            (
                (row.period_key.as_str(), row.query.as_str(), row.asin.as_str()),
                *row,
            )
        })
        .collect();

    let mut comparisons = Vec::with_capacity(rows.len());
    for row in &rows {
        let previous_key = row.bounds().previous()?.key();
        let previous = by_key
            .get(&(previous_key.as_str(), row.query.as_str(), row.asin.as_str()))
            .copied();

        let change = |current: fn(&AggregatedMetrics) -> f64| {
            MetricChange::new(current(row), previous.map(current).unwrap_or(0.0))
        };

        comparisons.push(PeriodComparison {
            period_key: row.period_key.clone(),
            previous_period_key: previous_key,
            period_type,
            query: row.query.clone(),
            asin: row.asin.clone(),
            has_previous: previous.is_some(),
            impressions: change(|m| m.total_impressions as f64),
            clicks: change(|m| m.total_clicks as f64),
            purchases: change(|m| m.total_purchases as f64),
            ctr: change(|m| m.avg_ctr),
            cvr: change(|m| m.avg_cvr),
        });
    }

    comparisons.sort_by(|a, b| {
        (&a.period_key, &a.query, &a.asin).cmp(&(&b.period_key, &b.query, &b.asin))
    });

    Ok(comparisons)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    #[test]
    fn safe_divide_never_returns_nan_or_infinity() {
        assert_eq!(safe_divide(1.0, 0.0), 0.0);
        assert_eq!(safe_divide(0.0, 0.0), 0.0);
        assert_eq!(safe_divide(f64::MAX, f64::MIN_POSITIVE), 0.0);
        assert_eq!(safe_divide(1.0, 4.0), 0.25);
    }

    #[test]
    fn weekly_bucketing_sums_records_of_the_same_week() {
        let records = vec![
            SearchQueryRecord::new(date(2024, 1, 15), "shoes", "B01").with_counts(100, 10, 1),
            SearchQueryRecord::new(date(2024, 1, 15), "shoes", "B01").with_counts(150, 15, 2),
        ];

        let aggregated =
            aggregate_by_period(&records, PeriodType::Weekly, AggregationOptions::default())
                .unwrap();

        assert_eq!(aggregated.len(), 1);
        let row = &aggregated[0];
        assert_eq!(row.total_impressions, 250);
        assert_eq!(row.total_clicks, 25);
        assert_eq!(row.total_purchases, 3);
        assert_eq!(row.avg_ctr, 0.1);
        assert_eq!(row.avg_cvr, 3.0 / 25.0);
        assert_eq!(row.period_key, "2024-01-14");
        assert_eq!(row.impression_share, None);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let aggregated =
            aggregate_by_period(&[], PeriodType::Monthly, AggregationOptions::default()).unwrap();
        assert!(aggregated.is_empty());
    }

    #[test]
    fn zero_impressions_produce_zero_ratios() {
        let records =
            vec![SearchQueryRecord::new(date(2024, 1, 15), "shoes", "B01").with_counts(0, 0, 0)];
        let aggregated =
            aggregate_by_period(&records, PeriodType::Monthly, AggregationOptions::default())
                .unwrap();

        assert_eq!(aggregated[0].avg_ctr, 0.0);
        assert_eq!(aggregated[0].avg_cvr, 0.0);
    }

    #[test]
    fn share_metrics_split_query_totals_between_asins() {
        let records = vec![
            SearchQueryRecord::new(date(2024, 1, 2), "shoes", "B01").with_counts(300, 30, 3),
            SearchQueryRecord::new(date(2024, 1, 20), "shoes", "B02").with_counts(100, 10, 0),
            SearchQueryRecord::new(date(2024, 1, 20), "socks", "B03").with_counts(50, 5, 1),
        ];
        let options = AggregationOptions {
            include_share_metrics: true,
            ..AggregationOptions::default()
        };

        let aggregated = aggregate_by_period(&records, PeriodType::Monthly, options).unwrap();

        assert_eq!(aggregated.len(), 3);
        let b01 = aggregated.iter().find(|row| row.asin == "B01").unwrap();
        assert_eq!(b01.impression_share, Some(0.75));
        assert_eq!(b01.click_share, Some(0.75));
        assert_eq!(b01.purchase_share, Some(1.0));

        let b02 = aggregated.iter().find(|row| row.asin == "B02").unwrap();
        assert_eq!(b02.purchase_share, Some(0.0));

        let b03 = aggregated.iter().find(|row| row.asin == "B03").unwrap();
        assert_eq!(b03.impression_share, Some(1.0));
    }

    #[test]
    fn output_is_independent_of_input_order() {
        let mut records = vec![
            SearchQueryRecord::new(date(2024, 3, 2), "b", "2").with_counts(1, 1, 1),
            SearchQueryRecord::new(date(2024, 1, 2), "a", "1").with_counts(2, 1, 0),
            SearchQueryRecord::new(date(2024, 2, 2), "a", "1").with_counts(3, 1, 0),
        ];
        let forward =
            aggregate_by_period(&records, PeriodType::Monthly, AggregationOptions::default())
                .unwrap();
        records.reverse();
        let backward =
            aggregate_by_period(&records, PeriodType::Monthly, AggregationOptions::default())
                .unwrap();

        assert_eq!(forward, backward);
        let keys: Vec<_> = forward.iter().map(|row| row.period_key.as_str()).collect();
        assert_eq!(keys, vec!["2024-01", "2024-02", "2024-03"]);
    }

    #[test]
    fn comparison_uses_previous_calendar_month() {
        let records = vec![
            SearchQueryRecord::new(date(2024, 2, 29), "shoes", "B01").with_counts(100, 10, 1),
            SearchQueryRecord::new(date(2024, 3, 1), "shoes", "B01").with_counts(150, 30, 3),
        ];
        let aggregated =
            aggregate_by_period(&records, PeriodType::Monthly, AggregationOptions::default())
                .unwrap();

        let comparisons = calculate_period_comparison(&aggregated, PeriodType::Monthly).unwrap();

        assert_eq!(comparisons.len(), 2);
        let february = &comparisons[0];
        assert!(!february.has_previous);
        assert_eq!(february.previous_period_key, "2024-01");
        assert_eq!(february.impressions.percent_change, 0.0);

        let march = &comparisons[1];
        assert!(march.has_previous);
        assert_eq!(march.previous_period_key, "2024-02");
        assert_eq!(march.impressions.absolute_change, 50.0);
        assert_eq!(march.impressions.percent_change, 50.0);
        assert_eq!(march.clicks.percent_change, 200.0);
    }

    #[test]
    fn comparison_of_quarters_wraps_years() {
        let records = vec![
            SearchQueryRecord::new(date(2023, 11, 30), "q", "a").with_counts(200, 20, 2),
            SearchQueryRecord::new(date(2024, 1, 1), "q", "a").with_counts(100, 10, 1),
        ];
        let aggregated =
            aggregate_by_period(&records, PeriodType::Quarterly, AggregationOptions::default())
                .unwrap();
        let comparisons =
            calculate_period_comparison(&aggregated, PeriodType::Quarterly).unwrap();

        let q1 = comparisons
            .iter()
            .find(|comparison| comparison.period_key == "2024-Q1")
            .unwrap();
        assert_eq!(q1.previous_period_key, "2023-Q4");
        assert_eq!(q1.impressions.percent_change, -50.0);
    }
}
