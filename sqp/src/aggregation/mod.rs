//! Calendar-period aggregation of search query performance records.
//!
//! Records are bucketed by a period key derived from their date, summed per
//! `(period, query, asin)` and enriched with click-through and conversion ratios, optional
//! share-of-query metrics and period-over-period deltas. Everything here is a pure function of
//! its input; output is sorted by period, query and asin.

mod aggregator;
mod period;
mod record;

pub use aggregator::{
    AggregatedMetrics, AggregationOptions, MetricChange, PeriodComparison, aggregate_by_period,
    calculate_period_comparison, safe_divide,
};
pub use period::{PeriodBounds, PeriodType};
pub use record::SearchQueryRecord;
