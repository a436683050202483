use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregation::safe_divide;
use crate::monitor::{RunMetrics, RunStatus};

/// Deviation from the baseline mean, in standard deviations, above which a run is anomalous.
pub(crate) const ANOMALY_Z_SCORE: f64 = 2.0;

/// Fraction of failed steps across `runs`.
pub(crate) fn error_rate(runs: &[RunMetrics]) -> f64 {
    let total: usize = runs.iter().map(|run| run.steps.len()).sum();
    let failed: usize = runs.iter().map(RunMetrics::failed_steps).sum();

    safe_divide(failed as f64, total as f64)
}

fn mean_and_stddev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }

    let count = values.len() as f64;
    let mean = values.iter().sum::<f64>() / count;
    let variance = values.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / count;

    (mean, variance.sqrt())
}

/// Z-score of `delta` and whether it makes the run anomalous.
///
/// Against a baseline without spread any deviation is anomalous and has no finite z-score.
fn deviation(delta: f64, stddev: f64) -> (Option<f64>, bool) {
    if stddev > 0.0 {
        let z_score = delta / stddev;
        return (Some(z_score), z_score.abs() > ANOMALY_Z_SCORE);
    }

    if delta == 0.0 {
        (Some(0.0), false)
    } else {
        (None, true)
    }
}

/// Duration of a run compared with the baseline of recent successful runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAnalysis {
    pub baseline_runs: usize,
    pub average_duration_ms: f64,
    pub stddev_duration_ms: f64,
    pub current_duration_ms: Option<f64>,
    pub z_score: Option<f64>,
    pub is_anomaly: bool,
    /// Average duration of every step across the baseline runs.
    pub step_average_durations_ms: BTreeMap<String, f64>,
    pub slowest_step: Option<String>,
}

impl PerformanceAnalysis {
    /// Compares `current` with the successful runs of `baseline` other than `current` itself.
    pub(crate) fn compute(
        current: Option<&RunMetrics>,
        baseline: &[RunMetrics],
        now: DateTime<Utc>,
    ) -> Self {
        let current_run_id = current.map(|run| run.run_id);
        let baseline: Vec<&RunMetrics> = baseline
            .iter()
            .filter(|run| run.status == RunStatus::Success && Some(run.run_id) != current_run_id)
            .collect();

        let durations: Vec<f64> = baseline
            .iter()
            .filter_map(|run| run.duration_ms)
            .map(|duration| duration as f64)
            .collect();
        let (average, stddev) = mean_and_stddev(&durations);

        let current_duration = current.map(|run| run.elapsed_ms(now) as f64);
        let (z_score, is_anomaly) = match current_duration {
            Some(duration) if !durations.is_empty() => deviation(duration - average, stddev),
            _ => (None, false),
        };

        let mut step_totals: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for step in baseline.iter().flat_map(|run| run.steps.iter()) {
            let entry = step_totals.entry(step.step_name.clone()).or_default();
            entry.0 += step.duration_ms as f64;
            entry.1 += 1;
        }
        let step_average_durations_ms: BTreeMap<String, f64> = step_totals
            .into_iter()
            .map(|(step, (total, count))| (step, safe_divide(total, count as f64)))
            .collect();
        let slowest_step = step_average_durations_ms
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(step, _)| step.clone());

        Self {
            baseline_runs: baseline.len(),
            average_duration_ms: average,
            stddev_duration_ms: stddev,
            current_duration_ms: current_duration,
            z_score,
            is_anomaly,
            step_average_durations_ms,
            slowest_step,
        }
    }
}

/// Short description of a run for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub records_processed: u64,
    pub error: Option<String>,
}

impl From<&RunMetrics> for RunSummary {
    fn from(run: &RunMetrics) -> Self {
        Self {
            run_id: run.run_id,
            status: run.status,
            start_time: run.start_time,
            duration_ms: run.duration_ms,
            records_processed: run.records_processed,
            error: run.error.clone(),
        }
    }
}

/// Health overview of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardMetrics {
    pub pipeline_id: String,
    pub total_runs: usize,
    pub successful_runs: usize,
    pub failed_runs: usize,
    pub success_rate: f64,
    pub error_rate: f64,
    pub average_duration_ms: f64,
    pub last_run: Option<RunSummary>,
    pub current_run_id: Option<Uuid>,
    /// Records per second of the current or last run.
    pub throughput: f64,
    pub recent_errors: usize,
}

impl DashboardMetrics {
    pub(crate) fn compute(
        pipeline_id: &str,
        runs: &[RunMetrics],
        current: Option<&RunMetrics>,
        recent_errors: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let finished: Vec<&RunMetrics> = runs.iter().filter(|run| run.is_finished()).collect();
        let successful_runs = finished
            .iter()
            .filter(|run| run.status == RunStatus::Success)
            .count();
        let failed_runs = finished
            .iter()
            .filter(|run| run.status == RunStatus::Failed)
            .count();
        let durations: Vec<f64> = finished
            .iter()
            .filter_map(|run| run.duration_ms)
            .map(|duration| duration as f64)
            .collect();
        let (average_duration_ms, _) = mean_and_stddev(&durations);

        let current_run_id = current
            .filter(|run| !run.is_finished())
            .map(|run| run.run_id);
        let throughput = current
            .or_else(|| finished.first().copied())
            .map(|run| run.throughput(now))
            .unwrap_or(0.0);

        Self {
            pipeline_id: pipeline_id.to_string(),
            total_runs: finished.len(),
            successful_runs,
            failed_runs,
            success_rate: safe_divide(successful_runs as f64, finished.len() as f64),
            error_rate: error_rate(runs),
            average_duration_ms,
            last_run: finished.first().map(|run| RunSummary::from(*run)),
            current_run_id,
            throughput,
            recent_errors,
        }
    }
}
