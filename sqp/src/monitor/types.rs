use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqp_config::shared::LogLevel;
use uuid::Uuid;

/// Status of a run as recorded in its metrics row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_static_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_static_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status `{other}`")),
        }
    }
}

/// Metrics of the latest attempt of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step_name: String,
    pub success: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub records_processed: u64,
    /// Attempts made so far, including this one.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepMetrics {
    /// Builds metrics for an attempt that started at `start_time` and ends now.
    pub fn finished(
        step_name: impl Into<String>,
        start_time: DateTime<Utc>,
        attempts: u32,
        records_processed: u64,
        error: Option<String>,
    ) -> Self {
        let end_time = Utc::now();
        let duration_ms = (end_time - start_time).num_milliseconds().max(0) as u64;

        Self {
            step_name: step_name.into(),
            success: error.is_none(),
            start_time,
            end_time,
            duration_ms,
            records_processed,
            attempts,
            error,
        }
    }
}

/// Metrics row of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub run_id: Uuid,
    pub pipeline_id: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Records handled by the successful steps of the run.
    pub records_processed: u64,
    /// Latest attempt of every executed step, in execution order.
    pub steps: Vec<StepMetrics>,
    pub error: Option<String>,
}

impl RunMetrics {
    pub fn started(run_id: Uuid, pipeline_id: impl Into<String>) -> Self {
        Self {
            run_id,
            pipeline_id: pipeline_id.into(),
            status: RunStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            records_processed: 0,
            steps: Vec::new(),
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// Duration of a finished run, or the time elapsed so far.
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        match self.duration_ms {
            Some(duration_ms) => duration_ms,
            None => (now - self.start_time).num_milliseconds().max(0) as u64,
        }
    }

    /// Replaces the metrics of a step with its latest attempt.
    pub fn upsert_step(&mut self, metrics: StepMetrics) {
        match self
            .steps
            .iter_mut()
            .find(|step| step.step_name == metrics.step_name)
        {
            Some(existing) => *existing = metrics,
            None => self.steps.push(metrics),
        }

        self.records_processed = self
            .steps
            .iter()
            .filter(|step| step.success)
            .map(|step| step.records_processed)
            .sum();
    }

    pub fn failed_steps(&self) -> usize {
        self.steps.iter().filter(|step| !step.success).count()
    }

    /// Records processed per second, 0 for runs without a measurable duration.
    pub fn throughput(&self, now: DateTime<Utc>) -> f64 {
        let elapsed_ms = self.elapsed_ms(now);
        if elapsed_ms == 0 {
            return 0.0;
        }

        self.records_processed as f64 / (elapsed_ms as f64 / 1000.0)
    }
}

/// Persisted error of a step attempt or a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub pipeline_id: String,
    pub run_id: Option<Uuid>,
    pub step: Option<String>,
    pub error_kind: String,
    pub message: String,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Persisted pipeline log entry. Only warnings, errors and alerts are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub pipeline_id: String,
    pub run_id: Option<Uuid>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, success: bool, records: u64) -> StepMetrics {
        let error = (!success).then(|| "boom".to_string());
        StepMetrics::finished(name, Utc::now(), 1, records, error)
    }

    #[test]
    fn keeps_only_latest_attempt_per_step() {
        let mut run = RunMetrics::started(Uuid::new_v4(), "sqp");
        run.upsert_step(step("extract", false, 0));
        run.upsert_step(step("extract", true, 10));
        run.upsert_step(step("load", true, 10));

        assert_eq!(run.steps.len(), 2);
        assert_eq!(run.failed_steps(), 0);
        assert_eq!(run.records_processed, 20);
    }

    #[test]
    fn throughput_uses_recorded_duration() {
        let mut run = RunMetrics::started(Uuid::new_v4(), "sqp");
        run.records_processed = 500;
        run.duration_ms = Some(2000);

        assert_eq!(run.throughput(Utc::now()), 250.0);

        run.duration_ms = Some(0);
        assert_eq!(run.throughput(Utc::now()), 0.0);
    }
}
