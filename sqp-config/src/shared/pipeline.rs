use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::{AlertThresholds, ValidationError};

/// Kind of work a pipeline step performs, used to select the injected capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Reads records from the warehouse.
    Extract,
    /// Reshapes or aggregates the output of a previous step.
    Transform,
    /// Writes the output of a previous step into the relational sink.
    Load,
    /// Runs a named custom capability.
    Custom,
}

impl StepType {
    pub fn as_static_str(&self) -> &'static str {
        match self {
            StepType::Extract => "extract",
            StepType::Transform => "transform",
            StepType::Load => "load",
            StepType::Custom => "custom",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_static_str())
    }
}

/// Configuration of a single pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStepConfig {
    /// Unique step name within the pipeline.
    pub name: String,
    /// Capability used to execute the step.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Free-form options handed to the capability.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    /// Steps that must have succeeded in the same run before this one executes.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Whether failed attempts may be retried.
    #[serde(default = "default_retryable")]
    pub retryable: bool,
    /// Upper bound for a single attempt of the step, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl PipelineStepConfig {
    /// Creates a retryable step without options or dependencies.
    pub fn new(name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            name: name.into(),
            step_type,
            config: serde_json::Map::new(),
            dependencies: Vec::new(),
            retryable: true,
            timeout_ms: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

fn default_retryable() -> bool {
    true
}

/// Data-quality rules checked on the final output of a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Identifier fields every record must carry with a non-empty value.
    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<String>,
    /// Numeric fields that must never be negative.
    #[serde(default = "default_non_negative_fields")]
    pub non_negative_fields: Vec<String>,
    /// Field holding the record date used for the freshness check.
    #[serde(default = "default_date_field")]
    pub date_field: String,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            required_fields: default_required_fields(),
            non_negative_fields: default_non_negative_fields(),
            date_field: default_date_field(),
        }
    }
}

fn default_required_fields() -> Vec<String> {
    vec!["query".to_string(), "asin".to_string()]
}

fn default_non_negative_fields() -> Vec<String> {
    [
        "impressions",
        "clicks",
        "purchases",
        "total_impressions",
        "total_clicks",
        "total_purchases",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_date_field() -> String {
    "date".to_string()
}

/// Configuration of a batch pipeline. Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Identity used for the single-flight lock and all persisted rows.
    pub id: String,
    /// Human readable name.
    pub name: String,
    /// Standard 5-field cron expression.
    pub schedule: String,
    /// Retries allowed per step after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay of the exponential backoff between attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Steps executed strictly in this order.
    pub steps: Vec<PipelineStepConfig>,
    #[serde(default)]
    pub alert_thresholds: AlertThresholds,
    /// Names of the alert channels every alert is dispatched to.
    #[serde(default)]
    pub alert_channels: Vec<String>,
    /// Age after which a held lock may be taken over by another run.
    #[serde(default = "default_stale_lock_timeout_ms")]
    pub stale_lock_timeout_ms: u64,
    #[serde(default)]
    pub quality: QualityConfig,
}

impl PipelineConfig {
    /// Default age after which a held lock is considered stale.
    pub const DEFAULT_STALE_LOCK_TIMEOUT_MS: u64 = 5 * 60 * 1000;

    pub fn new(
        id: impl Into<String>,
        schedule: impl Into<String>,
        steps: Vec<PipelineStepConfig>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            schedule: schedule.into(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            steps,
            alert_thresholds: AlertThresholds::default(),
            alert_channels: Vec::new(),
            stale_lock_timeout_ms: default_stale_lock_timeout_ms(),
            quality: QualityConfig::default(),
        }
    }

    pub fn stale_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_lock_timeout_ms)
    }

    /// Names of the configured steps, in execution order.
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.name.clone()).collect()
    }

    /// Validates step names, dependency ordering and the schedule.
    ///
    /// Dependencies must refer to steps configured earlier, which makes the configured order a
    /// valid topological order.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.schedule.trim().is_empty() {
            return Err(ValidationError::EmptySchedule(self.id.clone()));
        }

        if self.steps.is_empty() {
            return Err(ValidationError::NoSteps(self.id.clone()));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            for dependency in &step.dependencies {
                if dependency == &step.name {
                    return Err(ValidationError::SelfDependency(step.name.clone()));
                }

                if !seen.contains(dependency.as_str()) {
                    return Err(ValidationError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }

            if !seen.insert(step.name.as_str()) {
                return Err(ValidationError::DuplicateStep(step.name.clone()));
            }
        }

        self.alert_thresholds.validate()
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_stale_lock_timeout_ms() -> u64 {
    PipelineConfig::DEFAULT_STALE_LOCK_TIMEOUT_MS
}
