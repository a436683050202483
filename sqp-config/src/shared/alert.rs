use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Thresholds evaluated by the monitor after every run.
///
/// Only `error_rate` is always checked. The remaining checks are skipped when unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Fraction of failed steps across recent runs that raises a critical alert.
    #[serde(default = "default_error_rate")]
    pub error_rate: f64,
    /// Elapsed run time above which a warning is raised.
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    /// Maximum tolerated age of the newest synced record.
    #[serde(default)]
    pub data_freshness_ms: Option<u64>,
    /// Resident memory of the process above which a warning is raised.
    #[serde(default)]
    pub memory_usage_bytes: Option<u64>,
}

impl AlertThresholds {
    pub fn execution_time(&self) -> Option<Duration> {
        self.execution_time_ms.map(Duration::from_millis)
    }

    pub fn data_freshness(&self) -> Option<Duration> {
        self.data_freshness_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(0.0..=1.0).contains(&self.error_rate) {
            return Err(ValidationError::InvalidFieldValue {
                field: "alert_thresholds.error_rate".to_string(),
                constraint: "must be between 0 and 1".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate: default_error_rate(),
            execution_time_ms: None,
            data_freshness_ms: None,
            memory_usage_bytes: None,
        }
    }
}

fn default_error_rate() -> f64 {
    0.1
}

/// A named webhook alert channel.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookChannelConfig {
    /// Name referenced from [`crate::shared::PipelineConfig::alert_channels`].
    pub name: String,
    pub url: String,
    /// Sent as a bearer token when present.
    #[serde(default)]
    pub token: Option<SecretString>,
}

impl WebhookChannelConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ValidationError::InvalidFieldValue {
                field: format!("webhooks.{}.url", self.name),
                constraint: "must be an http or https url".to_string(),
            });
        }

        Ok(())
    }
}
