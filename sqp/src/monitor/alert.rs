use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqp_config::shared::LogLevel;

use crate::error::SyncResult;

/// Signal that raised an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    ErrorRate,
    ExecutionTime,
    DataFreshness,
    MemoryUsage,
    QueueDepth,
    Custom,
}

impl AlertType {
    pub fn as_static_str(&self) -> &'static str {
        match self {
            AlertType::ErrorRate => "error_rate",
            AlertType::ExecutionTime => "execution_time",
            AlertType::DataFreshness => "data_freshness",
            AlertType::MemoryUsage => "memory_usage",
            AlertType::QueueDepth => "queue_depth",
            AlertType::Custom => "custom",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_static_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_static_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }

    /// Level of the audit log entry written for an alert of this severity.
    pub fn log_level(&self) -> LogLevel {
        match self {
            AlertSeverity::Info => LogLevel::Info,
            AlertSeverity::Warning => LogLevel::Warning,
            AlertSeverity::Critical => LogLevel::Error,
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_static_str())
    }
}

/// A threshold breach detected by the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub pipeline_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        pipeline_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            alert_type,
            severity,
            pipeline_id: pipeline_id.into(),
            message: message.into(),
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Destination of alerts, registered on the monitor under a name.
///
/// Delivery failures are logged by the monitor and never fail a run.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn send(&self, alert: &Alert) -> SyncResult<()>;
}
