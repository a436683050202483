use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of a pipeline log entry, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_static_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }

    /// Entries at this level are written to the monitor store.
    pub fn is_persisted(&self) -> bool {
        *self >= LogLevel::Warning
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_static_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

/// Settings of the pipeline monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Minimum level of pipeline log entries that are emitted.
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    /// Number of most recent runs considered for the error rate.
    #[serde(default = "default_error_rate_window")]
    pub error_rate_window: u32,
    /// Number of completed runs forming the duration baseline for anomaly detection.
    #[serde(default = "default_baseline_window")]
    pub baseline_window: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            error_rate_window: default_error_rate_window(),
            baseline_window: default_baseline_window(),
        }
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_error_rate_window() -> u32 {
    10
}

fn default_baseline_window() -> u32 {
    20
}
