use std::collections::HashSet;

use serde::Deserialize;

use crate::Config;
use crate::shared::{
    BigQueryConfig, MonitorConfig, PgConnectionConfig, PipelineConfig, PoolConfig, StoreConfig,
    ValidationError, WebhookChannelConfig,
};

/// Top-level configuration of the runner binary.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    pub warehouse: BigQueryConfig,
    pub store: StoreConfig,
    /// Database the load steps write into.
    pub sink: PgConnectionConfig,
    #[serde(default)]
    pub webhooks: Vec<WebhookChannelConfig>,
    /// Address of the Prometheus exporter, disabled when unset.
    #[serde(default)]
    pub metrics_address: Option<String>,
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.pipeline.validate()?;
        self.pool.validate()?;
        self.warehouse.validate()?;
        self.store.validate()?;
        self.sink.validate()?;

        let mut names = HashSet::new();
        for webhook in &self.webhooks {
            webhook.validate()?;
            if !names.insert(webhook.name.as_str()) {
                return Err(ValidationError::InvalidFieldValue {
                    field: "webhooks".to_string(),
                    constraint: format!("channel name `{}` is used more than once", webhook.name),
                });
            }
        }

        Ok(())
    }
}

impl Config for RunnerConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["pipeline.alert_channels"];
}
