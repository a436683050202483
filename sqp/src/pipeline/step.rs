use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqp_config::shared::PipelineStepConfig;

use crate::error::SyncResult;

/// Metadata keys holding the number of records a step produced.
const RECORD_COUNT_KEYS: &[&str] = &["record_count", "recordCount"];

/// Step config keys naming the table a load step writes into.
const TARGET_TABLE_KEYS: &[&str] = &["target_table", "targetTable"];

/// Output of an extract, transform or custom step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl StepOutput {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Number of records produced, taken from the `record_count` metadata or else from the
    /// length of an array payload.
    pub fn record_count(&self) -> u64 {
        RECORD_COUNT_KEYS
            .iter()
            .find_map(|key| self.metadata.get(*key).and_then(serde_json::Value::as_u64))
            .or_else(|| self.data.as_array().map(|records| records.len() as u64))
            .unwrap_or(0)
    }
}

/// Result reported by a [`Syncer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub records_processed: u64,
}

/// Reads records from the warehouse.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, step: &PipelineStepConfig) -> SyncResult<StepOutput>;
}

/// Reshapes the output of an earlier step.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(
        &self,
        data: serde_json::Value,
        step: &PipelineStepConfig,
    ) -> SyncResult<StepOutput>;
}

/// Writes records into a target table of the relational sink.
#[async_trait]
pub trait Syncer: Send + Sync {
    async fn sync(&self, data: serde_json::Value, target_table: &str) -> SyncResult<SyncOutcome>;
}

/// Capability behind steps of type `custom`.
#[async_trait]
pub trait CustomStep: Send + Sync {
    async fn run(
        &self,
        input: serde_json::Value,
        step: &PipelineStepConfig,
    ) -> SyncResult<StepOutput>;
}

/// Capabilities injected into the orchestrator, selected per step type.
///
/// Custom capabilities are looked up by the `handler` option of the step, falling back to the
/// step name.
#[derive(Clone, Default)]
pub struct StepCapabilities {
    pub extractor: Option<Arc<dyn Extractor>>,
    pub transformer: Option<Arc<dyn Transformer>>,
    pub syncer: Option<Arc<dyn Syncer>>,
    pub custom: HashMap<String, Arc<dyn CustomStep>>,
}

impl StepCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn with_syncer(mut self, syncer: Arc<dyn Syncer>) -> Self {
        self.syncer = Some(syncer);
        self
    }

    pub fn with_custom(mut self, name: impl Into<String>, step: Arc<dyn CustomStep>) -> Self {
        self.custom.insert(name.into(), step);
        self
    }

    pub(crate) fn custom_for(&self, step: &PipelineStepConfig) -> Option<&Arc<dyn CustomStep>> {
        let handler = step
            .config
            .get("handler")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(&step.name);

        self.custom.get(handler)
    }
}

impl fmt::Debug for StepCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepCapabilities")
            .field("extractor", &self.extractor.is_some())
            .field("transformer", &self.transformer.is_some())
            .field("syncer", &self.syncer.is_some())
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Table a load step writes into.
pub fn target_table(step: &PipelineStepConfig) -> &str {
    TARGET_TABLE_KEYS
        .iter()
        .find_map(|key| step.config.get(*key).and_then(serde_json::Value::as_str))
        .unwrap_or(&step.name)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sqp_config::shared::StepType;

    use super::*;

    #[test]
    fn record_count_prefers_metadata() {
        let output = StepOutput::new(json!([1, 2, 3]));
        assert_eq!(output.record_count(), 3);

        let output = output.with_metadata("recordCount", 10);
        assert_eq!(output.record_count(), 10);

        assert_eq!(StepOutput::new(json!({"rows": 4})).record_count(), 0);
    }

    #[test]
    fn target_table_defaults_to_step_name() {
        let step = PipelineStepConfig::new("load_weekly", StepType::Load);
        assert_eq!(target_table(&step), "load_weekly");

        let step = step.with_option("targetTable", json!("sqp_weekly"));
        assert_eq!(target_table(&step), "sqp_weekly");
    }
}
