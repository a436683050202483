use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqp_config::shared::{MonitorConfig, PipelineConfig, PipelineStepConfig, PoolConfig, StepType};

use crate::pipeline::{PipelineOrchestrator, StepCapabilities};
use crate::pool::ConnectionPool;
use crate::schedule::FixedInterval;
use crate::store::both::memory::MemoryStore;
use crate::test_utils::client::MockClientFactory;

/// Two search query records of the week starting on Sunday 2024-01-14.
pub fn sample_records() -> serde_json::Value {
    json!([
        {"query": "running shoes", "asin": "B0001", "date": "2024-01-15", "impressions": 100, "clicks": 10, "purchases": 1},
        {"query": "running shoes", "asin": "B0001", "date": "2024-01-15", "impressions": 150, "clicks": 15, "purchases": 2},
    ])
}

/// `extract -> transform -> load` with short retry delays.
pub fn three_step_config(pipeline_id: &str) -> PipelineConfig {
    let steps = vec![
        PipelineStepConfig::new("extract", StepType::Extract),
        PipelineStepConfig::new("transform", StepType::Transform).with_dependencies(["extract"]),
        PipelineStepConfig::new("load", StepType::Load)
            .with_dependencies(["transform"])
            .with_option("target_table", json!("search_query_weekly")),
    ];

    let mut config = PipelineConfig::new(pipeline_id, "0 3 * * *", steps);
    config.max_retries = 3;
    config.retry_delay_ms = 10;

    config
}

pub fn test_pool_config() -> PoolConfig {
    PoolConfig {
        min_clients: 0,
        max_clients: 2,
        acquire_timeout_ms: 200,
        idle_timeout_ms: 60_000,
        idle_check_interval_ms: 60_000,
    }
}

/// Builds an orchestrator over `store` with a mock warehouse pool.
///
/// Must be called within a tokio runtime.
pub fn create_orchestrator(
    config: PipelineConfig,
    store: MemoryStore,
    capabilities: StepCapabilities,
) -> PipelineOrchestrator<MemoryStore, MockClientFactory> {
    let pool = ConnectionPool::new(MockClientFactory::new(), test_pool_config());

    PipelineOrchestrator::new(
        config,
        MonitorConfig::default(),
        store,
        pool,
        capabilities,
        Arc::new(FixedInterval::new(Duration::from_secs(60))),
    )
    .expect("test pipeline config is valid")
}
