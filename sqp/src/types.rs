//! Shared data types passed between the pool, steps and the aggregation engine.

/// A single warehouse row or synced record, keyed by column name.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Identity of a pipeline, used for the single-flight lock and persisted rows.
pub type PipelineId = String;
