use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sqp_config::shared::PipelineStepConfig;

use crate::error::{ErrorKind, SyncResult};
use crate::pipeline::{Extractor, StepOutput, SyncOutcome, Syncer, Transformer};
use crate::sync_error;

/// Extractor returning fixed records after failing a scripted number of times.
#[derive(Debug)]
pub struct ScriptedExtractor {
    records: serde_json::Value,
    failures_left: AtomicU32,
    error_kind: ErrorKind,
    delay: Option<Duration>,
    invocations: AtomicU32,
}

impl ScriptedExtractor {
    pub fn new(records: serde_json::Value) -> Self {
        Self {
            records,
            failures_left: AtomicU32::new(0),
            error_kind: ErrorKind::NetworkError,
            delay: None,
            invocations: AtomicU32::new(0),
        }
    }

    /// Fails the first `times` invocations with an error of `kind`.
    pub fn failing(mut self, times: u32, kind: ErrorKind) -> Self {
        self.failures_left = AtomicU32::new(times);
        self.error_kind = kind;
        self
    }

    pub fn always_failing(self, kind: ErrorKind) -> Self {
        self.failing(u32::MAX, kind)
    }

    /// Sleeps for `delay` before every invocation completes.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(&self, step: &PipelineStepConfig) -> SyncResult<StepOutput> {
        let invocation = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(sync_error!(
                self.error_kind,
                "Scripted extract failure",
                format!("step `{}` invocation {invocation}", step.name)
            ));
        }

        Ok(StepOutput::new(self.records.clone()))
    }
}

/// Transformer handing its input through unchanged.
#[derive(Debug, Default)]
pub struct PassthroughTransformer {
    invocations: AtomicU32,
}

impl PassthroughTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transformer for PassthroughTransformer {
    async fn transform(
        &self,
        data: serde_json::Value,
        _step: &PipelineStepConfig,
    ) -> SyncResult<StepOutput> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        Ok(StepOutput::new(data))
    }
}

/// Syncer remembering the tables and batches it was asked to write.
#[derive(Debug)]
pub struct RecordingSyncer {
    success: bool,
    invocations: AtomicU32,
    batches: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingSyncer {
    pub fn new() -> Self {
        Self {
            success: true,
            invocations: AtomicU32::new(0),
            batches: Mutex::new(Vec::new()),
        }
    }

    /// Reports `success: false` for every batch.
    pub fn rejecting() -> Self {
        Self {
            success: false,
            ..Self::new()
        }
    }

    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<(String, serde_json::Value)> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for RecordingSyncer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Syncer for RecordingSyncer {
    async fn sync(&self, data: serde_json::Value, target_table: &str) -> SyncResult<SyncOutcome> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let records_processed = data.as_array().map_or(0, |records| records.len() as u64);
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((target_table.to_string(), data));

        Ok(SyncOutcome {
            success: self.success,
            records_processed: if self.success { records_processed } else { 0 },
        })
    }
}
