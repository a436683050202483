use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::monitor::{Alert, AlertChannel};

/// Alert channel keeping every alert it receives.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AlertChannel for RecordingChannel {
    async fn send(&self, alert: &Alert) -> SyncResult<()> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert.clone());

        Ok(())
    }
}

/// Alert channel rejecting every alert.
#[derive(Debug, Default)]
pub struct FailingChannel;

#[async_trait]
impl AlertChannel for FailingChannel {
    async fn send(&self, _alert: &Alert) -> SyncResult<()> {
        bail!(ErrorKind::NetworkError, "Mock alert channel is unreachable");
    }
}
