//! Alert channels registered by the runner.
//!
//! Every configured webhook becomes a [`WebhookAlertChannel`] under its name, and a
//! [`TracingAlertChannel`] is always available as `log`.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use sqp::bail;
use sqp::error::{ErrorKind, SyncError, SyncResult};
use sqp::monitor::{Alert, AlertChannel, AlertSeverity};
use sqp_config::shared::WebhookChannelConfig;
use tracing::{debug, error, info, warn};

/// Name of the channel writing alerts to the process log.
pub const LOG_CHANNEL_NAME: &str = "log";

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts alerts as JSON to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookAlertChannel {
    client: reqwest::Client,
    name: String,
    url: String,
    token: Option<SecretString>,
}

impl WebhookAlertChannel {
    pub fn new(config: &WebhookChannelConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|err| {
                SyncError::from((
                    ErrorKind::ClientCreationFailed,
                    "Failed to create webhook client",
                    err.to_string(),
                ))
                .with_source(err)
            })?;

        Ok(Self {
            client,
            name: config.name.clone(),
            url: config.url.clone(),
            token: config.token.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl AlertChannel for WebhookAlertChannel {
    async fn send(&self, alert: &Alert) -> SyncResult<()> {
        let mut request = self.client.post(&self.url).json(alert);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(reqwest_error_to_sync_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                ErrorKind::AlertDispatchFailed,
                "Webhook rejected alert",
                format!("channel `{}` answered {status}: {body}", self.name)
            );
        }

        debug!(channel = %self.name, alert_type = %alert.alert_type, "alert delivered to webhook");

        Ok(())
    }
}

fn reqwest_error_to_sync_error(err: reqwest::Error) -> SyncError {
    let kind = if err.is_timeout() {
        ErrorKind::OperationTimeout
    } else {
        ErrorKind::NetworkError
    };

    SyncError::from((kind, "Webhook request failed", err.to_string())).with_source(err)
}

/// Writes alerts to the process log at a level matching their severity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertChannel;

#[async_trait]
impl AlertChannel for TracingAlertChannel {
    async fn send(&self, alert: &Alert) -> SyncResult<()> {
        let metadata = serde_json::Value::Object(alert.metadata.clone());
        match alert.severity {
            AlertSeverity::Info => info!(
                pipeline_id = %alert.pipeline_id,
                alert_type = %alert.alert_type,
                %metadata,
                "{}", alert.message
            ),
            AlertSeverity::Warning => warn!(
                pipeline_id = %alert.pipeline_id,
                alert_type = %alert.alert_type,
                %metadata,
                "{}", alert.message
            ),
            AlertSeverity::Critical => error!(
                pipeline_id = %alert.pipeline_id,
                alert_type = %alert.alert_type,
                %metadata,
                "{}", alert.message
            ),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use sqp::monitor::AlertType;

    use super::*;

    fn alert() -> Alert {
        Alert::new(
            AlertType::ErrorRate,
            AlertSeverity::Critical,
            "search-query-performance",
            "Error rate 5.00% exceeds threshold 5.00%",
        )
        .with_metadata("error_rate", 0.05)
    }

    #[tokio::test]
    async fn tracing_channel_always_succeeds() {
        assert!(TracingAlertChannel.send(&alert()).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_webhook_is_a_network_error() {
        let channel = WebhookAlertChannel::new(&WebhookChannelConfig {
            name: "ops".to_string(),
            url: "http://127.0.0.1:9/alerts".to_string(),
            token: None,
        })
        .unwrap();

        let err = channel.send(&alert()).await.unwrap_err();

        assert_eq!(channel.name(), "ops");
        assert!(matches!(
            err.kind(),
            ErrorKind::NetworkError | ErrorKind::OperationTimeout
        ));
    }
}
