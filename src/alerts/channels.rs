//! Built-in alert delivery channels.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::alerts::manager::{Alert, AlertLevel};
use crate::error::AlertError;
use crate::traits::AlertChannel;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Channel that writes alerts to the tracing log.
///
/// Useful as a default sink and in tests; delivery never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChannel;

#[async_trait]
impl AlertChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, alert: Alert) -> Result<(), AlertError> {
        match alert.level {
            AlertLevel::Debug => {
                tracing::debug!(alert = %alert.id, source = %alert.source, "{}: {}", alert.title, alert.message);
            }
            AlertLevel::Info => {
                tracing::info!(alert = %alert.id, source = %alert.source, "{}: {}", alert.title, alert.message);
            }
            AlertLevel::Warning => {
                tracing::warn!(alert = %alert.id, source = %alert.source, "{}: {}", alert.title, alert.message);
            }
            AlertLevel::Error | AlertLevel::Critical => {
                tracing::error!(alert = %alert.id, source = %alert.source, "{}: {}", alert.title, alert.message);
            }
        }
        Ok(())
    }
}

/// Channel that POSTs the full alert as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Create a channel for `url`.
    ///
    /// # Errors
    ///
    /// [`AlertError::ChannelFailed`] when the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|error| AlertError::ChannelFailed {
                channel: "webhook".to_string(),
                message: error.to_string(),
            })?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, alert: Alert) -> Result<(), AlertError> {
        let response = self
            .client
            .post(&self.url)
            .json(&alert)
            .send()
            .await
            .map_err(|error| AlertError::ChannelFailed {
                channel: "webhook".to_string(),
                message: error.to_string(),
            })?;
        response
            .error_for_status()
            .map_err(|error| AlertError::ChannelFailed {
                channel: "webhook".to_string(),
                message: error.to_string(),
            })?;
        Ok(())
    }
}

/// Channel that posts a colored attachment to a Slack-compatible webhook.
#[derive(Debug, Clone)]
pub struct SlackChannel {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackChannel {
    /// Create a channel for a Slack incoming-webhook URL.
    ///
    /// # Errors
    ///
    /// [`AlertError::ChannelFailed`] when the HTTP client cannot be built.
    pub fn new(webhook_url: impl Into<String>) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|error| AlertError::ChannelFailed {
                channel: "slack".to_string(),
                message: error.to_string(),
            })?;
        Ok(Self {
            webhook_url: webhook_url.into(),
            client,
        })
    }
}

fn slack_color(level: AlertLevel) -> &'static str {
    match level {
        AlertLevel::Debug => "#808080",
        AlertLevel::Info => "#36a64f",
        AlertLevel::Warning => "#ffcc00",
        AlertLevel::Error => "#ff6600",
        AlertLevel::Critical => "#ff0000",
    }
}

fn slack_payload(alert: &Alert) -> serde_json::Value {
    json!({
        "attachments": [{
            "color": slack_color(alert.level),
            "title": format!("[{}] {}", alert.level.as_str().to_uppercase(), alert.title),
            "text": alert.message,
            "footer": alert.source,
            "ts": alert.timestamp.timestamp(),
        }]
    })
}

#[async_trait]
impl AlertChannel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    async fn deliver(&self, alert: Alert) -> Result<(), AlertError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&slack_payload(&alert))
            .send()
            .await
            .map_err(|error| AlertError::ChannelFailed {
                channel: "slack".to_string(),
                message: error.to_string(),
            })?;
        response
            .error_for_status()
            .map_err(|error| AlertError::ChannelFailed {
                channel: "slack".to_string(),
                message: error.to_string(),
            })?;
        Ok(())
    }
}
