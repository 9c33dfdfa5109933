//! Chat notifications
//!
//! Channels are configured at startup as `name=url` pairs pointing at
//! incoming-webhook endpoints. Posting is best effort for callers: a failed
//! notification never fails the job that sent it.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use strata_common::IO_TIMEOUT_SECS;

/// Notification failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifyError {
    /// No channel is configured under that name
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    /// The webhook could not be reached or rejected the message
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
}

/// Something that can deliver a text message to a named channel
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Check that a channel is known
    async fn resolve(&self, channel: &str) -> Result<(), NotifyError>;

    /// Post a message to a channel
    async fn post(&self, channel: &str, text: &str) -> Result<(), NotifyError>;
}

/// Posts `{"text": ...}` to per-channel incoming-webhook URLs
pub struct WebhookNotifier {
    http: reqwest::Client,
    channels: BTreeMap<String, String>,
}

impl WebhookNotifier {
    /// Create a notifier for the given channel → URL map
    pub fn new(channels: BTreeMap<String, String>) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(IO_TIMEOUT_SECS))
            .build()
            .map_err(|e| NotifyError::ConnectionFailed(e.to_string()))?;
        Ok(Self { http, channels })
    }

    fn url(&self, channel: &str) -> Result<&str, NotifyError> {
        self.channels
            .get(channel)
            .map(String::as_str)
            .ok_or_else(|| NotifyError::ChannelNotFound(channel.to_string()))
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn resolve(&self, channel: &str) -> Result<(), NotifyError> {
        self.url(channel).map(|_| ())
    }

    async fn post(&self, channel: &str, text: &str) -> Result<(), NotifyError> {
        let url = self.url(channel)?;
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| NotifyError::ConnectionFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::ConnectionFailed(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        debug!(channel, "notification posted");
        Ok(())
    }
}

/// Parse a `name=url` channel definition
pub fn parse_channel(s: &str) -> Result<(String, String), String> {
    let (name, url) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=url, got {s}"))?;
    let (name, url) = (name.trim(), url.trim());
    if name.is_empty() || url.is_empty() {
        return Err(format!("expected name=url, got {s}"));
    }
    Ok((name.to_string(), url.to_string()))
}
