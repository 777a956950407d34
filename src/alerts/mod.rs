//! Outbound alert delivery
//!
//! An [`AlertSink`] sends one text message to one target. Failures are split
//! into retryable (network trouble, rate limits, 5xx) and terminal (bad
//! credentials or target) so the dispatcher knows whether to try again.
//!
//! Delivery is best-effort: the dispatcher retries a bounded number of times
//! and then drops the message.

pub mod format;
pub mod suppression;
pub mod telegram;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::config::AlertChannel;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("retryable delivery failure: {0}")]
    Retryable(String),

    #[error("terminal delivery failure: {0}")]
    Terminal(String),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Retryable(_))
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, target: &str, text: &str) -> Result<(), DeliveryError>;
}

/// Map an HTTP answer onto the delivery outcome
pub(crate) fn classify_status(status: StatusCode, body: &str) -> Result<(), DeliveryError> {
    if status.is_success() {
        return Ok(());
    }

    let message = format!("{status}: {body}");
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Err(DeliveryError::Retryable(message))
    } else {
        Err(DeliveryError::Terminal(message))
    }
}

pub(crate) fn classify_request_error(err: reqwest::Error) -> DeliveryError {
    if err.is_builder() {
        DeliveryError::Terminal(err.to_string())
    } else {
        DeliveryError::Retryable(err.to_string())
    }
}

/// Build the sink configured for `channel`
pub fn build_sink(channel: &AlertChannel, timeout: Duration) -> anyhow::Result<Arc<dyn AlertSink>> {
    let sink: Arc<dyn AlertSink> = match channel {
        AlertChannel::Telegram(telegram) => Arc::new(telegram::TelegramSink::from_config(telegram, timeout)?),
        AlertChannel::Webhook(webhook) => Arc::new(webhook::WebhookSink::new(&webhook.url, timeout)?),
    };
    Ok(sink)
}
