use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, instrument};

use super::{AlertSink, DeliveryError, classify_request_error, classify_status};
use crate::config::Telegram;

const TOKEN_ENV: &str = "TELEGRAM_BOT_TOKEN";

/// Sends messages through the Telegram Bot API (`sendMessage`)
pub struct TelegramSink {
    client: Client,
    endpoint: String,
}

impl TelegramSink {
    pub fn new(api_url: &str, bot_token: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/bot{bot_token}/sendMessage", api_url.trim_end_matches('/')),
        })
    }

    /// Token from the config, or from `TELEGRAM_BOT_TOKEN`
    pub fn from_config(config: &Telegram, timeout: Duration) -> anyhow::Result<Self> {
        let token = match &config.bot_token {
            Some(token) => token.clone(),
            None => std::env::var(TOKEN_ENV)
                .with_context(|| format!("no bot_token configured and {TOKEN_ENV} is not set"))?,
        };
        Self::new(&config.api_url, &token, timeout)
    }
}

#[async_trait]
impl AlertSink for TelegramSink {
    #[instrument(skip(self, text), fields(len = text.len()))]
    async fn send(&self, target: &str, text: &str) -> Result<(), DeliveryError> {
        let payload = json!({
            "chat_id": target,
            "text": text,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_status(status, &body)?;

        debug!("telegram message delivered to {target}");
        Ok(())
    }
}
