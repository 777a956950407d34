use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, instrument};

use super::{AlertSink, DeliveryError, classify_request_error, classify_status};

/// Posts messages as JSON to a generic HTTP endpoint
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    #[instrument(skip(self, text), fields(url = %self.url))]
    async fn send(&self, target: &str, text: &str) -> Result<(), DeliveryError> {
        let payload = json!({
            "target": target,
            "message": text,
            "timestamp": Utc::now().to_rfc3339(),
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_status(status, &body)?;

        debug!("webhook alert delivered");
        Ok(())
    }
}
