//! Polls a JSON endpoint that returns one metric batch per request.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::detect::MetricBatch;
use crate::source::MetricSource;

pub struct HttpSource {
    client: Client,
    url: String,
}

impl HttpSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl MetricSource for HttpSource {
    async fn fetch(&self) -> Result<MetricBatch> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("failed to reach metric source {}", self.url))?
            .error_for_status()
            .with_context(|| format!("metric source {} returned an error", self.url))?;

        let batch: MetricBatch = response
            .json()
            .await
            .with_context(|| format!("invalid metric batch from {}", self.url))?;
        debug!(url = %self.url, observed_at = %batch.observed_at, "metric batch fetched");
        Ok(batch)
    }
}
