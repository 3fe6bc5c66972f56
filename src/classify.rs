use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::{env, time::Duration};

const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Label and confidence returned by the external waste-type model.
#[derive(Debug, Clone, Deserialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f64,
}

/// External image classification service: image bytes in, label out. The
/// call carries a bounded timeout; callers reject the submission before any
/// counter is touched when it fails.
#[async_trait]
pub trait ClassifierApi: Send + Sync {
    async fn classify(&self, image: &[u8]) -> Result<Classification>;
}

#[derive(Debug, Clone)]
pub struct HttpClassifier {
    client: Client,
    url: String,
}

impl HttpClassifier {
    pub fn from_env() -> Result<Self> {
        let url = env::var("CLASSIFIER_URL").context("CLASSIFIER_URL not set")?;
        let timeout = env::var("CLASSIFIER_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .context("Failed to build classifier HTTP client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl ClassifierApi for HttpClassifier {
    async fn classify(&self, image: &[u8]) -> Result<Classification> {
        let res = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .context("Classifier request failed")?;
        if !res.status().is_success() {
            anyhow::bail!("Classifier returned status {}", res.status());
        }
        res.json::<Classification>()
            .await
            .context("Classifier returned an unreadable response")
    }
}
