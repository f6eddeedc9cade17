//! Queue client for claiming work and polling cancellations
//!
//! The worker core only depends on the [`Queue`] trait; the HTTP
//! implementation talks to the central queue's REST API with the shared
//! authentication headers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::api::{
    endpoints, headers, CancelMessage, CancellationsResponse, Claim, ClaimWorkRequest,
    ClaimWorkResponse,
};
use shared::WorkerConfig;
use std::time::Duration;
use tracing::debug;

/// Client side of the queue's claim protocol.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Asks the queue for up to `n_tasks` claims. May return fewer,
    /// including none.
    async fn claim_work(&self, n_tasks: u32) -> Result<Vec<Claim>>;
}

/// Queue client over the central queue's REST API.
pub struct HttpQueue {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    worker_id: String,
}

impl HttpQueue {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_client_timeout_seconds))
            .build()
            .context("Failed to create HTTP client for queue communication")?;

        Ok(Self {
            client,
            base_url: config.queue_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            worker_id: config.worker_id.clone(),
        })
    }

    /// Fetches cancellation messages addressed to this worker.
    pub async fn fetch_cancellations(&self) -> Result<Vec<CancelMessage>> {
        let url = format!("{}{}", self.base_url, endpoints::CANCELLATIONS);

        let response = self
            .client
            .get(&url)
            .header(headers::API_KEY, &self.api_key)
            .header(headers::WORKER_ID, &self.worker_id)
            .send()
            .await
            .with_context(|| format!("Failed to poll cancellations from {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow::anyhow!(
                "Queue returned {} for cancellations: {}",
                status,
                error_text
            ));
        }

        let cancellations: CancellationsResponse = response
            .json()
            .await
            .context("Failed to parse cancellations response")?;

        Ok(cancellations.messages)
    }
}

#[async_trait]
impl Queue for HttpQueue {
    async fn claim_work(&self, n_tasks: u32) -> Result<Vec<Claim>> {
        let url = format!("{}{}", self.base_url, endpoints::CLAIM_WORK);
        let request = ClaimWorkRequest {
            worker_id: self.worker_id.clone(),
            n_tasks,
        };

        let response = self
            .client
            .post(&url)
            .header(headers::API_KEY, &self.api_key)
            .header(headers::WORKER_ID, &self.worker_id)
            .header(headers::CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to claim work from {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow::anyhow!(
                "Queue returned {} for claim-work: {}",
                status,
                error_text
            ));
        }

        let claimed: ClaimWorkResponse = response
            .json()
            .await
            .context("Failed to parse claim-work response")?;

        debug!(
            requested = n_tasks,
            granted = claimed.claims.len(),
            "Claimed work from queue"
        );

        Ok(claimed.claims)
    }
}
