//! HTTP publisher: forwards claimed tasks to a publishing service as JSON.

use crate::errors::{Error, Result};
use crate::providers::{PublishRequest, Publisher};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Posts each [`PublishRequest`] to a fixed endpoint.
pub struct HttpPublisher {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpPublisher {
    /// Creates a publisher for `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<()> {
        let resp = self.http.post(&self.endpoint).json(request).send().await?;
        let status = resp.status();
        if status.is_success() {
            debug!(task_id = request.task_id, platform = %request.target, "Published");
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        warn!(task_id = request.task_id, status = %status, body = %body, "Publish rejected");
        Err(Error::ProviderUnavailable {
            message: format!("publisher returned {status}"),
        })
    }
}
