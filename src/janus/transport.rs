//! HTTP transport for the Janus REST API

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;

use crate::error::{AppError, Result};

/// Request/long-poll seam under [`JanusSession`](super::JanusSession)
#[async_trait]
pub trait JanusTransport: Send + Sync {
    /// POST a JSON request and return the JSON reply
    async fn post(&self, url: &str, body: Value) -> Result<Value>;

    /// Long-poll the session endpoint for at most one event
    async fn poll(&self, url: &str) -> Result<Value>;
}

fn transport_error(context: &str, url: &str, e: impl std::fmt::Display) -> AppError {
    AppError::TransportFailure(format!("{} {}: {}", context, url, e))
}

/// [`JanusTransport`] over `reqwest`
pub struct HttpTransport {
    client: reqwest::Client,
    request_timeout: Duration,
    poll_timeout: Duration,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration, poll_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            request_timeout,
            poll_timeout,
        })
    }
}

#[async_trait]
impl JanusTransport for HttpTransport {
    async fn post(&self, url: &str, body: Value) -> Result<Value> {
        trace!("janus out: {}", body);
        let response = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("Failed to reach", url, e))?
            .error_for_status()
            .map_err(|e| transport_error("Request failed", url, e))?;

        response
            .json::<Value>()
            .await
            .map_err(|e| transport_error("Invalid reply from", url, e))
    }

    async fn poll(&self, url: &str) -> Result<Value> {
        // rid only defeats caches between identical polls
        let rid = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default()
            .to_string();

        let response = self
            .client
            .get(url)
            .timeout(self.poll_timeout)
            .query(&[("maxev", "1"), ("rid", rid.as_str())])
            .send()
            .await
            .map_err(|e| transport_error("Long poll failed", url, e))?
            .error_for_status()
            .map_err(|e| transport_error("Long poll rejected", url, e))?;

        let value = response
            .json::<Value>()
            .await
            .map_err(|e| transport_error("Invalid event from", url, e))?;
        trace!("janus in: {}", value);
        Ok(value)
    }
}
