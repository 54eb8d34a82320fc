//! HTTP transport for the bridge API

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Malformed response from {url}: {message}")]
    Decode { url: String, message: String },
}

/// Raw reply: status code plus body text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Fail on non-2xx statuses
    pub fn require_success(self, url: &str) -> Result<Self, BridgeError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(BridgeError::Status {
                url: url.to_string(),
                status: self.status,
            })
        }
    }

    /// Parse the body as JSON into `T`
    pub fn json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, BridgeError> {
        serde_json::from_str(&self.body).map_err(|e| BridgeError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

/// The three request shapes the bridge protocol needs
#[async_trait]
pub trait BridgeTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpReply, BridgeError>;
    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpReply, BridgeError>;
    async fn put_json(&self, url: &str, body: &Value) -> Result<HttpReply, BridgeError>;
}

/// reqwest-backed transport with a per-request timeout
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::Request {
                url: String::new(),
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client, timeout })
    }

    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<HttpReply, BridgeError> {
        let response = request.send().await.map_err(|e| self.classify(url, e))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| self.classify(url, e))?;

        log::debug!("{} -> HTTP {} ({} bytes)", url, status, body.len());
        Ok(HttpReply { status, body })
    }

    fn classify(&self, url: &str, error: reqwest::Error) -> BridgeError {
        if error.is_timeout() {
            BridgeError::Timeout {
                url: url.to_string(),
                timeout: self.timeout,
            }
        } else {
            BridgeError::Request {
                url: url.to_string(),
                message: error.to_string(),
            }
        }
    }
}

#[async_trait]
impl BridgeTransport for HttpTransport {
    async fn get(&self, url: &str) -> Result<HttpReply, BridgeError> {
        self.send(url, self.client.get(url)).await
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpReply, BridgeError> {
        self.send(url, self.client.post(url).json(body)).await
    }

    async fn put_json(&self, url: &str, body: &Value) -> Result<HttpReply, BridgeError> {
        self.send(url, self.client.put(url).json(body)).await
    }
}
