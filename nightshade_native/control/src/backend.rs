//! REST command backend
//!
//! Commands are sent as JSON `POST`s to the dashboard backend. A request is
//! made exactly once: no retry, any non-2xx status is a failure.

use crate::device::SnapshotPatch;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default base URL of the command endpoints
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:3001";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Request timeout after {duration_ms}ms: {url}")]
    Timeout { url: String, duration_ms: u64 },

    #[error("Connection refused: {url} - {cause}")]
    ConnectionRefused { url: String, cause: String },

    #[error("Request failed: {0}")]
    RequestFailed(String),
}

impl BackendError {
    fn from_reqwest(err: reqwest::Error, url: &str, timeout_ms: u64) -> Self {
        if err.is_timeout() {
            BackendError::Timeout {
                url: url.to_string(),
                duration_ms: timeout_ms,
            }
        } else if err.is_connect() {
            BackendError::ConnectionRefused {
                url: url.to_string(),
                cause: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            BackendError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            BackendError::RequestFailed(err.to_string())
        }
    }
}

/// Backend connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BACKEND_URL.to_string(),
            request_timeout_ms: 10000,
            connect_timeout_ms: 3000,
        }
    }
}

/// One command call
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    /// Endpoint path, e.g. `/api/dome/azimuth`
    pub path: String,
    pub body: Value,
}

impl CommandRequest {
    pub fn new(path: impl Into<String>, body: Value) -> Self {
        Self {
            path: path.into(),
            body,
        }
    }
}

/// Where commands are sent
#[async_trait]
pub trait CommandBackend: Send + Sync {
    /// Send a command once.
    ///
    /// Returns the snapshot fragment in the response body, if it carried one.
    async fn post(&self, request: &CommandRequest) -> Result<Option<SnapshotPatch>, BackendError>;
}

/// `reqwest` implementation of [`CommandBackend`]
pub struct HttpBackend {
    http_client: Client,
    config: BackendConfig,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let http_client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BackendError::RequestFailed(e.to_string()))?;
        Ok(Self {
            http_client,
            config,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn build_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl CommandBackend for HttpBackend {
    async fn post(&self, request: &CommandRequest) -> Result<Option<SnapshotPatch>, BackendError> {
        let url = self.build_url(&request.path);
        let timeout_ms = self.config.request_timeout_ms;
        debug!("POST {} {}", url, request.body);

        let response = self
            .http_client
            .post(&url)
            .json(&request.body)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, &url, timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Http {
                status: status.as_u16(),
                message: body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| BackendError::from_reqwest(e, &url, timeout_ms))?;
        Ok(parse_fragment(&url, &body))
    }
}

/// Snapshot fragment carried by a successful response.
///
/// Bodies that are empty, not JSON objects or not shaped like a snapshot are
/// accepted without a fragment; the command already succeeded.
fn parse_fragment(url: &str, body: &str) -> Option<SnapshotPatch> {
    if body.trim().is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => {
            warn!("Ignoring non-JSON response from {}: {}", url, e);
            return None;
        }
    };
    if !value.is_object() {
        return None;
    }
    match serde_json::from_value::<SnapshotPatch>(value) {
        Ok(patch) if patch.is_empty() => None,
        Ok(patch) => Some(patch),
        Err(e) => {
            warn!("Ignoring unexpected response shape from {}: {}", url, e);
            None
        }
    }
}
