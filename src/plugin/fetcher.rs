//! Locator fetching
//!
//! Registry documents and plugin sources are addressed by locators: `http(s)://`
//! URLs, `file://` URLs, or plain filesystem paths. Everything that reads one goes
//! through [`SourceFetcher`] so the registry client and the loader can be tested
//! without a network.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::core::error::HostError;

/// Largest response body read into memory
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request to {url} failed: {message}")]
    Network { url: String, message: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },

    #[error("Unsupported locator: {0}")]
    Unsupported(String),
}

/// Read a response body as text, giving up once it passes `limit` bytes
pub async fn read_capped_text(mut response: reqwest::Response, limit: usize) -> Result<String, FetchError> {
    let url = response.url().to_string();
    if response.content_length().is_some_and(|length| length > limit as u64) {
        return Err(FetchError::TooLarge { url, limit });
    }

    let mut body = Vec::new();
    loop {
        let chunk = response.chunk().await.map_err(|e| FetchError::Network {
            url: url.clone(),
            message: e.to_string(),
        })?;
        let Some(chunk) = chunk else { break };
        if body.len() + chunk.len() > limit {
            return Err(FetchError::TooLarge { url, limit });
        }
        body.extend_from_slice(&chunk);
    }

    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// Reads the text behind a locator
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch_text(&self, locator: &str) -> Result<String, FetchError>;
}

/// Default fetcher backed by reqwest and the local filesystem
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, HostError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| HostError::InitializationError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_body_bytes: MAX_BODY_BYTES,
        })
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    async fn fetch_http(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Network {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        read_capped_text(response, self.max_body_bytes).await
    }

    async fn fetch_file(path: PathBuf) -> Result<String, FetchError> {
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| FetchError::Io { path, source })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch_text(&self, locator: &str) -> Result<String, FetchError> {
        debug!(locator, "Fetching");

        match Url::parse(locator) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => self.fetch_http(locator).await,
            Ok(url) if url.scheme() == "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| FetchError::Unsupported(locator.to_string()))?;
                Self::fetch_file(path).await
            }
            // Single-letter schemes are Windows drive prefixes, not URLs
            Ok(url) if url.scheme().len() > 1 => Err(FetchError::Unsupported(locator.to_string())),
            _ => Self::fetch_file(PathBuf::from(locator)).await,
        }
    }
}
