//! Image downloading
//!
//! Scans need raw bytes; this narrow interface keeps the HTTP client out of
//! the detector and lets tests serve fixtures from memory.

use std::time::Duration;

use async_trait::async_trait;

/// Download error taxonomy. Every variant degrades a scan to the `Error`
/// confidence rather than aborting the message or the crawl.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The server answered with a non-success status.
    #[error("unexpected http status {0}")]
    Status(u16),

    /// The request itself failed.
    #[error("download failed: {0}")]
    Transport(String),
}

/// Fetches image bytes by URL.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Downloads the full body at `url`.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// HTTP fetcher with a bounded call timeout; redirects are followed.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Builds a fetcher with the given whole-call timeout.
    ///
    /// # Errors
    /// Propagates client construction failure.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
