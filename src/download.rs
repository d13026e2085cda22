use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::DownloadError;

/// Fetches binary assets (front-page drawings) by URL.
#[async_trait]
pub trait AssetDownloader: Send + Sync {
    async fn download(&self, url: &str) -> Result<Vec<u8>, DownloadError>;
}

pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AssetDownloader for HttpDownloader {
    async fn download(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        let request_error = |e: reqwest::Error| DownloadError::Request {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let resp = self.client.get(url).send().await.map_err(request_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = resp.bytes().await.map_err(request_error)?;
        if bytes.is_empty() {
            return Err(DownloadError::EmptyBody(url.to_string()));
        }
        debug!(url, bytes = bytes.len(), "Downloaded asset");
        Ok(bytes.to_vec())
    }
}
