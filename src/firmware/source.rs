use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::utils::error::{WatcherError, WatcherResult};

/// Where firmware images and their checksums come from.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Downloads `url` to `dest`, returning the number of bytes written.
    async fn fetch(&self, url: &str, dest: &Path) -> WatcherResult<u64>;

    /// Fetches the published SHA-256 for `url`.
    async fn fetch_checksum(&self, url: &str) -> WatcherResult<String>;
}

/// GitHub `blob` page links point at HTML; the image lives on the raw host.
pub fn raw_url(url: &str) -> String {
    if url.contains("github.com") && url.contains("/blob/") {
        let raw = url
            .replacen("github.com", "raw.githubusercontent.com", 1)
            .replacen("/blob/", "/", 1);
        debug!("Converted GitHub URL to raw content URL: {}", raw);
        raw
    } else {
        url.to_string()
    }
}

/// First token of a `sha256sum`-style sidecar, if it looks like a digest.
pub fn parse_checksum(text: &str) -> Option<String> {
    let token = text.split_whitespace().next()?;
    if token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(token.to_lowercase())
    } else {
        None
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub struct HttpImageSource {
    client: reqwest::Client,
}

impl HttpImageSource {
    pub fn new(timeout: Duration) -> WatcherResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("gridconnection_watcher/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WatcherError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str) -> WatcherResult<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| WatcherError::DownloadError(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(WatcherError::DownloadError(format!(
                "{} answered {}",
                url,
                response.status()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch(&self, url: &str, dest: &Path) -> WatcherResult<u64> {
        let url = raw_url(url);
        info!("⬇️  Downloading firmware from {}", url);
        let response = self.get(&url).await?;

        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = File::create(dest).await?;
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| WatcherError::DownloadError(format!("{}: {}", url, e)))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        info!("✅ Firmware downloaded: {} bytes to {}", downloaded, dest.display());
        Ok(downloaded)
    }

    async fn fetch_checksum(&self, url: &str) -> WatcherResult<String> {
        let url = format!("{}.sha256", raw_url(url));
        let text = self
            .get(&url)
            .await?
            .text()
            .await
            .map_err(|e| WatcherError::DownloadError(format!("{}: {}", url, e)))?;
        parse_checksum(&text)
            .ok_or_else(|| WatcherError::DownloadError(format!("{} holds no SHA-256 digest", url)))
    }
}
