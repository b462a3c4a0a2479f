use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

/// Turns an image reference into a local file owned by the caller.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, source: &str, dest: &Path) -> Result<PathBuf>;
}

pub fn is_remote(source: &str) -> bool {
    let lower = source.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Extension to keep for the local copy so decoders can sniff the format.
pub fn extension_hint(source: &str) -> &str {
    let path = source.split(['?', '#']).next().unwrap_or(source);
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) => ext,
        _ => "jpg",
    }
}

/// Downloads URLs with reqwest and copies local paths.
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, source: &str, dest: &Path) -> Result<PathBuf> {
        if !is_remote(source) {
            let local = Path::new(source.trim());
            if !local.is_file() {
                return Err(PipelineError::upstream(
                    "image source",
                    format!("image not found: {}", local.display()),
                ));
            }
            tokio::fs::copy(local, dest).await?;
            debug!("Copied image {} to {}", local.display(), dest.display());
            return Ok(dest.to_path_buf());
        }

        info!("Downloading image {}", source);
        let res = self
            .client
            .get(source.trim())
            .header(USER_AGENT, "comicvideo/0.1")
            .send()
            .await
            .map_err(|e| PipelineError::upstream("image download", e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            return Err(PipelineError::upstream(
                "image download",
                format!("{} returned {}", source, status),
            ));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| PipelineError::upstream("image download", e.to_string()))?;
        if bytes.is_empty() {
            return Err(PipelineError::upstream(
                "image download",
                format!("{} returned an empty body", source),
            ));
        }
        tokio::fs::write(dest, &bytes).await?;
        debug!("Saved {} bytes to {}", bytes.len(), dest.display());
        Ok(dest.to_path_buf())
    }
}
