//! Download and validate stages.
//!
//! Fetches the gateway-hosted recording to a local scratch file and applies
//! the size sanity checks before anything expensive runs.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

use super::{PipelineError, Stage};

/// A downloaded recording on local disk.
///
/// The temp dir owns the file; dropping the artifact removes it.
#[derive(Debug)]
pub struct LocalArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    _scratch: TempDir,
}

impl LocalArtifact {
    /// Wrap a file under `scratch`; the dir's lifetime bounds the file's
    pub fn new(scratch: TempDir, path: PathBuf, size_bytes: u64) -> Self {
        Self {
            path,
            size_bytes,
            _scratch: scratch,
        }
    }
}

/// Fetches a remote recording reference to local disk
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, url: &str, timeout: Duration) -> Result<LocalArtifact>;
}

/// Reqwest-based downloader.
///
/// Streams the body to the scratch file and aborts as soon as the running
/// total passes `max_bytes`, so an oversized recording never sits in memory.
pub struct HttpDownloader {
    client: reqwest::Client,
    max_bytes: u64,
}

impl HttpDownloader {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            max_bytes,
        }
    }

    fn oversized(&self, announced: u64) -> anyhow::Error {
        PipelineError::permanent(
            Stage::Validate,
            format!(
                "recording is at least {} bytes, above the {} byte maximum",
                announced, self.max_bytes
            ),
        )
        .into()
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, url: &str, timeout: Duration) -> Result<LocalArtifact> {
        let scratch = TempDir::new().context("Failed to create scratch dir")?;
        let path = scratch.path().join("recording.audio");

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("Failed to fetch recording from {}", url))?
            .error_for_status()
            .context("Recording fetch returned an error status")?;

        if let Some(announced) = response.content_length() {
            if announced > self.max_bytes {
                return Err(self.oversized(announced));
            }
        }

        let mut file = tokio::fs::File::create(&path)
            .await
            .context("Failed to create scratch file")?;

        let mut total: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Failed to read recording body")?;
            total += chunk.len() as u64;
            if total > self.max_bytes {
                return Err(self.oversized(total));
            }
            file.write_all(&chunk)
                .await
                .context("Failed to write recording to disk")?;
        }
        file.flush().await.context("Failed to flush recording")?;

        Ok(LocalArtifact::new(scratch, path, total))
    }
}

/// Size bounds for downloaded audio
#[derive(Debug, Clone, Copy)]
pub struct AudioLimits {
    pub min_bytes: u64,
    pub max_bytes: u64,
}

impl Default for AudioLimits {
    fn default() -> Self {
        Self {
            min_bytes: 1024,
            max_bytes: 25 * 1024 * 1024,
        }
    }
}

/// Validate a downloaded artifact against the size bounds.
///
/// Out-of-bounds audio is a permanent failure: retrying the download will
/// fetch the same bytes again.
pub fn validate(artifact: &LocalArtifact, limits: AudioLimits) -> Result<(), PipelineError> {
    if artifact.size_bytes < limits.min_bytes {
        return Err(PipelineError::permanent(
            Stage::Validate,
            format!(
                "recording is {} bytes, below the {} byte minimum (likely corrupt)",
                artifact.size_bytes, limits.min_bytes
            ),
        ));
    }

    if artifact.size_bytes > limits.max_bytes {
        return Err(PipelineError::permanent(
            Stage::Validate,
            format!(
                "recording is {} bytes, above the {} byte maximum",
                artifact.size_bytes, limits.max_bytes
            ),
        ));
    }

    if !artifact.path.exists() {
        return Err(PipelineError::transient(
            Stage::Validate,
            "recording file vanished before validation",
        ));
    }

    Ok(())
}
