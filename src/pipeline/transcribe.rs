//! Transcription stage collaborator.
//!
//! Ships the recording to the external speech-to-text service and returns
//! the text plus timing segments.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One timed segment of a transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start_secs: f64,
    pub end_secs: f64,
    pub text: String,
}

/// Result of transcription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
}

impl Transcript {
    /// Spoken duration, taken from the last segment's end time
    pub fn duration_secs(&self) -> f64 {
        self.segments.last().map(|s| s.end_secs).unwrap_or(0.0)
    }
}

/// Speech-to-text collaborator
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio_path: &Path, timeout: Duration) -> Result<Transcript>;
}

/// HTTP speech-to-text client
pub struct HttpTranscriber {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTranscriber {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, audio_path: &Path, timeout: Duration) -> Result<Transcript> {
        let audio = tokio::fs::read(audio_path)
            .await
            .context("Failed to read recording for transcription")?;

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .header("content-type", "application/octet-stream")
            .body(audio)
            .send()
            .await
            .context("Failed to reach speech-to-text service")?
            .error_for_status()
            .context("Speech-to-text service returned an error status")?;

        let transcript: Transcript = response
            .json()
            .await
            .context("Failed to parse speech-to-text response")?;

        Ok(transcript)
    }
}
