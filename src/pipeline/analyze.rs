//! Musical-feature analysis with graceful degradation.
//!
//! The analyzer is a soft dependency: if it is unreachable or returns
//! something unusable, the pipeline substitutes a fixed deterministic
//! default instead of failing the run.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::Transcript;

/// Estimated musical features for a recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicalFeatures {
    pub tempo_bpm: u32,
    pub key: String,
    pub mood: String,
    pub genre: String,
}

impl MusicalFeatures {
    /// Fixed default used whenever analysis is unavailable.
    ///
    /// Deterministic on purpose: two failed analyses of the same recording
    /// must produce the same plan inputs.
    pub fn fallback() -> Self {
        Self {
            tempo_bpm: 90,
            key: "C major".to_string(),
            mood: "reflective".to_string(),
            genre: "ambient pop".to_string(),
        }
    }

    fn is_usable(&self) -> bool {
        (30..=300).contains(&self.tempo_bpm) && !self.key.is_empty() && !self.mood.is_empty()
    }
}

/// Feature-estimation collaborator
#[async_trait]
pub trait FeatureAnalyzer: Send + Sync {
    async fn analyze(&self, transcript: &Transcript, timeout: Duration) -> Result<MusicalFeatures>;
}

/// Run analysis, substituting the deterministic fallback on any failure.
///
/// This stage never propagates an error.
pub async fn analyze_with_fallback(
    analyzer: &dyn FeatureAnalyzer,
    transcript: &Transcript,
    timeout: Duration,
) -> MusicalFeatures {
    match analyzer.analyze(transcript, timeout).await {
        Ok(features) if features.is_usable() => features,
        Ok(features) => {
            warn!(?features, "Analyzer returned unusable features, using fallback");
            MusicalFeatures::fallback()
        }
        Err(e) => {
            warn!(error = %e, "Analyzer unavailable, using fallback");
            MusicalFeatures::fallback()
        }
    }
}

/// HTTP feature-analysis client
pub struct HttpFeatureAnalyzer {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpFeatureAnalyzer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl FeatureAnalyzer for HttpFeatureAnalyzer {
    async fn analyze(&self, transcript: &Transcript, timeout: Duration) -> Result<MusicalFeatures> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(transcript)
            .send()
            .await
            .context("Failed to reach analyzer")?
            .error_for_status()
            .context("Analyzer returned an error status")?;

        response.json().await.context("Failed to parse analyzer response")
    }
}
