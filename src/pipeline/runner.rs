//! Ordered stage orchestration for one job.
//!
//! The runner executes download → validate → transcribe → analyze →
//! persist → generate → materialize → save → notify. A failure anywhere
//! before notify fails the whole run and carries the id of the session
//! record created so far (if any), so the terminal failure handler can
//! mark it. The final notify is best-effort and can never fail the run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::auth::UserDirectory;
use crate::notify::Notifier;
use crate::queue::{Job, JobKind, RegenerateOptions};
use crate::storage::{ProcessingSession, SessionStore};

use super::analyze::{analyze_with_fallback, FeatureAnalyzer, MusicalFeatures};
use super::download::{validate, AudioLimits, Downloader};
use super::generate::{GenerationChain, PlanSource, ProductionPlan};
use super::transcribe::Transcriber;
use super::{PipelineError, Stage};

/// Reference to one generated output file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub label: String,
    pub url: String,
}

/// Turns a production plan into actual files (external collaborator)
#[async_trait]
pub trait FileMaterializer: Send + Sync {
    async fn materialize(
        &self,
        plan: &ProductionPlan,
        timeout: Duration,
    ) -> Result<Vec<GeneratedFile>>;
}

/// HTTP file-materializer client
pub struct HttpFileMaterializer {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct MaterializeResponse {
    files: Vec<GeneratedFile>,
}

impl HttpFileMaterializer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl FileMaterializer for HttpFileMaterializer {
    async fn materialize(
        &self,
        plan: &ProductionPlan,
        timeout: Duration,
    ) -> Result<Vec<GeneratedFile>> {
        use anyhow::Context;

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(plan)
            .send()
            .await
            .context("Failed to reach materializer")?
            .error_for_status()
            .context("Materializer returned an error status")?;

        let parsed: MaterializeResponse = response
            .json()
            .await
            .context("Failed to parse materializer response")?;

        Ok(parsed.files)
    }
}

/// Successful run result
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub session_id: Uuid,
    pub files: Vec<GeneratedFile>,
    pub plan_source: PlanSource,
}

/// A failed run, with the session record (if one was created) to mark
#[derive(Debug, Error)]
#[error("{error}")]
pub struct PipelineFailure {
    #[source]
    pub error: PipelineError,
    pub session_id: Option<Uuid>,
}

impl PipelineFailure {
    fn early(error: PipelineError) -> Self {
        Self {
            error,
            session_id: None,
        }
    }

    fn at(error: PipelineError, session_id: Uuid) -> Self {
        Self {
            error,
            session_id: Some(session_id),
        }
    }
}

/// Executes the generation pipeline for one job
pub struct PipelineRunner {
    pub downloader: Arc<dyn Downloader>,
    pub transcriber: Arc<dyn Transcriber>,
    pub analyzer: Arc<dyn FeatureAnalyzer>,
    pub chain: GenerationChain,
    pub materializer: Arc<dyn FileMaterializer>,
    pub store: Arc<dyn SessionStore>,
    pub users: Arc<dyn UserDirectory>,
    pub notifier: Arc<Notifier>,
    pub limits: AudioLimits,
    pub timeout: Duration,

    /// Base URL for listen links when the materializer returns no files
    pub listen_base: String,
}

impl PipelineRunner {
    /// Run the full stage sequence for a job.
    #[instrument(skip(self, job), fields(job_id = %job.id, kind = job.kind.label()))]
    pub async fn run(&self, job: &Job) -> Result<PipelineOutcome, PipelineFailure> {
        let user_id = job.kind.user_id();
        let recording_url = job.kind.recording_url();

        // 1. Download
        let artifact = self
            .downloader
            .download(recording_url, self.timeout)
            .await
            .map_err(|e| PipelineFailure::early(classify(Stage::Download, e)))?;

        // 2. Validate
        validate(&artifact, self.limits).map_err(PipelineFailure::early)?;

        // 3. Transcribe
        let transcript = self
            .transcriber
            .transcribe(&artifact.path, self.timeout)
            .await
            .map_err(|e| PipelineFailure::early(PipelineError::transient(Stage::Transcribe, e)))?;

        // 4. Analyze (soft dependency, never fails)
        let mut features = analyze_with_fallback(&*self.analyzer, &transcript, self.timeout).await;
        if let JobKind::RegenerateSession { options, .. } = &job.kind {
            apply_overrides(&mut features, options);
        }

        // 5. Persist the session record before generation, so a later
        // failure has something to mark failed
        let user = self
            .users
            .find_by_id(user_id)
            .await
            .map_err(|e| PipelineFailure::early(PipelineError::transient(Stage::Persist, e)))?
            .ok_or_else(|| {
                PipelineFailure::early(PipelineError::permanent(
                    Stage::Persist,
                    format!("unknown user {}", user_id),
                ))
            })?;

        let session = ProcessingSession::new(user_id, features.clone());
        self.store
            .create(&session)
            .await
            .map_err(|e| PipelineFailure::early(PipelineError::transient(Stage::Persist, e)))?;
        let session_id = session.id;

        info!(%session_id, "Session record created, generating");

        // 6. Generate (degrades per stage, never fails)
        let plan = self.chain.run(&features, &transcript).await;

        // 7. Materialize
        let files = self
            .materializer
            .materialize(&plan, self.timeout)
            .await
            .map_err(|e| {
                PipelineFailure::at(PipelineError::transient(Stage::Materialize, e), session_id)
            })?;

        // 8. Save
        self.store
            .mark_completed(session_id, &files, plan.source())
            .await
            .map_err(|e| {
                PipelineFailure::at(PipelineError::transient(Stage::Save, e), session_id)
            })?;

        // 9. Notify (best-effort; generation already succeeded)
        let link = files
            .first()
            .map(|f| f.url.clone())
            .unwrap_or_else(|| {
                format!("{}/{}", self.listen_base.trim_end_matches('/'), session_id)
            });
        self.notifier
            .sms_best_effort(&user.phone, &format!("Your song is ready: {}", link))
            .await;

        info!(%session_id, source = ?plan.source(), "Pipeline completed");

        Ok(PipelineOutcome {
            session_id,
            files,
            plan_source: plan.source(),
        })
    }
}

/// Collaborator errors default to transient, but a downloader that already
/// classified its failure (an oversized body) keeps that classification.
fn classify(stage: Stage, err: anyhow::Error) -> PipelineError {
    match err.downcast::<PipelineError>() {
        Ok(classified) => classified,
        Err(err) => PipelineError::transient(stage, err),
    }
}

fn apply_overrides(features: &mut MusicalFeatures, options: &RegenerateOptions) {
    if let Some(tempo) = options.tempo_bpm {
        features.tempo_bpm = tempo;
    }
    if let Some(key) = &options.key {
        features.key = key.clone();
    }
    if let Some(mood) = &options.mood {
        features.mood = mood.clone();
    }
    if let Some(genre) = &options.genre {
        features.genre = genre.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_keeps_downloader_classification() {
        let sized: anyhow::Error = PipelineError::permanent(Stage::Validate, "too big").into();
        assert!(!classify(Stage::Download, sized).is_retryable());

        let plain = classify(Stage::Download, anyhow::anyhow!("connection reset"));
        assert!(plain.is_retryable());
        assert_eq!(plain.stage(), Stage::Download);
    }

    #[test]
    fn test_overrides_apply_selectively() {
        let mut features = MusicalFeatures::fallback();
        apply_overrides(
            &mut features,
            &RegenerateOptions {
                tempo_bpm: Some(128),
                genre: Some("house".to_string()),
                ..Default::default()
            },
        );

        assert_eq!(features.tempo_bpm, 128);
        assert_eq!(features.genre, "house");
        // Untouched fields keep their analyzed values
        assert_eq!(features.key, MusicalFeatures::fallback().key);
    }
}
