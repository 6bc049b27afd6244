//! The generation backend: a four-stage chain with per-stage fallback.
//!
//! Analyst → composer → specialist → director, each a call to the
//! generation model. Every stage independently substitutes a
//! deterministic default when its call fails, so the chain always
//! produces a complete production plan. That property is the point:
//! a flaky backend degrades the plan, it never aborts the run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{MusicalFeatures, Transcript};

/// Role of one link in the generation chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainRole {
    /// Reads the transcript and features, writes the creative brief
    Analyst,
    /// Turns the brief into a chord progression and melody sketch
    Composer,
    /// Chooses instrumentation and arrangement
    Specialist,
    /// Writes final production direction
    Director,
}

impl ChainRole {
    pub fn label(self) -> &'static str {
        match self {
            Self::Analyst => "analyst",
            Self::Composer => "composer",
            Self::Specialist => "specialist",
            Self::Director => "director",
        }
    }
}

/// Where a chain stage's content came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Model,
    Fallback,
}

/// Per-stage provenance for a production plan
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlanSources {
    pub analyst: PlanSource,
    pub composer: PlanSource,
    pub specialist: PlanSource,
    pub director: PlanSource,
}

/// Structured production description assembled by the chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductionPlan {
    pub brief: String,
    pub chords: String,
    pub arrangement: String,
    pub direction: String,
    pub sources: PlanSources,
}

impl ProductionPlan {
    /// Overall provenance marker: `Fallback` if any stage fell back
    pub fn source(&self) -> PlanSource {
        let all_model = [
            self.sources.analyst,
            self.sources.composer,
            self.sources.specialist,
            self.sources.director,
        ]
        .iter()
        .all(|s| *s == PlanSource::Model);

        if all_model {
            PlanSource::Model
        } else {
            PlanSource::Fallback
        }
    }
}

/// The model behind the chain (external collaborator)
#[async_trait]
pub trait GenerationModel: Send + Sync {
    async fn complete(&self, role: ChainRole, prompt: &str, timeout: Duration) -> Result<String>;
}

/// Sequential four-stage chain over one generation model
pub struct GenerationChain {
    model: Arc<dyn GenerationModel>,
    timeout: Duration,
}

impl GenerationChain {
    pub fn new(model: Arc<dyn GenerationModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    /// Run the chain. Never fails; stages degrade independently.
    pub async fn run(&self, features: &MusicalFeatures, transcript: &Transcript) -> ProductionPlan {
        let (brief, analyst) = self
            .stage(ChainRole::Analyst, &analyst_prompt(features, transcript), || {
                fallback_brief(features)
            })
            .await;

        let (chords, composer) = self
            .stage(ChainRole::Composer, &composer_prompt(features, &brief), || {
                FALLBACK_CHORDS.to_string()
            })
            .await;

        let (arrangement, specialist) = self
            .stage(
                ChainRole::Specialist,
                &specialist_prompt(features, &chords),
                || FALLBACK_ARRANGEMENT.to_string(),
            )
            .await;

        let (direction, director) = self
            .stage(
                ChainRole::Director,
                &director_prompt(&brief, &arrangement),
                || FALLBACK_DIRECTION.to_string(),
            )
            .await;

        ProductionPlan {
            brief,
            chords,
            arrangement,
            direction,
            sources: PlanSources {
                analyst,
                composer,
                specialist,
                director,
            },
        }
    }

    async fn stage(
        &self,
        role: ChainRole,
        prompt: &str,
        fallback: impl FnOnce() -> String,
    ) -> (String, PlanSource) {
        match self.model.complete(role, prompt, self.timeout).await {
            Ok(content) if !content.trim().is_empty() => (content, PlanSource::Model),
            Ok(_) => {
                warn!(role = role.label(), "Chain stage returned empty content, using fallback");
                (fallback(), PlanSource::Fallback)
            }
            Err(e) => {
                warn!(role = role.label(), error = %e, "Chain stage failed, using fallback");
                (fallback(), PlanSource::Fallback)
            }
        }
    }
}

/// Fallback chord set used when the composer stage fails
pub const FALLBACK_CHORDS: &str = "C - G - Am - F (repeat, half-time final bar)";

const FALLBACK_ARRANGEMENT: &str = "soft pads, muted piano, light brushed percussion";

const FALLBACK_DIRECTION: &str =
    "keep the caller's take front and center; gentle dynamics; fade out over the last four bars";

fn fallback_brief(features: &MusicalFeatures) -> String {
    format!(
        "A {} {} piece at {} bpm in {}, built around the caller's idea.",
        features.mood, features.genre, features.tempo_bpm, features.key
    )
}

fn analyst_prompt(features: &MusicalFeatures, transcript: &Transcript) -> String {
    format!(
        "Features: {} bpm, {}, {}, {}.\nTranscript:\n{}\n\nWrite a one-paragraph creative brief.",
        features.tempo_bpm, features.key, features.mood, features.genre, transcript.text
    )
}

fn composer_prompt(features: &MusicalFeatures, brief: &str) -> String {
    format!(
        "Brief:\n{}\n\nPropose a chord progression and melody sketch in {} at {} bpm.",
        brief, features.key, features.tempo_bpm
    )
}

fn specialist_prompt(features: &MusicalFeatures, chords: &str) -> String {
    format!(
        "Genre: {}. Progression: {}.\n\nChoose instrumentation and arrangement.",
        features.genre, chords
    )
}

fn director_prompt(brief: &str, arrangement: &str) -> String {
    format!(
        "Brief:\n{}\nArrangement:\n{}\n\nWrite final production direction.",
        brief, arrangement
    )
}

/// HTTP generation-model client
pub struct HttpGenerationModel {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    role: &'static str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    content: String,
}

impl HttpGenerationModel {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl GenerationModel for HttpGenerationModel {
    async fn complete(&self, role: ChainRole, prompt: &str, timeout: Duration) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&CompletionRequest {
                role: role.label(),
                prompt,
            })
            .send()
            .await
            .context("Failed to reach generation model")?
            .error_for_status()
            .context("Generation model returned an error status")?;

        let completion: CompletionResponse = response
            .json()
            .await
            .context("Failed to parse generation model response")?;

        Ok(completion.content)
    }
}
