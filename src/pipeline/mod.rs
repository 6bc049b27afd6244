//! The generation pipeline.
//!
//! A job runs through a fixed ordered sequence of stages: download,
//! validate, transcribe, analyze, persist, generate, materialize, save,
//! notify. The pipeline as a whole is the unit of retry; an error at any
//! stage before notify fails the run, and the queue decides whether to
//! requeue it.

pub mod analyze;
pub mod download;
pub mod generate;
pub mod runner;
pub mod transcribe;

use thiserror::Error;

pub use analyze::{FeatureAnalyzer, HttpFeatureAnalyzer, MusicalFeatures};
pub use download::{AudioLimits, Downloader, HttpDownloader, LocalArtifact};
pub use generate::{
    ChainRole, GenerationChain, GenerationModel, HttpGenerationModel, PlanSource, ProductionPlan,
};
pub use runner::{
    FileMaterializer, GeneratedFile, HttpFileMaterializer, PipelineFailure, PipelineOutcome,
    PipelineRunner,
};
pub use transcribe::{HttpTranscriber, Transcriber, Transcript, TranscriptSegment};

/// One discrete step of the pipeline, used for error attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Download,
    Validate,
    Transcribe,
    Analyze,
    Persist,
    Generate,
    Materialize,
    Save,
    Notify,
}

impl Stage {
    /// Stage label used in events and logging
    pub fn label(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Validate => "validate",
            Self::Transcribe => "transcribe",
            Self::Analyze => "analyze",
            Self::Persist => "persist",
            Self::Generate => "generate",
            Self::Materialize => "materialize",
            Self::Save => "save",
            Self::Notify => "notify",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A pipeline failure, classified for the retry policy.
///
/// Transient errors (network, timeout, collaborator hiccup) are retried up
/// to the job's attempt cap. Permanent errors (corrupt or oversized audio)
/// short-circuit straight to the terminal failure path.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} failed (transient): {message}")]
    Transient { stage: Stage, message: String },

    #[error("{stage} failed (permanent): {message}")]
    Permanent { stage: Stage, message: String },
}

impl PipelineError {
    pub fn transient(stage: Stage, err: impl std::fmt::Display) -> Self {
        Self::Transient {
            stage,
            message: err.to_string(),
        }
    }

    pub fn permanent(stage: Stage, err: impl std::fmt::Display) -> Self {
        Self::Permanent {
            stage,
            message: err.to_string(),
        }
    }

    /// Whether the retry policy may requeue after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// The stage the error occurred in
    pub fn stage(&self) -> Stage {
        match self {
            Self::Transient { stage, .. } | Self::Permanent { stage, .. } => *stage,
        }
    }

    /// Short summary safe for events and dashboards (no internal detail)
    pub fn summary(&self) -> String {
        format!("{} stage failed", self.stage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transient = PipelineError::transient(Stage::Download, "connection reset");
        let permanent = PipelineError::permanent(Stage::Validate, "audio too small");

        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert_eq!(transient.stage(), Stage::Download);
        assert_eq!(permanent.stage(), Stage::Validate);
    }

    #[test]
    fn test_summary_hides_detail() {
        let err = PipelineError::transient(Stage::Transcribe, "secret internal detail");
        assert_eq!(err.summary(), "transcribe stage failed");
        assert!(!err.summary().contains("secret"));
    }
}
