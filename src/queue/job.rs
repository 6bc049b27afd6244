//! Job types tracked by the queue processor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Parameter overrides for a regeneration request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tempo_bpm: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
}

/// What a job is for, with its payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Process a freshly submitted call recording
    ProcessRecording {
        user_id: Uuid,
        call_id: String,
        recording_url: String,
        duration_secs: u32,
    },

    /// Re-run generation for an existing session, from the dashboard
    RegenerateSession {
        user_id: Uuid,
        session_id: Uuid,
        recording_url: String,
        #[serde(default)]
        options: RegenerateOptions,
    },
}

impl JobKind {
    pub fn user_id(&self) -> Uuid {
        match self {
            Self::ProcessRecording { user_id, .. } | Self::RegenerateSession { user_id, .. } => {
                *user_id
            }
        }
    }

    pub fn recording_url(&self) -> &str {
        match self {
            Self::ProcessRecording { recording_url, .. }
            | Self::RegenerateSession { recording_url, .. } => recording_url,
        }
    }

    /// Correlation id for events: the call id or the session id
    pub fn reference(&self) -> String {
        match self {
            Self::ProcessRecording { call_id, .. } => call_id.clone(),
            Self::RegenerateSession { session_id, .. } => session_id.to_string(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::ProcessRecording { .. } => "process_recording",
            Self::RegenerateSession { .. } => "regenerate_session",
        }
    }
}

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Retrying,
    Completed,
    FailedTerminal,
}

impl JobStatus {
    /// No further transitions occur from a terminal status
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::FailedTerminal)
    }
}

/// A unit of pipeline work with status and retry count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,

    /// Processing attempts started so far; never exceeds `max_attempts`
    pub attempts: u32,

    /// Fixed attempt cap for this job
    pub max_attempts: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(kind: JobKind, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Read-only view of one job for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub kind: &'static str,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub reference: String,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            kind: job.kind.label(),
            status: job.status,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            reference: job.kind.reference(),
        }
    }
}

/// Observational snapshot of the queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatusReport {
    pub queued: usize,
    /// True only while an attempt is actually running, not during a retry delay
    pub processing: bool,
    pub jobs: Vec<JobSummary>,
}
