//! Durable processing-session records.
//!
//! A `ProcessingSession` is the record of one generation attempt's outcome.
//! It is created in `processing` status before generation begins, so a
//! later failure always has something to mark failed.
//!
//! The shipped store is append-only JSONL with state derived from replay;
//! each status change is a new line, never an in-place edit.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::pipeline::{GeneratedFile, MusicalFeatures, PlanSource};

/// Errors from the session store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(Uuid),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Status of a processing session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Processing,
    Completed,
    Failed,
}

/// The durable record of one generation attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: SessionStatus,
    pub features: MusicalFeatures,

    /// Overall provenance of the production plan, once generated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_source: Option<PlanSource>,

    /// Generated file references, once materialized
    #[serde(default)]
    pub files: Vec<GeneratedFile>,

    /// Error summary, if the session failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingSession {
    /// Create a fresh session in `processing` status
    pub fn new(user_id: Uuid, features: MusicalFeatures) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            status: SessionStatus::Processing,
            features,
            plan_source: None,
            files: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Persistence seam for processing sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &ProcessingSession) -> Result<(), StoreError>;

    async fn mark_completed(
        &self,
        id: Uuid,
        files: &[GeneratedFile],
        source: PlanSource,
    ) -> Result<(), StoreError>;

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<ProcessingSession>, StoreError>;
}

/// An entry in the session log (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionEvent {
    timestamp: DateTime<Utc>,
    session_id: Uuid,
    event_type: SessionEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum SessionEventType {
    Created,
    Completed,
    Failed,
}

#[derive(Debug, Serialize, Deserialize)]
struct CompletionData {
    files: Vec<GeneratedFile>,
    source: PlanSource,
}

/// JSONL-backed session store
pub struct JsonlSessionStore {
    log_path: PathBuf,
}

impl JsonlSessionStore {
    pub fn new(log_path: PathBuf) -> Self {
        Self { log_path }
    }

    async fn append_event(&self, event: &SessionEvent) -> Result<(), StoreError> {
        if let Some(parent) = self.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        let json = serde_json::to_string(event)?;
        file.write_all(format!("{}\n", json).as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    /// Replay all entries to build current state
    async fn replay(&self) -> Result<HashMap<Uuid, ProcessingSession>, StoreError> {
        let mut sessions: HashMap<Uuid, ProcessingSession> = HashMap::new();

        if !self.log_path.exists() {
            return Ok(sessions);
        }

        let file = File::open(&self.log_path).await?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let event: SessionEvent = serde_json::from_str(&line)?;
            Self::apply_event(&mut sessions, event);
        }

        Ok(sessions)
    }

    fn apply_event(sessions: &mut HashMap<Uuid, ProcessingSession>, event: SessionEvent) {
        match event.event_type {
            SessionEventType::Created => {
                if let Some(data) = event.data {
                    if let Ok(session) = serde_json::from_value::<ProcessingSession>(data) {
                        sessions.insert(event.session_id, session);
                    }
                }
            }
            SessionEventType::Completed => {
                if let Some(session) = sessions.get_mut(&event.session_id) {
                    session.status = SessionStatus::Completed;
                    session.updated_at = event.timestamp;
                    if let Some(data) = event.data {
                        if let Ok(completion) = serde_json::from_value::<CompletionData>(data) {
                            session.files = completion.files;
                            session.plan_source = Some(completion.source);
                        }
                    }
                }
            }
            SessionEventType::Failed => {
                if let Some(session) = sessions.get_mut(&event.session_id) {
                    session.status = SessionStatus::Failed;
                    session.updated_at = event.timestamp;
                    if let Some(data) = event.data {
                        if let Some(error) = data.get("error").and_then(|e| e.as_str()) {
                            session.error = Some(error.to_string());
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl SessionStore for JsonlSessionStore {
    async fn create(&self, session: &ProcessingSession) -> Result<(), StoreError> {
        let event = SessionEvent {
            timestamp: Utc::now(),
            session_id: session.id,
            event_type: SessionEventType::Created,
            data: Some(serde_json::to_value(session)?),
        };
        self.append_event(&event).await
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        files: &[GeneratedFile],
        source: PlanSource,
    ) -> Result<(), StoreError> {
        let event = SessionEvent {
            timestamp: Utc::now(),
            session_id: id,
            event_type: SessionEventType::Completed,
            data: Some(serde_json::to_value(CompletionData {
                files: files.to_vec(),
                source,
            })?),
        };
        self.append_event(&event).await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let event = SessionEvent {
            timestamp: Utc::now(),
            session_id: id,
            event_type: SessionEventType::Failed,
            data: Some(serde_json::json!({ "error": error })),
        };
        self.append_event(&event).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<ProcessingSession>, StoreError> {
        let sessions = self.replay().await?;
        Ok(sessions.get(&id).cloned())
    }
}
