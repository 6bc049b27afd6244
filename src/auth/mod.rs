//! PIN authentication against the user directory.
//!
//! The caller-facing contract: a malformed PIN and an unknown PIN produce
//! the same generic rejection, so a response never leaks whether a PIN
//! exists. Failed attempts are recorded for future rate limiting.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// Attempts made before PIN rotation gives up on finding a free value
const ROTATE_MAX_ATTEMPTS: u32 = 10;

/// Errors from authentication operations
#[derive(Debug, Error)]
pub enum AuthError {
    /// User-correctable; the PIN was not exactly 6 digits
    #[error("PIN must be exactly 6 digits")]
    Format,

    /// The 10^6 PIN space yielded no free value within the retry cap.
    /// Birthday-bound: this worsens as the user population grows; a wider
    /// or pre-partitioned PIN space is the remedy.
    #[error("Could not allocate a unique PIN after {ROTATE_MAX_ATTEMPTS} attempts")]
    PinSpaceExhausted,

    #[error("Unknown user: {0}")]
    UnknownUser(Uuid),

    #[error("Directory error: {0}")]
    Directory(#[from] anyhow::Error),
}

/// A registered caller (external entity, referenced only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub pin: String,
    pub phone: String,
    pub active: bool,
    #[serde(default)]
    pub last_access: Option<DateTime<Utc>>,
}

/// User registry seam (external collaborator)
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_pin(&self, pin: &str) -> Result<Option<User>>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>>;

    async fn pin_exists(&self, pin: &str) -> Result<bool>;

    async fn touch_last_access(&self, id: Uuid) -> Result<()>;

    /// Record a failed attempt for later rate limiting. The attempted PIN
    /// itself is deliberately not passed in.
    async fn record_failed_attempt(&self, from: &str) -> Result<()>;

    async fn set_pin(&self, id: Uuid, pin: &str) -> Result<()>;
}

/// Validates PINs and rotates them
pub struct Authenticator {
    directory: Arc<dyn UserDirectory>,
}

impl Authenticator {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self { directory }
    }

    /// Whether `raw` has the required shape: exactly 6 ASCII digits
    pub fn pin_format_ok(raw: &str) -> bool {
        raw.len() == 6 && raw.bytes().all(|b| b.is_ascii_digit())
    }

    /// Validate a submitted PIN.
    ///
    /// Returns `Err(AuthError::Format)` for malformed input, `Ok(None)` for
    /// an unrecognized PIN (after recording the failed attempt), and
    /// `Ok(Some(user))` on a match. An unrecognized PIN is never an error:
    /// the caller presents one generic rejection either way.
    pub async fn validate_pin(&self, raw: &str, from: &str) -> Result<Option<User>, AuthError> {
        if !Self::pin_format_ok(raw) {
            return Err(AuthError::Format);
        }

        let user = self.directory.find_by_pin(raw).await?;

        match user {
            Some(user) if user.active => {
                self.directory.touch_last_access(user.id).await?;
                info!(user_id = %user.id, "PIN accepted");
                Ok(Some(user))
            }
            _ => {
                self.directory.record_failed_attempt(from).await?;
                Ok(None)
            }
        }
    }

    /// Rotate a user's PIN to a fresh cryptographically random 6-digit
    /// value, retrying on collision up to a fixed cap.
    pub async fn rotate_pin(&self, user_id: Uuid) -> Result<String, AuthError> {
        if self.directory.find_by_id(user_id).await?.is_none() {
            return Err(AuthError::UnknownUser(user_id));
        }

        for _ in 0..ROTATE_MAX_ATTEMPTS {
            let candidate = format!("{:06}", OsRng.gen_range(0..1_000_000u32));

            if !self.directory.pin_exists(&candidate).await? {
                self.directory.set_pin(user_id, &candidate).await?;
                info!(%user_id, "PIN rotated");
                return Ok(candidate);
            }
        }

        Err(AuthError::PinSpaceExhausted)
    }
}

/// A recorded failed authentication attempt
#[derive(Debug, Clone)]
pub struct FailedAttempt {
    pub at: DateTime<Utc>,
    pub from: String,
}

/// In-memory directory, optionally loaded from a JSON file.
///
/// Ships for the binary and tests; production deployments put a real
/// database behind the `UserDirectory` trait instead.
pub struct InMemoryDirectory {
    users: RwLock<HashMap<Uuid, User>>,
    failed_attempts: RwLock<Vec<FailedAttempt>>,
}

impl InMemoryDirectory {
    pub fn new(users: Vec<User>) -> Self {
        Self {
            users: RwLock::new(users.into_iter().map(|u| (u.id, u)).collect()),
            failed_attempts: RwLock::new(Vec::new()),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Load users from a JSON array file
    pub async fn from_json_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read users file: {}", path.display()))?;
        let users: Vec<User> =
            serde_json::from_str(&content).context("Failed to parse users file")?;
        Ok(Self::new(users))
    }

    pub async fn failed_attempt_count(&self) -> usize {
        self.failed_attempts.read().await.len()
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn find_by_pin(&self, pin: &str) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users.values().find(|u| u.pin == pin).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users.get(&id).cloned())
    }

    async fn pin_exists(&self, pin: &str) -> Result<bool> {
        let users = self.users.read().await;
        Ok(users.values().any(|u| u.pin == pin))
    }

    async fn touch_last_access(&self, id: Uuid) -> Result<()> {
        let mut users = self.users.write().await;
        if let Some(user) = users.get_mut(&id) {
            user.last_access = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_failed_attempt(&self, from: &str) -> Result<()> {
        self.failed_attempts.write().await.push(FailedAttempt {
            at: Utc::now(),
            from: from.to_string(),
        });
        Ok(())
    }

    async fn set_pin(&self, id: Uuid, pin: &str) -> Result<()> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("User {} not found", id))?;
        user.pin = pin.to_string();
        Ok(())
    }
}
