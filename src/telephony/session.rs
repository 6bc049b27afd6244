//! Per-call session state.
//!
//! A `CallSession` is ephemeral: created on the incoming-call webhook,
//! advanced through the PIN and recording steps, and discarded once the
//! recording is submitted or the TTL passes. It is the source of truth for
//! call state; query-string correlation on callbacks is a cross-check,
//! never the only authority.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// State of one call. Transitions are strictly ordered; nothing skips a
/// stage or re-enters an earlier one within the same call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Incoming-call webhook received
    Ringing,
    /// PIN prompt played, waiting for digits
    AwaitingPin,
    /// PIN rejected; the caller must hang up and redial
    Rejected,
    /// PIN accepted, recording in progress
    Recording,
    /// Recording submitted to the queue
    Submitted,
}

impl CallState {
    fn can_transition_to(self, to: CallState) -> bool {
        matches!(
            (self, to),
            (Self::Ringing, Self::AwaitingPin)
                | (Self::AwaitingPin, Self::Rejected)
                | (Self::AwaitingPin, Self::Recording)
                | (Self::Recording, Self::Submitted)
        )
    }
}

/// Errors from the session registry
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Unknown call: {0}")]
    Unknown(String),

    #[error("Invalid call state transition: {from:?} → {to:?}")]
    InvalidTransition { from: CallState, to: CallState },
}

/// Ephemeral per-call state, keyed by the gateway call id
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: String,
    pub from: String,
    pub state: CallState,
    pub user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    touched: Instant,
}

/// Lookup table of live call sessions with TTL-based eviction
pub struct SessionRegistry {
    ttl: Duration,
    sessions: Mutex<HashMap<String, CallSession>>,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new call. The session is created Ringing and immediately
    /// advanced to AwaitingPin, since the PIN prompt goes out in the same
    /// webhook response.
    pub fn begin(&self, call_id: &str, from: &str) {
        let mut sessions = self.sessions.lock().expect("session map poisoned");

        let ttl = self.ttl;
        sessions.retain(|_, s| s.touched.elapsed() < ttl);

        sessions.insert(
            call_id.to_string(),
            CallSession {
                call_id: call_id.to_string(),
                from: from.to_string(),
                state: CallState::AwaitingPin,
                user_id: None,
                created_at: Utc::now(),
                touched: Instant::now(),
            },
        );
    }

    /// Current state of a call, if the session is live
    pub fn state_of(&self, call_id: &str) -> Option<CallState> {
        let sessions = self.sessions.lock().expect("session map poisoned");
        sessions
            .get(call_id)
            .filter(|s| s.touched.elapsed() < self.ttl)
            .map(|s| s.state)
    }

    /// Authenticated user attached to a call, if any
    pub fn user_of(&self, call_id: &str) -> Option<Uuid> {
        let sessions = self.sessions.lock().expect("session map poisoned");
        sessions.get(call_id).and_then(|s| s.user_id)
    }

    /// PIN accepted: AwaitingPin → Recording, with the user attached
    pub fn mark_authenticated(&self, call_id: &str, user_id: Uuid) -> Result<(), SessionError> {
        self.transition(call_id, CallState::Recording, Some(user_id))
    }

    /// PIN rejected: AwaitingPin → Rejected (terminal; redial to retry)
    pub fn mark_rejected(&self, call_id: &str) -> Result<(), SessionError> {
        self.transition(call_id, CallState::Rejected, None)
    }

    /// Recording submitted: Recording → Submitted, session discarded
    pub fn mark_submitted(&self, call_id: &str) -> Result<CallSession, SessionError> {
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        let session = sessions
            .get_mut(call_id)
            .ok_or_else(|| SessionError::Unknown(call_id.to_string()))?;

        if !session.state.can_transition_to(CallState::Submitted) {
            return Err(SessionError::InvalidTransition {
                from: session.state,
                to: CallState::Submitted,
            });
        }

        session.state = CallState::Submitted;
        // Submitted ends the session's lifetime
        Ok(sessions.remove(call_id).expect("session just touched"))
    }

    /// Drop a session (call ended without submitting)
    pub fn end(&self, call_id: &str) {
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        sessions.remove(call_id);
    }

    /// Evict all sessions idle past the TTL; returns how many were dropped
    pub fn sweep(&self) -> usize {
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        let before = sessions.len();
        let ttl = self.ttl;
        sessions.retain(|_, s| s.touched.elapsed() < ttl);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn transition(
        &self,
        call_id: &str,
        to: CallState,
        user_id: Option<Uuid>,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        let session = sessions
            .get_mut(call_id)
            .ok_or_else(|| SessionError::Unknown(call_id.to_string()))?;

        if !session.state.can_transition_to(to) {
            return Err(SessionError::InvalidTransition {
                from: session.state,
                to,
            });
        }

        session.state = to;
        session.touched = Instant::now();
        if user_id.is_some() {
            session.user_id = user_id;
        }

        Ok(())
    }
}
