//! Call session controller.
//!
//! Semantics of the four telephony webhooks, independent of HTTP framing.
//! Every path out of here is a valid spoken document: a raw error must
//! never reach the gateway, because a silent or hung response on a live
//! call is the one unacceptable failure mode.

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::notify::Notifier;
use crate::queue::{JobKind, JobQueue};

use super::markup::VoiceResponse;
use super::session::{CallState, SessionRegistry};

/// Correlation context echoed back on recording callbacks
#[derive(Debug, Clone, Default)]
pub struct Correlation {
    pub user_id: Option<Uuid>,
    pub call_id: Option<String>,
}

/// Webhook-facing settings, resolved once at startup
#[derive(Debug, Clone)]
pub struct CallSettings {
    /// Full URL of the authenticate endpoint
    pub authenticate_url: String,
    /// Full URL of the recording-complete endpoint (correlation appended)
    pub recording_complete_url: String,
    /// Full URL of the recording-status endpoint (correlation appended)
    pub recording_status_url: String,
    pub pin_timeout_secs: u32,
    pub recording_max_secs: u32,
}

/// Drives the per-call state machine from gateway webhooks
pub struct CallController {
    registry: Arc<SessionRegistry>,
    authenticator: Authenticator,
    queue: Arc<JobQueue>,
    notifier: Arc<Notifier>,
    settings: CallSettings,
}

impl CallController {
    pub fn new(
        registry: Arc<SessionRegistry>,
        authenticator: Authenticator,
        queue: Arc<JobQueue>,
        notifier: Arc<Notifier>,
        settings: CallSettings,
    ) -> Self {
        Self {
            registry,
            authenticator,
            queue,
            notifier,
            settings,
        }
    }

    /// Incoming-call webhook: register the session and prompt for the PIN.
    pub async fn handle_incoming_call(&self, call_id: &str, from: &str, _to: &str) -> VoiceResponse {
        info!(call_id, from = redact(from), "Incoming call");
        self.registry.begin(call_id, from);

        VoiceResponse::new().gather(
            6,
            self.settings.pin_timeout_secs,
            '#',
            &self.settings.authenticate_url,
            "Welcome to the song hotline. Please enter your six digit PIN, followed by the pound key.",
        )
    }

    /// Authenticate webhook: validate the PIN and either start recording
    /// or reject. A rejected call must hang up and redial; there is no
    /// second PIN prompt.
    pub async fn handle_authenticate(&self, call_id: &str, digits: &str, from: &str) -> VoiceResponse {
        // An already-authenticated call never re-authenticates
        match self.registry.state_of(call_id) {
            Some(CallState::AwaitingPin) => {}
            Some(state) => {
                warn!(call_id, ?state, "Authenticate on a call past PIN entry, ignoring");
                return rejection_response();
            }
            None => {
                warn!(call_id, "Authenticate for unknown call");
                return rejection_response();
            }
        }

        if !Authenticator::pin_format_ok(digits) {
            // Format miss: re-prompt without advancing state, and without
            // touching the directory
            return VoiceResponse::new().gather(
                6,
                self.settings.pin_timeout_secs,
                '#',
                &self.settings.authenticate_url,
                "That didn't look like six digits. Please enter your six digit PIN, followed by the pound key.",
            );
        }

        match self.authenticator.validate_pin(digits, from).await {
            Ok(Some(user)) => {
                if let Err(e) = self.registry.mark_authenticated(call_id, user.id) {
                    warn!(call_id, error = %e, "Could not advance call to recording");
                    return rejection_response();
                }

                let correlation = format!("user_id={}&call_id={}", user.id, call_id);
                VoiceResponse::new()
                    .say("PIN accepted. After the beep, hum or sing your idea. You have thirty seconds.")
                    .record(
                        self.settings.recording_max_secs,
                        format!("{}?{}", self.settings.recording_complete_url, correlation),
                        format!("{}?{}", self.settings.recording_status_url, correlation),
                    )
            }
            Ok(None) => {
                let _ = self.registry.mark_rejected(call_id);
                rejection_response()
            }
            Err(e) => {
                // Includes directory failures; the caller hears the same
                // generic rejection as for a wrong PIN
                warn!(call_id, error = %e, "PIN validation error");
                let _ = self.registry.mark_rejected(call_id);
                rejection_response()
            }
        }
    }

    /// Recording-complete webhook: enqueue the processing job and thank
    /// the caller. Even an internal failure answers with a valid document.
    pub async fn handle_recording_complete(
        &self,
        call_id: &str,
        correlation: &Correlation,
        recording_url: &str,
        duration_secs: u32,
    ) -> VoiceResponse {
        if recording_url.is_empty() {
            warn!(call_id, "Recording-complete without a recording reference");
            return VoiceResponse::new()
                .say("We didn't catch a recording. Please call back and try again.")
                .hangup();
        }

        // The session is the authority on who authenticated; the echoed
        // query parameter is only a fallback for late callbacks
        let user_id = match self.registry.user_of(call_id).or(correlation.user_id) {
            Some(user_id) => user_id,
            None => {
                warn!(call_id, "Recording-complete without an authenticated user");
                return VoiceResponse::new()
                    .say("Something went wrong with this call. Please call back and try again.")
                    .hangup();
            }
        };

        let job_id = self.queue.enqueue(JobKind::ProcessRecording {
            user_id,
            call_id: call_id.to_string(),
            recording_url: recording_url.to_string(),
            duration_secs,
        });

        match self.registry.mark_submitted(call_id) {
            Ok(_) => info!(call_id, %job_id, "Recording submitted"),
            Err(e) => warn!(call_id, %job_id, error = %e, "Recording enqueued for stale call session"),
        }

        VoiceResponse::new()
            .say("Got it! We're turning your idea into a song. We'll text you a link in a few minutes.")
            .hangup()
    }

    /// Recording-status side channel: a failed recording fires the
    /// job-failure notification path without waiting for the completion
    /// webhook. Always succeeds from the gateway's point of view.
    pub async fn handle_recording_status(&self, correlation: &Correlation, status: &str) {
        if status != "failed" {
            return;
        }

        let call_id = correlation.call_id.clone().unwrap_or_default();
        error!(call_id, "Gateway reported a failed recording");

        if let Some(user_id) = correlation.user_id {
            self.notifier
                .job_failed(user_id, Uuid::new_v4(), &call_id, "recording failed at the gateway");
        }

        if !call_id.is_empty() {
            self.registry.end(&call_id);
        }
    }
}

/// The one generic rejection: identical whether the PIN was unknown,
/// the user inactive, or the directory unreachable
fn rejection_response() -> VoiceResponse {
    VoiceResponse::new()
        .say("Sorry, we couldn't verify that PIN. Please check it and call again.")
        .hangup()
}

/// Keep full caller numbers out of the logs
fn redact(phone: &str) -> String {
    if phone.len() <= 4 {
        return "***".to_string();
    }
    format!("***{}", &phone[phone.len() - 4..])
}
