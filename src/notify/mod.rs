//! Job lifecycle notifications.
//!
//! Two channels out of the system: typed realtime events to dashboard
//! subscribers, and best-effort SMS to the caller. Both are fire-and-forget;
//! nothing here may affect a job's own success or failure.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Kind of job lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEventKind {
    #[serde(rename = "job_started")]
    Started,
    #[serde(rename = "job_completed")]
    Completed,
    #[serde(rename = "job_failed")]
    Failed,
}

/// A typed event published to a user's channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job_id: Uuid,

    /// Session id or call id the job correlates to
    pub reference: String,

    pub timestamp: DateTime<Utc>,

    /// Error summary, present on failure events only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobEvent {
    fn new(kind: JobEventKind, job_id: Uuid, reference: String) -> Self {
        Self {
            kind,
            job_id,
            reference,
            timestamp: Utc::now(),
            error: None,
        }
    }
}

/// Realtime transport seam. Publishing must never block or fail upward.
pub trait RealtimePublisher: Send + Sync {
    fn publish(&self, user_id: Uuid, event: &JobEvent);
}

/// In-process broadcast transport, channel per user
pub struct BroadcastHub {
    channels: Mutex<HashMap<Uuid, broadcast::Sender<JobEvent>>>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Join a user's channel
    pub fn subscribe(&self, user_id: Uuid) -> broadcast::Receiver<JobEvent> {
        let mut channels = self.channels.lock().expect("channel map poisoned");
        channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(32).0)
            .subscribe()
    }
}

impl RealtimePublisher for BroadcastHub {
    fn publish(&self, user_id: Uuid, event: &JobEvent) {
        let channels = self.channels.lock().expect("channel map poisoned");
        if let Some(sender) = channels.get(&user_id) {
            // A send error just means nobody is listening right now
            if sender.send(event.clone()).is_err() {
                debug!(%user_id, "No live subscribers for event");
            }
        }
    }
}

/// Outbound messaging seam
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, phone: &str, body: &str) -> Result<()>;
}

/// HTTP SMS gateway client
pub struct SmsGatewayClient {
    endpoint: String,
    token: String,
    client: reqwest::Client,
}

impl SmsGatewayClient {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MessageSender for SmsGatewayClient {
    async fn send(&self, phone: &str, body: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "to": phone,
                "body": body,
            }))
            .send()
            .await
            .context("Failed to reach SMS gateway")?;

        if !response.status().is_success() {
            anyhow::bail!("SMS gateway returned {}", response.status());
        }

        Ok(())
    }
}

/// Fan-out facade held by the queue and controller
pub struct Notifier {
    realtime: Arc<dyn RealtimePublisher>,
    sms: Arc<dyn MessageSender>,
}

impl Notifier {
    pub fn new(realtime: Arc<dyn RealtimePublisher>, sms: Arc<dyn MessageSender>) -> Self {
        Self { realtime, sms }
    }

    pub fn job_started(&self, user_id: Uuid, job_id: Uuid, reference: &str) {
        self.realtime.publish(
            user_id,
            &JobEvent::new(JobEventKind::Started, job_id, reference.to_string()),
        );
    }

    pub fn job_completed(&self, user_id: Uuid, job_id: Uuid, reference: &str) {
        self.realtime.publish(
            user_id,
            &JobEvent::new(JobEventKind::Completed, job_id, reference.to_string()),
        );
    }

    pub fn job_failed(&self, user_id: Uuid, job_id: Uuid, reference: &str, summary: &str) {
        let mut event = JobEvent::new(JobEventKind::Failed, job_id, reference.to_string());
        event.error = Some(summary.to_string());
        self.realtime.publish(user_id, &event);
    }

    /// Send an SMS, swallowing any failure.
    ///
    /// Failures are logged and dropped; callers must not see them.
    pub async fn sms_best_effort(&self, phone: &str, body: &str) {
        if let Err(e) = self.sms.send(phone, body).await {
            warn!(error = %e, "Outbound SMS failed (ignored)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSms;

    #[async_trait]
    impl MessageSender for FailingSms {
        async fn send(&self, _: &str, _: &str) -> Result<()> {
            anyhow::bail!("gateway down")
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_event() {
        let hub = BroadcastHub::new();
        let user_id = Uuid::new_v4();
        let mut rx = hub.subscribe(user_id);

        let job_id = Uuid::new_v4();
        hub.publish(
            user_id,
            &JobEvent::new(JobEventKind::Completed, job_id, "ref-1".to_string()),
        );

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, JobEventKind::Completed);
        assert_eq!(event.job_id, job_id);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let hub = BroadcastHub::new();
        // No channel exists for this user; must not panic
        hub.publish(
            Uuid::new_v4(),
            &JobEvent::new(JobEventKind::Started, Uuid::new_v4(), "ref".to_string()),
        );
    }

    #[test]
    fn test_event_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&JobEventKind::Failed).unwrap(),
            "\"job_failed\""
        );
        assert_eq!(
            serde_json::to_string(&JobEventKind::Started).unwrap(),
            "\"job_started\""
        );
    }

    #[test]
    fn test_failure_event_carries_summary() {
        let hub = Arc::new(BroadcastHub::new());
        let notifier = Notifier::new(hub.clone(), Arc::new(FailingSms));
        let user_id = Uuid::new_v4();
        let mut rx = hub.subscribe(user_id);

        notifier.job_failed(user_id, Uuid::new_v4(), "call-1", "download stage failed");

        let event = rx.try_recv().unwrap();
        assert_eq!(event.error.as_deref(), Some("download stage failed"));
    }

    #[tokio::test]
    async fn test_sms_failure_is_swallowed() {
        let notifier = Notifier::new(Arc::new(BroadcastHub::new()), Arc::new(FailingSms));
        // Must simply return, never panic or propagate
        notifier.sms_best_effort("+15551234567", "your song is ready").await;
    }
}
