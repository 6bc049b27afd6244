//! Call Flow Integration Tests
//!
//! Drives the webhook router end to end: signed requests, the PIN state
//! machine, and job submission on recording completion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use clap::Parser;
use tower::ServiceExt;
use uuid::Uuid;

use humline::auth::{Authenticator, InMemoryDirectory, User, UserDirectory};
use humline::config::Config;
use humline::notify::{BroadcastHub, MessageSender, Notifier};
use humline::pipeline::{PipelineFailure, PipelineOutcome, PlanSource};
use humline::queue::{Job, JobProcessor, JobQueue, JobStatus, RetryPolicy};
use humline::storage::JsonlSessionStore;
use humline::telephony::{
    router, AppState, CallController, CallSettings, CallState, SessionRegistry, SignatureVerifier,
    SIGNATURE_HEADER,
};

const SECRET: &str = "wicker-chair-hotline";
const PUBLIC_URL: &str = "https://hotline.example.com";

struct OkProcessor;

#[async_trait]
impl JobProcessor for OkProcessor {
    async fn process(&self, _: &Job) -> Result<PipelineOutcome, PipelineFailure> {
        Ok(PipelineOutcome {
            session_id: Uuid::new_v4(),
            files: vec![],
            plan_source: PlanSource::Model,
        })
    }
}

struct OkSms;

#[async_trait]
impl MessageSender for OkSms {
    async fn send(&self, _: &str, _: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Directory whose every lookup fails, for the degraded-dashboard paths
struct FailingDirectory;

#[async_trait]
impl UserDirectory for FailingDirectory {
    async fn find_by_pin(&self, _: &str) -> anyhow::Result<Option<User>> {
        anyhow::bail!("directory offline")
    }

    async fn find_by_id(&self, _: Uuid) -> anyhow::Result<Option<User>> {
        anyhow::bail!("directory offline")
    }

    async fn pin_exists(&self, _: &str) -> anyhow::Result<bool> {
        anyhow::bail!("directory offline")
    }

    async fn touch_last_access(&self, _: Uuid) -> anyhow::Result<()> {
        anyhow::bail!("directory offline")
    }

    async fn record_failed_attempt(&self, _: &str) -> anyhow::Result<()> {
        anyhow::bail!("directory offline")
    }

    async fn set_pin(&self, _: Uuid, _: &str) -> anyhow::Result<()> {
        anyhow::bail!("directory offline")
    }
}

struct Harness {
    app: Router,
    registry: Arc<SessionRegistry>,
    directory: Arc<InMemoryDirectory>,
    queue: Arc<JobQueue>,
    verifier: SignatureVerifier,
    user: User,
    _temp: tempfile::TempDir,
}

fn harness() -> Harness {
    let temp = tempfile::TempDir::new().unwrap();

    let mut config = Config::parse_from(["humline"]);
    config.public_url = PUBLIC_URL.to_string();
    config.gateway_secret = Some(SECRET.to_string());
    let config = Arc::new(config);

    let user = User {
        id: Uuid::new_v4(),
        pin: "042999".to_string(),
        phone: "+15551234567".to_string(),
        active: true,
        last_access: None,
    };
    let directory = Arc::new(InMemoryDirectory::new(vec![user.clone()]));

    let store = Arc::new(JsonlSessionStore::new(temp.path().join("sessions.jsonl")));
    let notifier = Arc::new(Notifier::new(Arc::new(BroadcastHub::new()), Arc::new(OkSms)));
    let queue = JobQueue::new(
        Arc::new(OkProcessor),
        store,
        directory.clone(),
        notifier.clone(),
        RetryPolicy::with_max_attempts(3),
    );

    let registry = Arc::new(SessionRegistry::new(Duration::from_secs(600)));
    let controller = Arc::new(CallController::new(
        registry.clone(),
        Authenticator::new(directory.clone()),
        queue.clone(),
        notifier,
        CallSettings {
            authenticate_url: config.url_for("/voice/authenticate"),
            recording_complete_url: config.url_for("/voice/recording-complete"),
            recording_status_url: config.url_for("/voice/recording-status"),
            pin_timeout_secs: 10,
            recording_max_secs: 30,
        },
    ));

    let app = router(AppState {
        controller,
        queue: queue.clone(),
        verifier: Some(Arc::new(SignatureVerifier::new(SECRET))),
        directory: directory.clone(),
        config,
    });

    Harness {
        app,
        registry,
        directory,
        queue,
        verifier: SignatureVerifier::new(SECRET),
        user,
        _temp: temp,
    }
}

/// Minimal app for the dashboard API, with a pluggable directory
fn dashboard_app(
    directory: Arc<dyn UserDirectory>,
    dev_mode: bool,
) -> (Router, tempfile::TempDir) {
    let temp = tempfile::TempDir::new().unwrap();

    let mut config = Config::parse_from(["humline"]);
    config.public_url = PUBLIC_URL.to_string();
    config.gateway_secret = Some(SECRET.to_string());
    config.dev_mode = dev_mode;
    let config = Arc::new(config);

    let store = Arc::new(JsonlSessionStore::new(temp.path().join("sessions.jsonl")));
    let notifier = Arc::new(Notifier::new(Arc::new(BroadcastHub::new()), Arc::new(OkSms)));
    let queue = JobQueue::new(
        Arc::new(OkProcessor),
        store,
        directory.clone(),
        notifier.clone(),
        RetryPolicy::with_max_attempts(3),
    );

    let registry = Arc::new(SessionRegistry::new(Duration::from_secs(600)));
    let controller = Arc::new(CallController::new(
        registry,
        Authenticator::new(directory.clone()),
        queue.clone(),
        notifier,
        CallSettings {
            authenticate_url: config.url_for("/voice/authenticate"),
            recording_complete_url: config.url_for("/voice/recording-complete"),
            recording_status_url: config.url_for("/voice/recording-status"),
            pin_timeout_secs: 10,
            recording_max_secs: 30,
        },
    ));

    let app = router(AppState {
        controller,
        queue,
        verifier: Some(Arc::new(SignatureVerifier::new(SECRET))),
        directory,
        config,
    });
    (app, temp)
}

fn regenerate_request(session_id: Uuid, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/api/sessions/{}/regenerate", session_id))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn form_encode(params: &[(&str, &str)]) -> String {
    fn pct(s: &str) -> String {
        s.bytes()
            .map(|b| match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    (b as char).to_string()
                }
                b' ' => "+".to_string(),
                _ => format!("%{:02X}", b),
            })
            .collect()
    }
    params
        .iter()
        .map(|(k, v)| format!("{}={}", pct(k), pct(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Build a signed webhook request the way the gateway would
fn signed_post(h: &Harness, path_and_query: &str, params: &[(&str, &str)]) -> Request<Body> {
    let url = format!("{}{}", PUBLIC_URL, path_and_query);
    let owned: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let signature = h.verifier.compute(&url, &owned);

    Request::builder()
        .method("POST")
        .uri(path_and_query)
        .header("content-type", "application/x-www-form-urlencoded")
        .header(SIGNATURE_HEADER, signature)
        .body(Body::from(form_encode(params)))
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn drain(queue: &Arc<JobQueue>) {
    for _ in 0..200 {
        let status = queue.status();
        let all_terminal = status.jobs.iter().all(|j| j.status.is_terminal());
        if status.queued == 0 && !status.processing && all_terminal {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue did not drain");
}

// ---------------------------------------------------------------------------
// Tests

#[tokio::test]
async fn test_happy_path_call_to_submitted_job() {
    let h = harness();

    // Incoming call: PIN gather
    let response = h
        .app
        .clone()
        .oneshot(signed_post(
            &h,
            "/voice/incoming",
            &[("CallSid", "CA1"), ("From", "+15550001111"), ("To", "+15559990000")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let xml = body_text(response).await;
    assert!(xml.contains("<Gather"));
    assert_eq!(h.registry.state_of("CA1"), Some(CallState::AwaitingPin));

    // Correct PIN: record document with correlation on the callbacks
    let response = h
        .app
        .clone()
        .oneshot(signed_post(
            &h,
            "/voice/authenticate",
            &[("CallSid", "CA1"), ("Digits", "042999"), ("From", "+15550001111")],
        ))
        .await
        .unwrap();
    let xml = body_text(response).await;
    assert!(xml.contains("<Record"));
    assert!(xml.contains(&format!("user_id={}", h.user.id)));
    assert!(xml.contains("call_id=CA1"));
    assert_eq!(h.registry.state_of("CA1"), Some(CallState::Recording));

    // Recording lands: job enqueued, thanks, hangup, session gone
    let query = format!(
        "/voice/recording-complete?user_id={}&call_id=CA1",
        h.user.id
    );
    let response = h
        .app
        .clone()
        .oneshot(signed_post(
            &h,
            &query,
            &[
                ("CallSid", "CA1"),
                ("RecordingUrl", "https://gateway.example.com/rec/CA1"),
                ("RecordingSid", "RE1"),
                ("RecordingDuration", "14"),
                ("From", "+15550001111"),
            ],
        ))
        .await
        .unwrap();
    let xml = body_text(response).await;
    assert!(xml.contains("<Hangup/>"));
    assert_eq!(h.registry.state_of("CA1"), None);

    drain(&h.queue).await;
    let jobs = h.queue.status().jobs;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert_eq!(jobs[0].reference, "CA1");
}

#[tokio::test]
async fn test_malformed_pin_reprompts_without_touching_the_directory() {
    let h = harness();

    h.app
        .clone()
        .oneshot(signed_post(
            &h,
            "/voice/incoming",
            &[("CallSid", "CA2"), ("From", "+15550001111"), ("To", "+15559990000")],
        ))
        .await
        .unwrap();

    let response = h
        .app
        .clone()
        .oneshot(signed_post(
            &h,
            "/voice/authenticate",
            &[("CallSid", "CA2"), ("Digits", "1234"), ("From", "+15550001111")],
        ))
        .await
        .unwrap();
    let xml = body_text(response).await;

    // Re-prompted, not rejected; no failed attempt was recorded
    assert!(xml.contains("<Gather"));
    assert!(!xml.contains("<Hangup/>"));
    assert_eq!(h.registry.state_of("CA2"), Some(CallState::AwaitingPin));
    assert_eq!(h.directory.failed_attempt_count().await, 0);
}

#[tokio::test]
async fn test_wrong_pin_rejects_terminally() {
    let h = harness();

    h.app
        .clone()
        .oneshot(signed_post(
            &h,
            "/voice/incoming",
            &[("CallSid", "CA3"), ("From", "+15550001111"), ("To", "+15559990000")],
        ))
        .await
        .unwrap();

    let response = h
        .app
        .clone()
        .oneshot(signed_post(
            &h,
            "/voice/authenticate",
            &[("CallSid", "CA3"), ("Digits", "111111"), ("From", "+15550001111")],
        ))
        .await
        .unwrap();
    let xml = body_text(response).await;
    assert!(xml.contains("<Hangup/>"));
    assert_eq!(h.registry.state_of("CA3"), Some(CallState::Rejected));
    assert_eq!(h.directory.failed_attempt_count().await, 1);

    // A later correct PIN on the same call does not resurrect it
    let response = h
        .app
        .clone()
        .oneshot(signed_post(
            &h,
            "/voice/authenticate",
            &[("CallSid", "CA3"), ("Digits", "042999"), ("From", "+15550001111")],
        ))
        .await
        .unwrap();
    let xml = body_text(response).await;
    assert!(xml.contains("<Hangup/>"));
    assert_eq!(h.registry.state_of("CA3"), Some(CallState::Rejected));
}

#[tokio::test]
async fn test_bad_signature_is_rejected_before_any_state_change() {
    let h = harness();

    let mut request = signed_post(
        &h,
        "/voice/incoming",
        &[("CallSid", "CA4"), ("From", "+15550001111"), ("To", "+15559990000")],
    );
    request
        .headers_mut()
        .insert(SIGNATURE_HEADER, "bm90IGEgcmVhbCBzaWduYXR1cmU=".parse().unwrap());

    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn test_missing_signature_is_rejected() {
    let h = harness();

    let request = Request::builder()
        .method("POST")
        .uri("/voice/incoming")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(form_encode(&[("CallSid", "CA5")])))
        .unwrap();

    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn test_failed_recording_status_ends_the_call_session() {
    let h = harness();

    h.app
        .clone()
        .oneshot(signed_post(
            &h,
            "/voice/incoming",
            &[("CallSid", "CA6"), ("From", "+15550001111"), ("To", "+15559990000")],
        ))
        .await
        .unwrap();
    h.app
        .clone()
        .oneshot(signed_post(
            &h,
            "/voice/authenticate",
            &[("CallSid", "CA6"), ("Digits", "042999"), ("From", "+15550001111")],
        ))
        .await
        .unwrap();

    let query = format!("/voice/recording-status?user_id={}&call_id=CA6", h.user.id);
    let response = h
        .app
        .clone()
        .oneshot(signed_post(
            &h,
            &query,
            &[("RecordingStatus", "failed"), ("RecordingSid", "RE6")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.registry.state_of("CA6"), None);
}

#[tokio::test]
async fn test_regenerate_endpoint_enqueues_a_job() {
    let h = harness();
    let session_id = Uuid::new_v4();

    let body = serde_json::json!({
        "user_id": h.user.id,
        "recording_url": "https://gateway.example.com/rec/old",
        "options": { "tempo_bpm": 128 }
    });

    let request = Request::builder()
        .method("POST")
        .uri(format!("/api/sessions/{}/regenerate", session_id))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let reply: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(reply["success"], true);

    drain(&h.queue).await;
    let jobs = h.queue.status().jobs;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, "regenerate_session");
    assert_eq!(jobs[0].reference, session_id.to_string());
}

#[tokio::test]
async fn test_regenerate_for_unknown_user_is_rejected() {
    let h = harness();

    let body = serde_json::json!({
        "user_id": Uuid::new_v4(),
        "recording_url": "https://gateway.example.com/rec/old"
    });

    let response = h
        .app
        .clone()
        .oneshot(regenerate_request(Uuid::new_v4(), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let reply: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(reply["success"], false);

    // Nothing was enqueued
    assert!(h.queue.status().jobs.is_empty());
}

#[tokio::test]
async fn test_regenerate_lookup_detail_shown_only_in_dev_mode() {
    for (dev_mode, expect_detail) in [(true, true), (false, false)] {
        let (app, _temp) = dashboard_app(Arc::new(FailingDirectory), dev_mode);

        let body = serde_json::json!({
            "user_id": Uuid::new_v4(),
            "recording_url": "https://gateway.example.com/rec/old"
        });

        let response = app
            .oneshot(regenerate_request(Uuid::new_v4(), &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let reply: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(reply["success"], false);
        let message = reply["message"].as_str().unwrap();
        assert_eq!(
            message.contains("directory offline"),
            expect_detail,
            "dev_mode={dev_mode}"
        );
    }
}
