//! HTTP surface: gateway webhooks plus the dashboard API.
//!
//! Handlers stay thin. Webhook bodies are form-encoded and must pass
//! signature verification before any state changes; the call semantics
//! live in [`CallController`].

use std::sync::Arc;

use axum::extract::{OriginalUri, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::auth::UserDirectory;
use crate::config::Config;
use crate::queue::{JobKind, JobQueue, RegenerateOptions};

use super::controller::{CallController, Correlation};
use super::markup::VoiceResponse;
use super::signature::{SignatureVerifier, SIGNATURE_HEADER};

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<CallController>,
    pub queue: Arc<JobQueue>,
    /// `None` only in `--trust-gateway` mode
    pub verifier: Option<Arc<SignatureVerifier>>,
    pub directory: Arc<dyn UserDirectory>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/voice/incoming", post(voice_incoming))
        .route("/voice/authenticate", post(voice_authenticate))
        .route("/voice/recording-complete", post(voice_recording_complete))
        .route("/voice/recording-status", post(voice_recording_status))
        .route("/api/sessions/:session_id/regenerate", post(api_regenerate))
        .route("/api/queue/status", get(api_queue_status))
        .route("/healthz", get(healthz))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Gateway webhooks

async fn voice_incoming(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let params = parse_form(&body);
    if let Err(denied) = check_signature(&state, &uri, &headers, &params) {
        return denied;
    }

    let call_id = form_value(&params, "CallSid").unwrap_or_default();
    let from = form_value(&params, "From").unwrap_or_default();
    let to = form_value(&params, "To").unwrap_or_default();

    let doc = state.controller.handle_incoming_call(&call_id, &from, &to).await;
    voice_reply(doc)
}

async fn voice_authenticate(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let params = parse_form(&body);
    if let Err(denied) = check_signature(&state, &uri, &headers, &params) {
        return denied;
    }

    let call_id = form_value(&params, "CallSid").unwrap_or_default();
    let digits = form_value(&params, "Digits").unwrap_or_default();
    let from = form_value(&params, "From").unwrap_or_default();

    let doc = state.controller.handle_authenticate(&call_id, &digits, &from).await;
    voice_reply(doc)
}

async fn voice_recording_complete(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let params = parse_form(&body);
    if let Err(denied) = check_signature(&state, &uri, &headers, &params) {
        return denied;
    }

    let correlation = correlation_from(uri.query());
    let call_id = form_value(&params, "CallSid")
        .or_else(|| correlation.call_id.clone())
        .unwrap_or_default();
    let recording_url = form_value(&params, "RecordingUrl").unwrap_or_default();
    let duration_secs = form_value(&params, "RecordingDuration")
        .and_then(|d| d.parse().ok())
        .unwrap_or(0);

    let doc = state
        .controller
        .handle_recording_complete(&call_id, &correlation, &recording_url, duration_secs)
        .await;
    voice_reply(doc)
}

async fn voice_recording_status(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let params = parse_form(&body);
    if let Err(denied) = check_signature(&state, &uri, &headers, &params) {
        return denied;
    }

    let correlation = correlation_from(uri.query());
    let status = form_value(&params, "RecordingStatus").unwrap_or_default();

    state.controller.handle_recording_status(&correlation, &status).await;
    StatusCode::OK.into_response()
}

// ---------------------------------------------------------------------------
// Dashboard API

#[derive(Debug, Deserialize)]
struct RegenerateRequest {
    user_id: Uuid,
    recording_url: String,
    #[serde(default)]
    options: RegenerateOptions,
}

#[derive(Debug, Serialize)]
struct RegenerateReply {
    success: bool,
    job_id: Uuid,
}

async fn api_regenerate(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<RegenerateRequest>,
) -> Response {
    if request.recording_url.is_empty() {
        return dashboard_error(
            &state,
            StatusCode::BAD_REQUEST,
            "a recording reference is required",
            None,
        );
    }

    // Reject before enqueueing: a job for an unknown user would only fail
    // terminally in the pipeline.
    match state.directory.find_by_id(request.user_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return dashboard_error(&state, StatusCode::NOT_FOUND, "unknown user", None);
        }
        Err(e) => {
            return dashboard_error(
                &state,
                StatusCode::INTERNAL_SERVER_ERROR,
                "user lookup failed",
                Some(&e.to_string()),
            );
        }
    }

    let job_id = state.queue.enqueue(JobKind::RegenerateSession {
        user_id: request.user_id,
        session_id,
        recording_url: request.recording_url,
        options: request.options,
    });

    Json(RegenerateReply {
        success: true,
        job_id,
    })
    .into_response()
}

async fn api_queue_status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !admin_authorized(&state.config, &headers) {
        return dashboard_error(&state, StatusCode::UNAUTHORIZED, "unauthorized", None);
    }
    Json(state.queue.status()).into_response()
}

async fn healthz() -> &'static str {
    "ok"
}

// ---------------------------------------------------------------------------
// Helpers

fn voice_reply(doc: VoiceResponse) -> Response {
    (
        [(header::CONTENT_TYPE, "application/xml")],
        doc.to_xml(),
    )
        .into_response()
}

/// Signature gate for every webhook. Runs before any state mutation;
/// a miss means the request never reaches the controller.
fn check_signature(
    state: &AppState,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    params: &[(String, String)],
) -> Result<(), Response> {
    let verifier = match &state.verifier {
        Some(verifier) => verifier,
        None => return Ok(()),
    };

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(uri.path());
    let url = state.config.url_for(path_and_query);

    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if provided.is_empty() {
        warn!(path = uri.path(), "Webhook without a signature header");
        return Err(StatusCode::FORBIDDEN.into_response());
    }

    if let Err(e) = verifier.verify(&url, params, provided) {
        warn!(path = uri.path(), error = %e, "Webhook signature rejected");
        return Err(StatusCode::FORBIDDEN.into_response());
    }

    Ok(())
}

fn admin_authorized(config: &Config, headers: &HeaderMap) -> bool {
    if config.admin_token.is_empty() {
        // No token configured: local development
        return true;
    }
    headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == config.admin_token)
        .unwrap_or(false)
}

fn dashboard_error(
    state: &AppState,
    status: StatusCode,
    message: &str,
    detail: Option<&str>,
) -> Response {
    let message = match detail {
        Some(detail) if state.config.dev_mode => format!("{message}: {detail}"),
        _ => message.to_string(),
    };
    (status, Json(json!({ "success": false, "message": message }))).into_response()
}

fn correlation_from(query: Option<&str>) -> Correlation {
    let params = parse_form(query.unwrap_or(""));
    Correlation {
        user_id: form_value(&params, "user_id").and_then(|v| v.parse().ok()),
        call_id: form_value(&params, "call_id"),
    }
}

fn form_value(params: &[(String, String)], key: &str) -> Option<String> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

/// Parse an `application/x-www-form-urlencoded` body (or a URL query)
/// into key/value pairs, preserving order
pub(crate) fn parse_form(body: &str) -> Vec<(String, String)> {
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (url_decode(key), url_decode(value))
        })
        .collect()
}

fn url_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                if let (Some(hi), Some(lo)) = (
                    bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                    bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
                ) {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_form_decodes_pairs() {
        let params = parse_form("CallSid=CA123&From=%2B15551234567&Digits=042999");
        assert_eq!(form_value(&params, "CallSid").as_deref(), Some("CA123"));
        assert_eq!(form_value(&params, "From").as_deref(), Some("+15551234567"));
        assert_eq!(form_value(&params, "Digits").as_deref(), Some("042999"));
    }

    #[test]
    fn test_parse_form_plus_is_space() {
        let params = parse_form("prompt=hello+world");
        assert_eq!(form_value(&params, "prompt").as_deref(), Some("hello world"));
    }

    #[test]
    fn test_parse_form_tolerates_garbage() {
        let params = parse_form("&&a=%ZZ&b");
        assert_eq!(form_value(&params, "a").as_deref(), Some("%ZZ"));
        assert_eq!(form_value(&params, "b").as_deref(), Some(""));
    }

    #[test]
    fn test_correlation_from_query() {
        let user_id = Uuid::new_v4();
        let query = format!("user_id={user_id}&call_id=CA9");
        let correlation = correlation_from(Some(&query));
        assert_eq!(correlation.user_id, Some(user_id));
        assert_eq!(correlation.call_id.as_deref(), Some("CA9"));
    }
}
