//! Runtime configuration.
//!
//! Everything is settable by flag or environment variable; defaults are
//! tuned for local development. The gateway secret has no default: without
//! it the server only starts in `--trust-gateway` mode.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// humline server configuration
#[derive(Debug, Clone, Parser)]
#[command(name = "humline", about = "Voice-to-song hotline service")]
pub struct Config {
    /// Address to bind the webhook server on
    #[arg(long, env = "HUMLINE_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Public base URL the telephony gateway reaches us at.
    /// Used both for signature verification and for callback URLs.
    #[arg(long, env = "HUMLINE_PUBLIC_URL", default_value = "http://localhost:8080")]
    pub public_url: String,

    /// Shared secret for gateway webhook signatures
    #[arg(long, env = "HUMLINE_GATEWAY_SECRET")]
    pub gateway_secret: Option<String>,

    /// Skip webhook signature verification (local development only)
    #[arg(long, env = "HUMLINE_TRUST_GATEWAY", default_value_t = false)]
    pub trust_gateway: bool,

    /// Expose internal error detail on dashboard responses
    #[arg(long, env = "HUMLINE_DEV_MODE", default_value_t = false)]
    pub dev_mode: bool,

    /// Token required on admin dashboard endpoints
    #[arg(long, env = "HUMLINE_ADMIN_TOKEN", default_value = "")]
    pub admin_token: String,

    /// JSON file of users for the in-memory directory
    #[arg(long, env = "HUMLINE_USERS_FILE")]
    pub users_file: Option<PathBuf>,

    /// JSONL file for durable processing-session records
    #[arg(long, env = "HUMLINE_SESSIONS_FILE", default_value = "humline_sessions.jsonl")]
    pub sessions_file: PathBuf,

    /// Maximum pipeline attempts per job (first try included)
    #[arg(long, env = "HUMLINE_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    /// Timeout for each external call within a pipeline stage, in seconds
    #[arg(long, env = "HUMLINE_STAGE_TIMEOUT_SECS", default_value_t = 30)]
    pub stage_timeout_secs: u64,

    /// Seconds the caller has to enter their PIN
    #[arg(long, env = "HUMLINE_PIN_TIMEOUT_SECS", default_value_t = 10)]
    pub pin_timeout_secs: u32,

    /// Hard cap on recording length, in seconds
    #[arg(long, env = "HUMLINE_RECORDING_MAX_SECS", default_value_t = 30)]
    pub recording_max_secs: u32,

    /// Reject downloaded audio smaller than this (likely corrupt)
    #[arg(long, env = "HUMLINE_MIN_AUDIO_BYTES", default_value_t = 1024)]
    pub min_audio_bytes: u64,

    /// Reject downloaded audio larger than this
    #[arg(long, env = "HUMLINE_MAX_AUDIO_BYTES", default_value_t = 26_214_400)]
    pub max_audio_bytes: u64,

    /// Evict call sessions that have been idle this long, in seconds
    #[arg(long, env = "HUMLINE_CALL_TTL_SECS", default_value_t = 600)]
    pub call_ttl_secs: u64,

    /// Speech-to-text collaborator endpoint
    #[arg(long, env = "HUMLINE_STT_URL", default_value = "http://localhost:9001/transcribe")]
    pub stt_url: String,

    /// Musical-feature analysis collaborator endpoint
    #[arg(long, env = "HUMLINE_ANALYZER_URL", default_value = "http://localhost:9002/analyze")]
    pub analyzer_url: String,

    /// Generation model collaborator endpoint
    #[arg(long, env = "HUMLINE_GENERATION_URL", default_value = "http://localhost:9003/generate")]
    pub generation_url: String,

    /// File materializer collaborator endpoint
    #[arg(long, env = "HUMLINE_MATERIALIZER_URL", default_value = "http://localhost:9004/materialize")]
    pub materializer_url: String,

    /// Outbound SMS gateway endpoint
    #[arg(long, env = "HUMLINE_SMS_URL", default_value = "http://localhost:9005/messages")]
    pub sms_url: String,

    /// Outbound SMS gateway API token
    #[arg(long, env = "HUMLINE_SMS_TOKEN", default_value = "")]
    pub sms_token: String,
}

impl Config {
    /// Per-external-call timeout as a `Duration`
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    /// Call-session idle TTL as a `Duration`
    pub fn call_ttl(&self) -> Duration {
        Duration::from_secs(self.call_ttl_secs)
    }

    /// Full URL for a path on our public base (no trailing-slash surprises)
    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.public_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::parse_from(["humline"])
    }

    #[test]
    fn test_defaults() {
        let config = test_config();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.recording_max_secs, 30);
        assert_eq!(config.stage_timeout(), Duration::from_secs(30));
        assert!(!config.trust_gateway);
    }

    #[test]
    fn test_url_for_joins_cleanly() {
        let mut config = test_config();
        config.public_url = "https://hotline.example.com/".to_string();
        assert_eq!(
            config.url_for("/voice/authenticate"),
            "https://hotline.example.com/voice/authenticate"
        );
    }
}
