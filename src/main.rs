//! humline server entrypoint

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use humline::auth::{Authenticator, InMemoryDirectory, UserDirectory};
use humline::config::Config;
use humline::notify::{BroadcastHub, Notifier, SmsGatewayClient};
use humline::pipeline::{
    AudioLimits, GenerationChain, HttpDownloader, HttpFeatureAnalyzer, HttpFileMaterializer,
    HttpGenerationModel, HttpTranscriber, PipelineRunner,
};
use humline::queue::{JobQueue, RetryPolicy};
use humline::storage::JsonlSessionStore;
use humline::telephony::{
    router, AppState, CallController, CallSettings, SessionRegistry, SignatureVerifier,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Arc::new(Config::parse());

    let verifier = match (&config.gateway_secret, config.trust_gateway) {
        (Some(secret), _) => Some(Arc::new(SignatureVerifier::new(secret.clone()))),
        (None, true) => {
            tracing::warn!("No gateway secret configured, webhook signatures are NOT verified");
            None
        }
        (None, false) => {
            anyhow::bail!("a gateway secret is required unless --trust-gateway is set")
        }
    };

    // User directory
    let directory: Arc<dyn UserDirectory> = match &config.users_file {
        Some(path) => Arc::new(InMemoryDirectory::from_json_file(path).await?),
        None => {
            tracing::warn!("No users file configured, starting with an empty directory");
            Arc::new(InMemoryDirectory::new(Vec::new()))
        }
    };

    // Notification fan-out
    let hub = Arc::new(BroadcastHub::new());
    let sms = Arc::new(SmsGatewayClient::new(
        config.sms_url.clone(),
        config.sms_token.clone(),
    ));
    let notifier = Arc::new(Notifier::new(hub, sms));

    // Pipeline and queue
    let store = Arc::new(JsonlSessionStore::new(config.sessions_file.clone()));
    let runner = Arc::new(PipelineRunner {
        downloader: Arc::new(HttpDownloader::new(config.max_audio_bytes)),
        transcriber: Arc::new(HttpTranscriber::new(config.stt_url.clone())),
        analyzer: Arc::new(HttpFeatureAnalyzer::new(config.analyzer_url.clone())),
        chain: GenerationChain::new(
            Arc::new(HttpGenerationModel::new(config.generation_url.clone())),
            config.stage_timeout(),
        ),
        materializer: Arc::new(HttpFileMaterializer::new(config.materializer_url.clone())),
        store: store.clone(),
        users: directory.clone(),
        notifier: notifier.clone(),
        limits: AudioLimits {
            min_bytes: config.min_audio_bytes,
            max_bytes: config.max_audio_bytes,
        },
        timeout: config.stage_timeout(),
        listen_base: config.url_for("/listen"),
    });
    let queue = JobQueue::new(
        runner,
        store,
        directory.clone(),
        notifier.clone(),
        RetryPolicy::with_max_attempts(config.max_attempts),
    );

    // Telephony
    let registry = Arc::new(SessionRegistry::new(config.call_ttl()));
    let controller = Arc::new(CallController::new(
        registry,
        Authenticator::new(directory.clone()),
        queue.clone(),
        notifier,
        CallSettings {
            authenticate_url: config.url_for("/voice/authenticate"),
            recording_complete_url: config.url_for("/voice/recording-complete"),
            recording_status_url: config.url_for("/voice/recording-status"),
            pin_timeout_secs: config.pin_timeout_secs,
            recording_max_secs: config.recording_max_secs,
        },
    ));

    let app = router(AppState {
        controller,
        queue,
        verifier,
        directory,
        config: config.clone(),
    });

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(bind = %config.bind, public_url = %config.public_url, "humline listening");
    axum::serve(listener, app).await?;

    Ok(())
}
