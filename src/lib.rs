//! humline - voice-to-song hotline service
//!
//! A caller dials in, authenticates with a 6-digit PIN, and records a short
//! musical idea. A background pipeline downloads the recording, transcribes
//! it, estimates musical features, generates a production plan through a
//! multi-stage backend, materializes audio files, and texts the caller a
//! link to the result.
//!
//! # Architecture
//!
//! Two halves, joined by a queue:
//! - The telephony side drives a per-call state machine
//!   (Ringing → AwaitingPin → Recording → Submitted) from signed gateway
//!   webhooks, and enqueues a job when a recording lands.
//! - The processing side is a single-worker FIFO queue that runs the
//!   generation pipeline per job, with tail-requeue retries and realtime
//!   status fan-out.
//!
//! # Modules
//!
//! - `telephony`: webhook handlers, call state machine, markup responses
//! - `auth`: PIN validation and rotation against a user directory
//! - `queue`: job queue processor with pluggable retry policy
//! - `pipeline`: the ordered generation stages and their collaborators
//! - `storage`: durable processing-session records
//! - `notify`: realtime event fan-out and best-effort SMS

pub mod auth;
pub mod config;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod storage;
pub mod telephony;

// Re-export main types at crate root for convenience
pub use auth::{Authenticator, User, UserDirectory};
pub use config::Config;
pub use notify::{JobEvent, JobEventKind, Notifier};
pub use pipeline::{PipelineError, PipelineRunner, Stage};
pub use queue::{Job, JobKind, JobQueue, JobStatus, RetryPolicy};
pub use storage::{ProcessingSession, SessionStatus, SessionStore};
pub use telephony::{CallController, CallState, SessionRegistry, VoiceResponse};
