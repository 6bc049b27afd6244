//! Telephony-facing surface: call sessions, gateway webhooks, and the
//! spoken-markup documents we answer them with.

pub mod controller;
pub mod markup;
pub mod routes;
pub mod session;
pub mod signature;

pub use controller::{CallController, CallSettings, Correlation};
pub use markup::VoiceResponse;
pub use routes::{router, AppState};
pub use session::{CallSession, CallState, SessionError, SessionRegistry};
pub use signature::{SignatureError, SignatureVerifier, SIGNATURE_HEADER};
