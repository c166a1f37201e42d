//! Automated login against a CAPTCHA-gated backend.
//!
//! Each attempt fetches a CAPTCHA under a brand-new session, reads it with
//! the [`recognition`] ensemble, submits credentials plus the guess, and
//! classifies the reply to decide whether to try again.
//!
//! - [`controller`]: the retry loop and its outcomes
//! - [`backend`]: HTTP session broker and credential submitter
//! - [`classifier`]: backend status → [`errors::ErrorKind`]
//! - [`state_machine`]: legal sequence states and the transition log
//! - [`cookies`]: per-host cookie jar cleared before every fetch
//! - [`telemetry`]: per-sequence metrics and JSONL output

pub mod backend;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod cookies;
pub mod errors;
pub mod session;
pub mod state_machine;
pub mod telemetry;

pub use backend::HttpBackend;
pub use config::LoginConfig;
pub use controller::{
    CaptchaReader, ControllerConfig, LoginAttemptController, LoginOutcome, LoginReport,
};
pub use cookies::HostCookieStore;
pub use errors::{ErrorKind, LoginError, RetryPolicy};
pub use session::{
    CaptchaImage, CredentialSubmitter, Credentials, LoginAttempt, Session, SessionBroker,
    SessionContext, SubmitReply,
};
pub use state_machine::{LoginState, StateMachine, TransitionRecord};
pub use telemetry::{append_telemetry, SequenceMetrics};
