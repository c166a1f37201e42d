//! Session, CAPTCHA and credential types plus the backend seams.
//!
//! [`SessionBroker`] hands out a CAPTCHA bound to a brand-new session;
//! [`CredentialSubmitter`] posts one login attempt. The HTTP implementation
//! lives in [`crate::backend`]; tests script both traits directly.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::classifier::{self, HttpOutcome};
use crate::errors::ErrorKind;

/// Opaque backend session, identified by the cookie token.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
    acquired_at: DateTime<Utc>,
}

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            acquired_at: Utc::now(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Token with all but the first four characters masked, for logs.
    pub fn redacted(&self) -> String {
        redact(&self.token)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.redacted())
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

/// Serialises the redacted token, never the raw one.
impl Serialize for Session {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Session", 2)?;
        state.serialize_field("token", &self.redacted())?;
        state.serialize_field("acquired_at", &self.acquired_at)?;
        state.end()
    }
}

pub(crate) fn redact(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 4 {
        "***".to_string()
    } else {
        format!("{visible}***")
    }
}

/// CAPTCHA image together with the session it was issued for.
#[derive(Clone)]
pub struct CaptchaImage {
    pub bytes: Vec<u8>,
    pub session: Session,
}

impl CaptchaImage {
    pub fn new(bytes: Vec<u8>, session: Session) -> Self {
        Self { bytes, session }
    }
}

impl fmt::Debug for CaptchaImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptchaImage")
            .field("bytes", &self.bytes.len())
            .field("session", &self.session)
            .finish()
    }
}

#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// One submission. Built fresh for every attempt and never reused.
#[derive(Debug)]
pub struct LoginAttempt<'a> {
    pub credentials: &'a Credentials,
    pub captcha_text: &'a str,
    pub session: &'a Session,
    /// CAPTCHA rejections so far in this sequence.
    pub attempt_number: u32,
}

/// Raw result of a submission, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitReply {
    /// Response decoded; carries the backend `status` string.
    Status(String),
    /// Request failed before a usable response arrived.
    Transport(String),
    /// Response arrived but was not the expected JSON.
    Undecodable(String),
}

impl SubmitReply {
    pub fn classify(&self) -> Result<(), ErrorKind> {
        match self {
            Self::Status(status) => classifier::classify(Some(status), HttpOutcome::Delivered),
            Self::Transport(_) => classifier::classify(None, HttpOutcome::TransportFailed),
            Self::Undecodable(_) => classifier::classify(None, HttpOutcome::Undecodable),
        }
    }
}

#[async_trait]
pub trait SessionBroker: Send + Sync {
    /// Discard any existing session for the backend host and download a
    /// CAPTCHA under a new one. Only `TransportError` and `SessionMissing`
    /// are expected here.
    async fn fetch_fresh(&self) -> Result<CaptchaImage, ErrorKind>;
}

#[async_trait]
pub trait CredentialSubmitter: Send + Sync {
    async fn submit(&self, attempt: &LoginAttempt<'_>) -> SubmitReply;
}

/// Session state owned by exactly one login sequence.
#[derive(Debug, Default)]
pub struct SessionContext {
    current: Option<CaptchaImage>,
    attempt_number: u32,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current CAPTCHA and session.
    pub fn install(&mut self, image: CaptchaImage) -> &CaptchaImage {
        self.current.insert(image)
    }

    pub fn current(&self) -> Option<&CaptchaImage> {
        self.current.as_ref()
    }

    pub fn session(&self) -> Option<&Session> {
        self.current.as_ref().map(|image| &image.session)
    }

    /// Forget the current session; it must not be submitted again.
    pub fn discard(&mut self) -> Option<CaptchaImage> {
        self.current.take()
    }

    pub fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    /// Count a CAPTCHA rejection and drop the session that produced it.
    pub fn record_captcha_rejection(&mut self) -> u32 {
        self.attempt_number += 1;
        self.current = None;
        self.attempt_number
    }

    /// Back to a clean slate. Returns the attempt number before the reset.
    pub fn reset(&mut self) -> u32 {
        self.current = None;
        std::mem::take(&mut self.attempt_number)
    }
}
