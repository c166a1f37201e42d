//! Login error taxonomy with retry classification.
//!
//! Every failure the backend can hand us collapses into one [`ErrorKind`].
//! The controller asks the kind what to do next instead of inspecting
//! messages.
//!
//! | Kind              | Trigger                                  | Policy                         |
//! |-------------------|------------------------------------------|--------------------------------|
//! | TransportError    | network failure on fetch or submit       | retry after fixed delay        |
//! | SessionMissing    | no token in the CAPTCHA response         | retry after fixed delay        |
//! | CaptchaInvalid    | backend rejected the CAPTCHA guess       | retry at once, fresh CAPTCHA   |
//! | CredentialInvalid | bad credentials or unrecognised status   | terminal                       |
//! | DecodingError     | response body is not the expected JSON   | terminal                       |

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What the controller does after a failure of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Wait the configured delay, then fetch a new session.
    AfterDelay,
    /// Fetch a new session right away and count the attempt.
    FreshCaptcha,
    /// Stop the sequence and surface the failure.
    Terminal,
}

impl RetryPolicy {
    pub fn is_retriable(self) -> bool {
        !matches!(self, Self::Terminal)
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AfterDelay => write!(f, "after_delay"),
            Self::FreshCaptcha => write!(f, "fresh_captcha"),
            Self::Terminal => write!(f, "terminal"),
        }
    }
}

/// Closed set of login failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("transport failure")]
    TransportError,

    #[error("no session token")]
    SessionMissing,

    #[error("captcha rejected")]
    CaptchaInvalid,

    #[error("credentials rejected")]
    CredentialInvalid,

    #[error("undecodable response")]
    DecodingError,
}

impl ErrorKind {
    pub fn retry_policy(self) -> RetryPolicy {
        match self {
            Self::TransportError | Self::SessionMissing => RetryPolicy::AfterDelay,
            Self::CaptchaInvalid => RetryPolicy::FreshCaptcha,
            Self::CredentialInvalid | Self::DecodingError => RetryPolicy::Terminal,
        }
    }

    pub fn is_retriable(self) -> bool {
        self.retry_policy().is_retriable()
    }

    /// Stable identifier for logs and telemetry.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransportError => "transport_error",
            Self::SessionMissing => "session_missing",
            Self::CaptchaInvalid => "captcha_invalid",
            Self::CredentialInvalid => "credential_invalid",
            Self::DecodingError => "decoding_error",
        }
    }

    /// Text shown to the person logging in.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::TransportError => "The login server could not be reached. Please try again.",
            Self::SessionMissing => {
                "Could not start a login session. Please refresh the CAPTCHA and try again."
            }
            Self::CaptchaInvalid => "The CAPTCHA was not accepted. Please try again.",
            Self::CredentialInvalid => "Incorrect username or password.",
            Self::DecodingError => "The login server sent an unexpected response. Please try again.",
        }
    }
}

/// Setup and configuration failures, outside the retry loop.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}
