//! Maps what the backend said into an [`ErrorKind`].
//!
//! The backend reports outcomes as a free-form `status` string. All of its
//! wording lives in [`STATUS_RULES`]; update that table when the backend
//! changes its messages.
//!
//! | Status                                | Kind              |
//! |---------------------------------------|-------------------|
//! | `"ok"`                                | success           |
//! | exactly `"no"`                        | CredentialInvalid |
//! | contains `captcha` (any case)         | CaptchaInvalid    |
//! | anything else                         | CredentialInvalid |

use crate::errors::ErrorKind;

/// Status string that means the login went through.
pub const SUCCESS_STATUS: &str = "ok";

/// How the submission went at the HTTP level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpOutcome {
    /// A response body arrived; its status string decides.
    Delivered,
    /// No session token was available, nothing was sent.
    NoSession,
    /// The request never completed.
    TransportFailed,
    /// A body arrived but was not the expected JSON.
    Undecodable,
}

#[derive(Debug, Clone, Copy)]
enum StatusMatch {
    Exact(&'static str),
    ContainsIgnoreCase(&'static str),
}

impl StatusMatch {
    fn matches(self, status: &str) -> bool {
        match self {
            Self::Exact(expected) => status == expected,
            Self::ContainsIgnoreCase(needle) => status.to_lowercase().contains(needle),
        }
    }
}

/// Checked in order; first match wins.
const STATUS_RULES: &[(StatusMatch, ErrorKind)] = &[
    (StatusMatch::Exact("no"), ErrorKind::CredentialInvalid),
    (
        StatusMatch::ContainsIgnoreCase("captcha"),
        ErrorKind::CaptchaInvalid,
    ),
];

/// Unrecognised statuses end the sequence rather than loop forever.
const UNRECOGNIZED_STATUS: ErrorKind = ErrorKind::CredentialInvalid;

/// Classify one submission. `Ok(())` means the login succeeded.
pub fn classify(raw_status: Option<&str>, outcome: HttpOutcome) -> Result<(), ErrorKind> {
    match outcome {
        HttpOutcome::NoSession => Err(ErrorKind::SessionMissing),
        HttpOutcome::TransportFailed => Err(ErrorKind::TransportError),
        HttpOutcome::Undecodable => Err(ErrorKind::DecodingError),
        HttpOutcome::Delivered => match raw_status {
            Some(status) => classify_status(status),
            None => Err(ErrorKind::DecodingError),
        },
    }
}

/// Classify a decoded backend status string.
pub fn classify_status(status: &str) -> Result<(), ErrorKind> {
    if status == SUCCESS_STATUS {
        return Ok(());
    }
    let kind = STATUS_RULES
        .iter()
        .find(|(rule, _)| rule.matches(status))
        .map(|(_, kind)| *kind)
        .unwrap_or(UNRECOGNIZED_STATUS);
    Err(kind)
}

/// Check run before every submission: a missing or empty token never
/// reaches the backend.
pub fn preflight(session_token: Option<&str>) -> Result<(), ErrorKind> {
    match session_token {
        Some(token) if !token.is_empty() => Ok(()),
        _ => classify(None, HttpOutcome::NoSession),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_is_success() {
        assert_eq!(classify(Some("ok"), HttpOutcome::Delivered), Ok(()));
    }

    #[test]
    fn no_is_credential_invalid() {
        assert_eq!(
            classify(Some("no"), HttpOutcome::Delivered),
            Err(ErrorKind::CredentialInvalid)
        );
    }

    #[test]
    fn captcha_wording_is_captcha_invalid() {
        assert_eq!(
            classify_status("Invalid Captcha Code"),
            Err(ErrorKind::CaptchaInvalid)
        );
        assert_eq!(classify_status("CAPTCHA expired"), Err(ErrorKind::CaptchaInvalid));
        assert_eq!(classify_status("wrong captcha"), Err(ErrorKind::CaptchaInvalid));
    }

    #[test]
    fn unrecognised_status_is_terminal_credential_failure() {
        assert_eq!(
            classify_status("account locked"),
            Err(ErrorKind::CredentialInvalid)
        );
        assert_eq!(classify_status(""), Err(ErrorKind::CredentialInvalid));
    }

    #[test]
    fn status_matching_is_exact_for_ok_and_no() {
        assert_eq!(classify_status("OK"), Err(ErrorKind::CredentialInvalid));
        assert_eq!(classify_status(" ok"), Err(ErrorKind::CredentialInvalid));
        assert_eq!(classify_status("No"), Err(ErrorKind::CredentialInvalid));
        assert_eq!(classify_status("nope"), Err(ErrorKind::CredentialInvalid));
    }

    #[test]
    fn http_outcomes_take_precedence_over_status() {
        assert_eq!(
            classify(Some("ok"), HttpOutcome::TransportFailed),
            Err(ErrorKind::TransportError)
        );
        assert_eq!(
            classify(None, HttpOutcome::Undecodable),
            Err(ErrorKind::DecodingError)
        );
        assert_eq!(
            classify(None, HttpOutcome::NoSession),
            Err(ErrorKind::SessionMissing)
        );
        assert_eq!(
            classify(None, HttpOutcome::Delivered),
            Err(ErrorKind::DecodingError)
        );
    }

    #[test]
    fn preflight_rejects_missing_or_empty_token() {
        assert_eq!(preflight(None), Err(ErrorKind::SessionMissing));
        assert_eq!(preflight(Some("")), Err(ErrorKind::SessionMissing));
        assert_eq!(preflight(Some("abc123")), Ok(()));
    }
}
