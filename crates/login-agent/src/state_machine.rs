//! Login sequence state machine with legal transition guards.
//!
//! Every sequence starts at `Idle` and ends at `Succeeded`, `FailedTerminal`
//! or `Cancelled`. The controller calls `advance()` for each step; illegal
//! edges are rejected and every accepted edge lands in the transition log.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    /// No sequence running.
    Idle,
    /// Clearing cookies and downloading a CAPTCHA with a new session.
    FetchingSession,
    /// Running the OCR ensemble over the current CAPTCHA.
    Recognizing,
    /// Posting credentials and the CAPTCHA guess.
    Submitting,
    /// A retriable failure was classified; about to fetch again.
    Retrying,
    /// Backend accepted the login. Terminal.
    Succeeded,
    /// Non-retriable failure or budget exhausted. Terminal.
    FailedTerminal,
    /// Superseded by a newer sequence. Terminal.
    Cancelled,
}

impl LoginState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedTerminal | Self::Cancelled)
    }
}

impl fmt::Display for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::FetchingSession => write!(f, "FetchingSession"),
            Self::Recognizing => write!(f, "Recognizing"),
            Self::Submitting => write!(f, "Submitting"),
            Self::Retrying => write!(f, "Retrying"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::FailedTerminal => write!(f, "FailedTerminal"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// ```text
/// Idle            → FetchingSession
/// FetchingSession → FetchingSession (fetch failed, after delay) | Recognizing
/// Recognizing     → FetchingSession (no usable guess) | Submitting
/// Submitting      → Succeeded | Retrying
/// Retrying        → FetchingSession
/// any non-terminal → FailedTerminal | Cancelled
/// ```
fn is_legal_transition(from: LoginState, to: LoginState) -> bool {
    use LoginState::*;

    if matches!(to, FailedTerminal | Cancelled) && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Idle, FetchingSession)
            | (FetchingSession, FetchingSession)
            | (FetchingSession, Recognizing)
            | (Recognizing, FetchingSession)
            | (Recognizing, Submitting)
            | (Submitting, Succeeded)
            | (Submitting, Retrying)
            | (Retrying, FetchingSession)
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: LoginState,
    pub to: LoginState,
    /// CAPTCHA attempt number when the transition happened.
    pub attempt: u32,
    /// Milliseconds since the sequence started.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub from: LoginState,
    pub to: LoginState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal state transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// State of one login sequence plus its transition log.
pub struct StateMachine {
    current: LoginState,
    attempt: u32,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl StateMachine {
    /// Fresh machine at `Idle` with an empty log.
    pub fn new() -> Self {
        Self {
            current: LoginState::Idle,
            attempt: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    /// Current state.
    pub fn current(&self) -> LoginState {
        self.current
    }

    /// Set the attempt number stamped on subsequent transition records.
    pub fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    /// Move to `to`, recording the edge.
    ///
    /// Returns `Err` and leaves the state untouched if the edge is not in
    /// the legal transition table.
    pub fn advance(&mut self, to: LoginState, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        let record = TransitionRecord {
            from: self.current,
            to,
            attempt: self.attempt,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        };

        tracing::debug!(
            from = %self.current,
            to = %to,
            attempt = self.attempt,
            reason = reason.unwrap_or(""),
            "Login state transition"
        );

        self.transitions.push(record);
        self.current = to;
        Ok(())
    }

    /// Move to `FailedTerminal`. Always legal from non-terminal states.
    pub fn fail(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(LoginState::FailedTerminal, Some(reason))
    }

    /// Move to `Cancelled` after a newer sequence took over. Always legal
    /// from non-terminal states.
    pub fn cancel(&mut self) -> Result<(), IllegalTransition> {
        self.advance(LoginState::Cancelled, Some("superseded"))
    }

    /// Whether the sequence has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Milliseconds since the machine was created.
    pub fn elapsed_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    /// Full transition log, oldest first.
    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// One-line summary for log output.
    pub fn summary(&self) -> String {
        let states: Vec<String> = self.transitions.iter().map(|t| t.to.to_string()).collect();
        format!(
            "{} → {} ({}ms, {} transitions)",
            LoginState::Idle,
            self.current,
            self.created_at.elapsed().as_millis(),
            self.transitions.len(),
        ) + if states.is_empty() {
            String::new()
        } else {
            format!(" [{}]", states.join(" → "))
        }
        .as_str()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(state: LoginState) -> StateMachine {
        StateMachine {
            current: state,
            attempt: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    #[test]
    fn test_initial_state() {
        let sm = StateMachine::new();
        assert_eq!(sm.current(), LoginState::Idle);
        assert!(!sm.is_terminal());
        assert!(sm.transitions().is_empty());
    }

    #[test]
    fn test_first_try_success() {
        let mut sm = StateMachine::new();
        sm.advance(LoginState::FetchingSession, None).unwrap();
        sm.advance(LoginState::Recognizing, None).unwrap();
        sm.advance(LoginState::Submitting, Some("guess AB12")).unwrap();
        sm.advance(LoginState::Succeeded, None).unwrap();

        assert!(sm.is_terminal());
        assert_eq!(sm.transitions().len(), 4);
    }

    #[test]
    fn test_captcha_retry_loop() {
        let mut sm = StateMachine::new();
        sm.advance(LoginState::FetchingSession, None).unwrap();
        sm.advance(LoginState::Recognizing, None).unwrap();
        sm.advance(LoginState::Submitting, None).unwrap();
        sm.advance(LoginState::Retrying, Some("captcha_invalid")).unwrap();
        sm.set_attempt(1);
        sm.advance(LoginState::FetchingSession, None).unwrap();
        sm.advance(LoginState::Recognizing, None).unwrap();
        sm.advance(LoginState::Submitting, None).unwrap();
        sm.advance(LoginState::Succeeded, None).unwrap();

        assert_eq!(sm.transitions().len(), 8);
        assert_eq!(sm.transitions()[4].attempt, 1);
    }

    #[test]
    fn test_fetch_retry_and_empty_guess_loop_back() {
        let mut sm = StateMachine::new();
        sm.advance(LoginState::FetchingSession, None).unwrap();
        sm.advance(LoginState::FetchingSession, Some("transport_error"))
            .unwrap();
        sm.advance(LoginState::Recognizing, None).unwrap();
        sm.advance(LoginState::FetchingSession, Some("no usable guess"))
            .unwrap();
        assert_eq!(sm.current(), LoginState::FetchingSession);
    }

    #[test]
    fn test_failure_and_cancel_from_any_state() {
        for state in [
            LoginState::Idle,
            LoginState::FetchingSession,
            LoginState::Recognizing,
            LoginState::Submitting,
            LoginState::Retrying,
        ] {
            let mut sm = at(state);
            assert!(sm.fail("test failure").is_ok());
            assert_eq!(sm.current(), LoginState::FailedTerminal);

            let mut sm = at(state);
            assert!(sm.cancel().is_ok());
            assert_eq!(sm.current(), LoginState::Cancelled);
            assert!(sm.is_terminal());
        }
    }

    #[test]
    fn test_cannot_transition_from_terminal() {
        for state in [
            LoginState::Succeeded,
            LoginState::FailedTerminal,
            LoginState::Cancelled,
        ] {
            let mut sm = at(state);
            let err = sm.advance(LoginState::FetchingSession, None).unwrap_err();
            assert_eq!(err.from, state);
            assert!(sm.fail("nope").is_err());
            assert!(sm.cancel().is_err());
        }
    }

    #[test]
    fn test_cannot_submit_without_recognizing() {
        let mut sm = StateMachine::new();
        sm.advance(LoginState::FetchingSession, None).unwrap();
        let err = sm.advance(LoginState::Submitting, None).unwrap_err();
        assert_eq!(err.from, LoginState::FetchingSession);
        assert_eq!(err.to, LoginState::Submitting);
    }

    #[test]
    fn test_retry_only_after_submission() {
        let mut sm = StateMachine::new();
        sm.advance(LoginState::FetchingSession, None).unwrap();
        assert!(sm.advance(LoginState::Retrying, None).is_err());
        assert!(sm.advance(LoginState::Succeeded, None).is_err());
    }

    #[test]
    fn test_transition_record_serde_roundtrip() {
        let record = TransitionRecord {
            from: LoginState::Submitting,
            to: LoginState::Retrying,
            attempt: 3,
            elapsed_ms: 12345,
            reason: Some("captcha_invalid".into()),
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"from\":\"submitting\""));
        let restored: TransitionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.to, LoginState::Retrying);
        assert_eq!(restored.attempt, 3);
    }

    #[test]
    fn test_summary() {
        let mut sm = StateMachine::new();
        sm.advance(LoginState::FetchingSession, None).unwrap();
        sm.fail("test").unwrap();
        let summary = sm.summary();
        assert!(summary.contains("FailedTerminal"));
        assert!(summary.contains("2 transitions"));
    }
}
