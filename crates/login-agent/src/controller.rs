//! Login sequence driver.
//!
//! One call to [`LoginAttemptController::login`] runs a whole sequence:
//!
//! ```text
//! Idle → FetchingSession → Recognizing → Submitting → Succeeded
//!             ↑   ↺ (transport / no token, after delay)  │
//!             │              │ no guess                  │ captcha rejected
//!             └──────────────┴──────── Retrying ◄────────┘
//! ```
//!
//! Terminal failures stop the loop, reset the attempt count and fetch one
//! fresh CAPTCHA so the caller can try again by hand. Starting a new
//! sequence, or a manual refresh, cancels the one in flight; the newest
//! request always wins.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use recognition::{CaptchaSolver, SolveReport};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::HttpBackend;
use crate::classifier;
use crate::config::LoginConfig;
use crate::errors::{ErrorKind, RetryPolicy};
use crate::session::{
    CaptchaImage, CredentialSubmitter, Credentials, LoginAttempt, Session, SessionBroker,
    SessionContext, SubmitReply,
};
use crate::state_machine::{IllegalTransition, LoginState, StateMachine};
use crate::telemetry::{MetricsCollector, SequenceMetrics};

/// Above this many CAPTCHA retries messages stop quoting the exact count.
const SEVERAL_ATTEMPTS: u32 = 3;

// ── CaptchaReader ───────────────────────────────────────────────────────────

/// Turns CAPTCHA bytes into a guess.
#[async_trait]
pub trait CaptchaReader: Send + Sync {
    async fn read(&self, image: &[u8]) -> SolveReport;
}

#[async_trait]
impl CaptchaReader for CaptchaSolver {
    async fn read(&self, image: &[u8]) -> SolveReport {
        self.solve(image).await
    }
}

// ── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Wait before refetching after a transport or missing-session failure.
    pub transport_retry_delay: Duration,
    /// Session fetches allowed per sequence; `None` is unbounded.
    pub max_iterations: Option<u32>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            transport_retry_delay: Duration::from_secs(1),
            max_iterations: Some(64),
        }
    }
}

impl From<&LoginConfig> for ControllerConfig {
    fn from(config: &LoginConfig) -> Self {
        Self {
            transport_retry_delay: config.transport_retry_delay(),
            max_iterations: config.max_iterations(),
        }
    }
}

// ── Outcome ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum LoginOutcome {
    Succeeded {
        session: Session,
        /// CAPTCHA rejections before the accepted attempt.
        captcha_retries: u32,
    },
    Failed {
        kind: ErrorKind,
        /// CAPTCHA rejections before the terminal failure.
        attempt_number: u32,
        message: String,
        /// CAPTCHA fetched after the failure, if the fetch worked.
        refreshed: Option<CaptchaImage>,
    },
    /// Superseded by a newer login or refresh. Nothing further was sent.
    Cancelled { attempt_number: u32 },
    /// The session fetch budget ran out.
    Exhausted { iterations: u32, attempt_number: u32 },
}

impl LoginOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
            Self::Exhausted { .. } => "exhausted",
        }
    }

    /// CAPTCHA rejections counted by the sequence.
    pub fn attempt_number(&self) -> u32 {
        match self {
            Self::Succeeded {
                captcha_retries, ..
            } => *captcha_retries,
            Self::Failed { attempt_number, .. }
            | Self::Cancelled { attempt_number }
            | Self::Exhausted { attempt_number, .. } => *attempt_number,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::Succeeded {
                captcha_retries: 0, ..
            } => "Signed in.".to_string(),
            Self::Succeeded {
                captcha_retries, ..
            } if *captcha_retries > SEVERAL_ATTEMPTS => {
                "Signed in after several CAPTCHA attempts.".to_string()
            }
            Self::Succeeded {
                captcha_retries: 1, ..
            } => "Signed in after 1 CAPTCHA retry.".to_string(),
            Self::Succeeded {
                captcha_retries, ..
            } => format!("Signed in after {captcha_retries} CAPTCHA retries."),
            Self::Failed {
                message,
                attempt_number,
                ..
            } if *attempt_number > SEVERAL_ATTEMPTS => {
                format!("{message} (after several CAPTCHA attempts)")
            }
            Self::Failed { message, .. } => message.clone(),
            Self::Cancelled { .. } => "Login was replaced by a newer request.".to_string(),
            Self::Exhausted { .. } => {
                "Could not sign in after several attempts. Please try again later.".to_string()
            }
        }
    }
}

/// Outcome plus the metrics of the sequence that produced it.
#[derive(Debug)]
pub struct LoginReport {
    pub outcome: LoginOutcome,
    pub metrics: SequenceMetrics,
}

// ── Controller ──────────────────────────────────────────────────────────────

/// Everything owned by one running sequence.
struct Sequence {
    generation: u64,
    cancel: CancellationToken,
    machine: StateMachine,
    context: SessionContext,
    metrics: MetricsCollector,
}

impl Sequence {
    fn new(generation: u64, cancel: CancellationToken) -> Self {
        Self {
            generation,
            cancel,
            machine: StateMachine::new(),
            context: SessionContext::new(),
            metrics: MetricsCollector::new(generation),
        }
    }
}

pub struct LoginAttemptController {
    broker: Arc<dyn SessionBroker>,
    submitter: Arc<dyn CredentialSubmitter>,
    reader: Arc<dyn CaptchaReader>,
    config: ControllerConfig,
    generation: AtomicU64,
    active: Mutex<Option<(u64, CancellationToken)>>,
    /// Serialises fetches and submissions across sequences.
    backend_io: tokio::sync::Mutex<()>,
    state: watch::Sender<LoginState>,
}

impl LoginAttemptController {
    pub fn new(
        broker: Arc<dyn SessionBroker>,
        submitter: Arc<dyn CredentialSubmitter>,
        reader: Arc<dyn CaptchaReader>,
        config: ControllerConfig,
    ) -> Self {
        let (state, _) = watch::channel(LoginState::Idle);
        Self {
            broker,
            submitter,
            reader,
            config,
            generation: AtomicU64::new(0),
            active: Mutex::new(None),
            backend_io: tokio::sync::Mutex::new(()),
            state,
        }
    }

    /// Controller whose broker and submitter are the same HTTP backend.
    pub fn over_http(
        backend: Arc<HttpBackend>,
        reader: Arc<dyn CaptchaReader>,
        config: ControllerConfig,
    ) -> Self {
        Self::new(backend.clone(), backend, reader, config)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Watch state changes of the newest sequence.
    pub fn subscribe(&self) -> watch::Receiver<LoginState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LoginState {
        *self.state.borrow()
    }

    /// Run a login sequence to a terminal state.
    pub async fn login(&self, credentials: &Credentials) -> LoginReport {
        let (generation, cancel) = self.begin();
        let mut seq = Sequence::new(generation, cancel);
        info!(generation, username = %credentials.username(), "login sequence starting");

        let outcome = self.run(&mut seq, credentials).await;
        self.end(generation);
        if !seq.machine.is_terminal() {
            error!(generation, state = %seq.machine.current(), "login sequence ended outside a terminal state");
        }

        info!(
            generation,
            outcome = outcome.label(),
            elapsed_ms = seq.machine.elapsed_ms(),
            summary = %seq.machine.summary(),
            "login sequence finished"
        );
        let metrics = seq.metrics.finalize(
            outcome.label(),
            outcome.is_success(),
            outcome.attempt_number(),
            &seq.machine,
        );
        LoginReport { outcome, metrics }
    }

    /// Cancel any running sequence and fetch a new CAPTCHA.
    ///
    /// `None` if a newer login or refresh superseded this one before the
    /// fetch finished.
    pub async fn refresh(&self) -> Option<Result<CaptchaImage, ErrorKind>> {
        let (generation, cancel) = self.begin();
        info!(generation, "captcha refresh requested");
        self.publish(generation, LoginState::Idle);
        let result = guarded(&cancel, self.fetch()).await;
        self.end(generation);
        if result.is_none() {
            info!(generation, "captcha refresh superseded");
        }
        result
    }

    /// Cancel the running sequence, if any.
    pub fn cancel_active(&self) -> bool {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.take() {
            Some((generation, cancel)) => {
                info!(generation, "cancelling login sequence");
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn begin(&self) -> (u64, CancellationToken) {
        let cancel = CancellationToken::new();
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((previous, token)) = active.replace((generation, cancel.clone())) {
            debug!(previous, generation, "superseding in-flight sequence");
            token.cancel();
        }
        (generation, cancel)
    }

    fn end(&self, generation: u64) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*active, Some((current, _)) if current == generation) {
            *active = None;
        }
    }

    /// Only the newest sequence may publish.
    fn publish(&self, generation: u64, state: LoginState) {
        let _active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::SeqCst) == generation {
            self.state.send_replace(state);
        }
    }

    fn step(&self, seq: &mut Sequence, to: LoginState, reason: Option<&str>) {
        seq.machine.set_attempt(seq.context.attempt_number());
        let moved = seq.machine.advance(to, reason);
        self.settle(seq, moved);
    }

    fn settle(&self, seq: &Sequence, moved: Result<(), IllegalTransition>) {
        match moved {
            Ok(()) => self.publish(seq.generation, seq.machine.current()),
            Err(e) => {
                error!(generation = seq.generation, error = %e, "rejected login state transition")
            }
        }
    }

    fn finish_failed(&self, seq: &mut Sequence, reason: &str) {
        seq.machine.set_attempt(seq.context.attempt_number());
        let moved = seq.machine.fail(reason);
        self.settle(seq, moved);
    }

    async fn fetch(&self) -> Result<CaptchaImage, ErrorKind> {
        let _io = self.backend_io.lock().await;
        self.broker.fetch_fresh().await
    }

    async fn submit(&self, attempt: &LoginAttempt<'_>) -> SubmitReply {
        let _io = self.backend_io.lock().await;
        self.submitter.submit(attempt).await
    }

    async fn run(&self, seq: &mut Sequence, credentials: &Credentials) -> LoginOutcome {
        let delay = self.config.transport_retry_delay;
        self.step(seq, LoginState::FetchingSession, Some("login requested"));
        let mut iterations: u32 = 0;

        loop {
            if seq.cancel.is_cancelled() {
                return self.cancelled(seq);
            }
            if let Some(max) = self.config.max_iterations {
                if iterations >= max {
                    warn!(generation = seq.generation, iterations, "session fetch budget exhausted");
                    let attempt_number = seq.context.attempt_number();
                    self.finish_failed(seq, "iteration budget exhausted");
                    seq.context.reset();
                    return LoginOutcome::Exhausted {
                        iterations,
                        attempt_number,
                    };
                }
            }
            iterations += 1;

            // ── FetchingSession ──
            seq.metrics.record_fetch();
            let image = match guarded(&seq.cancel, self.fetch()).await {
                None => return self.cancelled(seq),
                Some(Ok(image)) => image,
                Some(Err(kind)) if kind.retry_policy() == RetryPolicy::AfterDelay => {
                    seq.metrics.record_retry(kind);
                    debug!(
                        generation = seq.generation,
                        %kind,
                        policy = %kind.retry_policy(),
                        delay_ms = delay.as_millis() as u64,
                        "session fetch failed, retrying after delay"
                    );
                    if guarded(&seq.cancel, tokio::time::sleep(delay)).await.is_none() {
                        return self.cancelled(seq);
                    }
                    self.step(seq, LoginState::FetchingSession, Some(kind.as_str()));
                    continue;
                }
                Some(Err(kind)) => return self.fail(seq, kind).await,
            };

            // ── Recognizing ──
            self.step(seq, LoginState::Recognizing, None);
            let read = guarded(&seq.cancel, self.reader.read(&image.bytes)).await;
            seq.context.install(image);
            let Some(report) = read else {
                return self.cancelled(seq);
            };
            seq.metrics.record_guess(&report);
            let Some(guess) = report.guess().map(str::to_string) else {
                debug!(
                    generation = seq.generation,
                    variants = report.variants.len(),
                    candidates = report.candidates.len(),
                    "no usable captcha guess, fetching a new one"
                );
                seq.context.discard();
                self.step(seq, LoginState::FetchingSession, Some("no usable guess"));
                continue;
            };

            // ── Submitting ──
            self.step(seq, LoginState::Submitting, None);
            let Some(session) = seq.context.session().cloned() else {
                return self.fail(seq, ErrorKind::SessionMissing).await;
            };
            if let Err(kind) = classifier::preflight(Some(session.token())) {
                warn!(generation = seq.generation, "refusing to submit without a session token");
                return self.fail(seq, kind).await;
            }

            let attempt = LoginAttempt {
                credentials,
                captcha_text: &guess,
                session: &session,
                attempt_number: seq.context.attempt_number(),
            };
            debug!(
                generation = seq.generation,
                attempt = attempt.attempt_number,
                guess = %guess,
                support = report.consensus.support_count,
                token = %session.redacted(),
                "submitting login"
            );
            let Some(reply) = guarded(&seq.cancel, self.submit(&attempt)).await else {
                return self.cancelled(seq);
            };
            seq.metrics.record_submission();
            // A session backs at most one submission.
            seq.context.discard();

            match reply.classify() {
                Ok(()) => {
                    let captcha_retries = seq.context.attempt_number();
                    self.step(seq, LoginState::Succeeded, None);
                    seq.context.reset();
                    info!(generation = seq.generation, captcha_retries, "login succeeded");
                    return LoginOutcome::Succeeded {
                        session,
                        captcha_retries,
                    };
                }
                Err(kind) => match kind.retry_policy() {
                    RetryPolicy::FreshCaptcha => {
                        let attempt = seq.context.record_captcha_rejection();
                        info!(
                            generation = seq.generation,
                            attempt,
                            guess = %guess,
                            "captcha rejected, retrying with a fresh one"
                        );
                        self.step(seq, LoginState::Retrying, Some(kind.as_str()));
                        self.step(seq, LoginState::FetchingSession, None);
                    }
                    RetryPolicy::AfterDelay => {
                        seq.metrics.record_retry(kind);
                        warn!(
                            generation = seq.generation,
                            %kind,
                            policy = %RetryPolicy::AfterDelay,
                            "submission failed, retrying after delay"
                        );
                        self.step(seq, LoginState::Retrying, Some(kind.as_str()));
                        if guarded(&seq.cancel, tokio::time::sleep(delay)).await.is_none() {
                            return self.cancelled(seq);
                        }
                        self.step(seq, LoginState::FetchingSession, None);
                    }
                    RetryPolicy::Terminal => return self.fail(seq, kind).await,
                },
            }
        }
    }

    fn cancelled(&self, seq: &mut Sequence) -> LoginOutcome {
        let attempt_number = seq.context.attempt_number();
        info!(generation = seq.generation, attempt_number, "login sequence cancelled");
        seq.machine.set_attempt(attempt_number);
        let moved = seq.machine.cancel();
        self.settle(seq, moved);
        seq.context.reset();
        LoginOutcome::Cancelled { attempt_number }
    }

    async fn fail(&self, seq: &mut Sequence, kind: ErrorKind) -> LoginOutcome {
        let attempt_number = seq.context.attempt_number();
        self.finish_failed(seq, kind.as_str());
        seq.context.reset();
        warn!(generation = seq.generation, %kind, attempt_number, "login failed");

        // One fresh CAPTCHA for a manual retry.
        seq.metrics.record_fetch();
        let refreshed = match guarded(&seq.cancel, self.fetch()).await {
            Some(Ok(image)) => Some(image),
            Some(Err(e)) => {
                warn!(generation = seq.generation, error = %e, "captcha refresh after failure failed");
                None
            }
            None => None,
        };

        LoginOutcome::Failed {
            kind,
            attempt_number,
            message: kind.user_message().to_string(),
            refreshed,
        }
    }
}

/// `None` if `cancel` fires before `fut` completes.
async fn guarded<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}
