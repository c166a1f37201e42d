//! Per-sequence metrics and JSONL telemetry.

use std::path::Path;
use std::time::Instant;

use recognition::{ConsensusBasis, SolveReport};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::ErrorKind;
use crate::state_machine::{LoginState, StateMachine, TransitionRecord};

/// What the ensemble made of one CAPTCHA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuessRecord {
    pub guess: Option<String>,
    pub support_count: usize,
    pub basis: ConsensusBasis,
    pub variants: usize,
    pub candidates: usize,
    pub elapsed_ms: u64,
}

impl From<&SolveReport> for GuessRecord {
    fn from(report: &SolveReport) -> Self {
        Self {
            guess: report.consensus.text.clone(),
            support_count: report.consensus.support_count,
            basis: report.consensus.basis,
            variants: report.variants.len(),
            candidates: report.candidates.len(),
            elapsed_ms: report.elapsed_ms,
        }
    }
}

/// Metrics for a complete login sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceMetrics {
    pub generation: u64,
    pub outcome: String,
    pub success: bool,
    pub captcha_retries: u32,
    pub fetches: u32,
    pub transport_retries: u32,
    pub session_missing_retries: u32,
    pub empty_recognitions: u32,
    pub submissions: u32,
    pub final_state: LoginState,
    pub elapsed_ms: u64,
    pub guesses: Vec<GuessRecord>,
    pub transitions: Vec<TransitionRecord>,
    pub timestamp: String,
}

/// Accumulates metrics while a sequence runs; `finalize()` at the end.
pub struct MetricsCollector {
    generation: u64,
    started: Instant,
    fetches: u32,
    transport_retries: u32,
    session_missing_retries: u32,
    empty_recognitions: u32,
    submissions: u32,
    guesses: Vec<GuessRecord>,
}

impl MetricsCollector {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            started: Instant::now(),
            fetches: 0,
            transport_retries: 0,
            session_missing_retries: 0,
            empty_recognitions: 0,
            submissions: 0,
            guesses: Vec::new(),
        }
    }

    pub fn record_fetch(&mut self) {
        self.fetches += 1;
    }

    /// Count a failure that sends the loop back to fetching.
    pub fn record_retry(&mut self, kind: ErrorKind) {
        match kind {
            ErrorKind::TransportError => self.transport_retries += 1,
            ErrorKind::SessionMissing => self.session_missing_retries += 1,
            _ => {}
        }
    }

    pub fn record_guess(&mut self, report: &SolveReport) {
        if report.consensus.is_none() {
            self.empty_recognitions += 1;
        }
        self.guesses.push(GuessRecord::from(report));
    }

    pub fn record_submission(&mut self) {
        self.submissions += 1;
    }

    pub fn finalize(
        self,
        outcome: &str,
        success: bool,
        captcha_retries: u32,
        machine: &StateMachine,
    ) -> SequenceMetrics {
        SequenceMetrics {
            generation: self.generation,
            outcome: outcome.to_string(),
            success,
            captcha_retries,
            fetches: self.fetches,
            transport_retries: self.transport_retries,
            session_missing_retries: self.session_missing_retries,
            empty_recognitions: self.empty_recognitions,
            submissions: self.submissions,
            final_state: machine.current(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            guesses: self.guesses,
            transitions: machine.transitions().to_vec(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Append one JSON line to `path`. Failures are logged, never raised.
pub fn append_telemetry(metrics: &SequenceMetrics, path: &Path) {
    match serde_json::to_string(metrics) {
        Ok(json) => {
            use std::io::Write;
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{json}") {
                        warn!("Failed to append telemetry: {e}");
                    } else {
                        info!(path = %path.display(), "Appended login telemetry");
                    }
                }
                Err(e) => warn!("Failed to open telemetry file: {e}"),
            }
        }
        Err(e) => warn!("Failed to serialize telemetry: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use recognition::ConsensusResult;

    use super::*;

    fn report(text: Option<&str>) -> SolveReport {
        SolveReport {
            variants: Vec::new(),
            candidates: Vec::new(),
            consensus: match text {
                Some(t) => ConsensusResult {
                    text: Some(t.into()),
                    support_count: 2,
                    basis: ConsensusBasis::Majority,
                },
                None => ConsensusResult::none(),
            },
            elapsed_ms: 7,
        }
    }

    #[test]
    fn test_collector_counts_events() {
        let mut collector = MetricsCollector::new(3);
        collector.record_fetch();
        collector.record_retry(ErrorKind::TransportError);
        collector.record_fetch();
        collector.record_retry(ErrorKind::SessionMissing);
        collector.record_fetch();
        collector.record_guess(&report(None));
        collector.record_fetch();
        collector.record_guess(&report(Some("AB12")));
        collector.record_submission();

        let mut machine = StateMachine::new();
        machine.advance(LoginState::FetchingSession, None).unwrap();

        let metrics = collector.finalize("succeeded", true, 0, &machine);
        assert_eq!(metrics.generation, 3);
        assert_eq!(metrics.fetches, 4);
        assert_eq!(metrics.transport_retries, 1);
        assert_eq!(metrics.session_missing_retries, 1);
        assert_eq!(metrics.empty_recognitions, 1);
        assert_eq!(metrics.submissions, 1);
        assert_eq!(metrics.guesses.len(), 2);
        assert_eq!(metrics.guesses[1].guess.as_deref(), Some("AB12"));
        assert_eq!(metrics.final_state, LoginState::FetchingSession);
        assert_eq!(metrics.transitions.len(), 1);
    }

    #[test]
    fn test_append_telemetry_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("login-telemetry.jsonl");
        let machine = StateMachine::new();

        let first = MetricsCollector::new(1).finalize("failed", false, 2, &machine);
        let second = MetricsCollector::new(2).finalize("succeeded", true, 0, &machine);
        append_telemetry(&first, &path);
        append_telemetry(&second, &path);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: SequenceMetrics = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.outcome, "failed");
        assert_eq!(parsed.captcha_retries, 2);
        let parsed: SequenceMetrics = serde_json::from_str(lines[1]).unwrap();
        assert!(parsed.success);
    }

    #[test]
    fn test_append_telemetry_to_missing_dir_does_not_panic() {
        let machine = StateMachine::new();
        let metrics = MetricsCollector::new(1).finalize("cancelled", false, 0, &machine);
        append_telemetry(&metrics, Path::new("/nonexistent/dir/telemetry.jsonl"));
    }
}
