//! Plurality vote over OCR candidates.
//!
//! Resolution order:
//!
//! 1. Keep candidates whose sanitised text is exactly [`CAPTCHA_LEN`] long.
//! 2. If any remain, the most frequent one wins when it occurs more than
//!    once. Otherwise the first of them wins.
//! 3. With no exact-length candidate, fall back to the first candidate that
//!    has any alphanumeric character, sanitised and cut to `CAPTCHA_LEN`.
//! 4. Otherwise there is no guess.
//!
//! "First" always means dispatch order (Identity, ContrastEnhanced,
//! Binarized, Upscaled2x), so callers must pass candidates in that order.
//! Exact-length agreement beats a single read of the wrong length.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ensemble::coordinator::RecognitionCandidate;
use crate::text::{sanitize, sanitize_truncated, CAPTCHA_LEN};

/// Which rule produced the guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusBasis {
    /// An exact-length string seen more than once.
    Majority,
    /// Exact-length reads all disagreed; earliest one taken.
    FirstValid,
    /// No exact-length read; earliest usable read cut to length.
    Fallback,
    /// Nothing usable.
    Empty,
}

/// The resolved guess.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub text: Option<String>,
    /// How many candidates agreed on `text`.
    pub support_count: usize,
    pub basis: ConsensusBasis,
}

impl ConsensusResult {
    pub fn none() -> Self {
        Self {
            text: None,
            support_count: 0,
            basis: ConsensusBasis::Empty,
        }
    }

    pub fn is_none(&self) -> bool {
        self.text.is_none()
    }
}

/// Deterministic resolver over candidates in dispatch order.
#[derive(Debug, Clone)]
pub struct ConsensusResolver {
    expected_len: usize,
}

impl Default for ConsensusResolver {
    fn default() -> Self {
        Self {
            expected_len: CAPTCHA_LEN,
        }
    }
}

impl ConsensusResolver {
    pub fn new(expected_len: usize) -> Self {
        Self { expected_len }
    }

    pub fn resolve(&self, candidates: &[RecognitionCandidate]) -> ConsensusResult {
        let exact: Vec<String> = candidates
            .iter()
            .map(|c| sanitize(&c.text))
            .filter(|t| t.chars().count() == self.expected_len)
            .collect();

        if !exact.is_empty() {
            // (text, count) in first-seen order; strict `>` keeps the
            // earliest entry on ties.
            let mut tally: Vec<(&str, usize)> = Vec::new();
            for text in &exact {
                match tally.iter_mut().find(|(t, _)| *t == text.as_str()) {
                    Some((_, n)) => *n += 1,
                    None => tally.push((text.as_str(), 1)),
                }
            }

            let mut best = tally[0];
            for entry in &tally[1..] {
                if entry.1 > best.1 {
                    best = *entry;
                }
            }

            let result = if best.1 > 1 {
                ConsensusResult {
                    text: Some(best.0.to_string()),
                    support_count: best.1,
                    basis: ConsensusBasis::Majority,
                }
            } else {
                ConsensusResult {
                    text: Some(exact[0].clone()),
                    support_count: 1,
                    basis: ConsensusBasis::FirstValid,
                }
            };
            debug!(
                exact = exact.len(),
                support = result.support_count,
                basis = ?result.basis,
                "consensus"
            );
            return result;
        }

        let fallback = candidates
            .iter()
            .map(|c| sanitize_truncated(&c.text, self.expected_len))
            .find(|t| !t.is_empty());

        match fallback {
            Some(text) => {
                debug!(%text, "no exact-length read, using fallback");
                ConsensusResult {
                    text: Some(text),
                    support_count: 1,
                    basis: ConsensusBasis::Fallback,
                }
            }
            None => {
                debug!(candidates = candidates.len(), "no usable candidate");
                ConsensusResult::none()
            }
        }
    }
}

/// Resolve with the backend's CAPTCHA length.
pub fn resolve(candidates: &[RecognitionCandidate]) -> ConsensusResult {
    ConsensusResolver::default().resolve(candidates)
}
