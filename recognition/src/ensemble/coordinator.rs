//! Concurrent OCR over every preprocessing variant.
//!
//! ```text
//! JoinSet::spawn(recognizer.recognize(variant_i)) x N
//!   -> join_next() until every task is done (barrier)
//!   -> keep the top-ranked read per variant
//!   -> sanitise, truncate, drop empties
//!   -> sort by dispatch order
//! ```
//!
//! A slow or failing variant never cancels the others. Failures, timeouts
//! and panics simply contribute no candidate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::preprocess::{ImageVariant, VariantKind};
use crate::recognizer::{RankedText, RecognitionOptions, RecognizerError, TextRecognizer};
use crate::text::{sanitize_truncated, MAX_CANDIDATE_LEN};

/// Default upper bound for a single OCR call.
const DEFAULT_VARIANT_TIMEOUT: Duration = Duration::from_secs(10);

/// A sanitised read of one variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognitionCandidate {
    pub text: String,
    pub variant: VariantKind,
}

impl RecognitionCandidate {
    pub fn new(text: impl Into<String>, variant: VariantKind) -> Self {
        Self {
            text: text.into(),
            variant,
        }
    }
}

/// Ensemble tuning.
#[derive(Debug, Clone)]
pub struct EnsembleConfig {
    pub options: RecognitionOptions,
    /// `None` waits for the recognizer indefinitely.
    pub variant_timeout: Option<Duration>,
    pub max_candidate_len: usize,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            options: RecognitionOptions::captcha(),
            variant_timeout: Some(DEFAULT_VARIANT_TIMEOUT),
            max_candidate_len: MAX_CANDIDATE_LEN,
        }
    }
}

/// Fans variants out to the recognizer and gathers candidates.
#[derive(Clone)]
pub struct RecognitionEnsemble {
    recognizer: Arc<dyn TextRecognizer>,
    config: EnsembleConfig,
}

impl RecognitionEnsemble {
    pub fn new(recognizer: Arc<dyn TextRecognizer>, config: EnsembleConfig) -> Self {
        Self { recognizer, config }
    }

    pub fn with_defaults(recognizer: Arc<dyn TextRecognizer>) -> Self {
        Self::new(recognizer, EnsembleConfig::default())
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Recognise all variants concurrently and return candidates in
    /// dispatch order. Returns only after every dispatched task finished.
    pub async fn recognize(&self, variants: Vec<ImageVariant>) -> Vec<RecognitionCandidate> {
        let options = Arc::new(self.config.options.clone());
        let timeout = self.config.variant_timeout;
        let started = Instant::now();
        let dispatched = variants.len();
        let mut join_set: JoinSet<(VariantKind, Result<Vec<RankedText>, RecognizerError>)> =
            JoinSet::new();

        debug!(engine = self.recognizer.name(), dispatched, "dispatching OCR");

        for variant in variants {
            let recognizer = self.recognizer.clone();
            let options = options.clone();

            join_set.spawn(async move {
                let call = recognizer.recognize(&variant.bytes, &options);
                let result = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, call).await {
                        Ok(result) => result,
                        Err(_) => Err(RecognizerError::Timeout(limit)),
                    },
                    None => call.await,
                };
                (variant.kind, result)
            });
        }

        let mut candidates = Vec::with_capacity(dispatched);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((kind, Ok(ranked))) => {
                    let Some(top) = ranked.into_iter().next() else {
                        debug!(variant = %kind, "no text read");
                        continue;
                    };
                    let text = sanitize_truncated(&top.text, self.config.max_candidate_len);
                    if text.is_empty() {
                        debug!(variant = %kind, raw = %top.text, "read had no usable characters");
                        continue;
                    }
                    debug!(variant = %kind, %text, confidence = top.confidence, "candidate");
                    candidates.push(RecognitionCandidate::new(text, kind));
                }
                Ok((kind, Err(e))) => {
                    warn!(variant = %kind, error = %e, "OCR call failed");
                }
                Err(e) => {
                    warn!(error = %e, "OCR task panicked");
                }
            }
        }

        candidates.sort_by_key(|c| c.variant);
        debug!(
            dispatched,
            collected = candidates.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "OCR barrier reached"
        );
        candidates
    }
}
