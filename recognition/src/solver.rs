//! End-to-end CAPTCHA solving: preprocess, recognise, vote.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ensemble::{ConsensusResolver, ConsensusResult, RecognitionCandidate, RecognitionEnsemble};
use crate::preprocess::{ImagePreprocessor, VariantKind};
use crate::recognizer::TextRecognizer;

/// Everything one solve produced, for logging and telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveReport {
    /// Variants that were actually produced.
    pub variants: Vec<VariantKind>,
    pub candidates: Vec<RecognitionCandidate>,
    pub consensus: ConsensusResult,
    pub elapsed_ms: u64,
}

impl SolveReport {
    pub fn guess(&self) -> Option<&str> {
        self.consensus.text.as_deref()
    }
}

/// ImagePreprocessor -> RecognitionEnsemble -> ConsensusResolver.
#[derive(Clone)]
pub struct CaptchaSolver {
    preprocessor: Arc<ImagePreprocessor>,
    ensemble: RecognitionEnsemble,
    resolver: ConsensusResolver,
}

impl CaptchaSolver {
    pub fn new(
        preprocessor: ImagePreprocessor,
        ensemble: RecognitionEnsemble,
        resolver: ConsensusResolver,
    ) -> Self {
        Self {
            preprocessor: Arc::new(preprocessor),
            ensemble,
            resolver,
        }
    }

    /// Default transforms and resolver around `recognizer`.
    pub fn with_recognizer(recognizer: Arc<dyn TextRecognizer>) -> Self {
        Self::new(
            ImagePreprocessor::default(),
            RecognitionEnsemble::with_defaults(recognizer),
            ConsensusResolver::default(),
        )
    }

    pub async fn solve(&self, image: &[u8]) -> SolveReport {
        let started = Instant::now();

        // Pixel work stays off the async workers.
        let preprocessor = self.preprocessor.clone();
        let owned = image.to_vec();
        let variants = match tokio::task::spawn_blocking(move || preprocessor.variants(&owned))
            .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "preprocessing task failed");
                Vec::new()
            }
        };
        let kinds: Vec<VariantKind> = variants.iter().map(|v| v.kind).collect();

        let candidates = self.ensemble.recognize(variants).await;
        let consensus = self.resolver.resolve(&candidates);

        let report = SolveReport {
            variants: kinds,
            candidates,
            consensus,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        debug!(
            variants = report.variants.len(),
            candidates = report.candidates.len(),
            guess = ?report.guess(),
            elapsed_ms = report.elapsed_ms,
            "captcha solved"
        );
        report
    }
}
