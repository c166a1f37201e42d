//! Contract with the external text-recognition capability.
//!
//! The OCR engine itself is not part of this crate. Anything that can turn
//! one image into a ranked list of strings implements [`TextRecognizer`];
//! the ensemble only ever talks to this trait.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::text::CAPTCHA_VOCABULARY;

/// Recognition accuracy level requested from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionLevel {
    Accurate,
    Fast,
}

/// Knobs passed to every OCR call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognitionOptions {
    pub level: RecognitionLevel,
    /// BCP-47 language tags, most preferred first.
    pub languages: Vec<String>,
    /// Dictionary-based correction. Must stay off for CAPTCHA tokens, it
    /// rewrites random strings into nearby words.
    pub auto_correction: bool,
    /// Characters the engine should bias towards.
    pub vocabulary: String,
}

impl RecognitionOptions {
    /// Accurate, English, no auto-correction, `[a-zA-Z0-9]` only.
    pub fn captcha() -> Self {
        Self {
            level: RecognitionLevel::Accurate,
            languages: vec!["en-US".to_string()],
            auto_correction: false,
            vocabulary: CAPTCHA_VOCABULARY.to_string(),
        }
    }
}

impl Default for RecognitionOptions {
    fn default() -> Self {
        Self::captcha()
    }
}

/// One string read by the engine with its confidence (0.0–1.0).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedText {
    pub text: String,
    pub confidence: f32,
}

impl RankedText {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Failure of a single OCR call.
#[derive(Debug, Error)]
pub enum RecognizerError {
    #[error("failed to start recognizer: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("recognizer I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("recognizer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("recognizer timed out after {0:?}")]
    Timeout(Duration),

    #[error("recognizer unavailable: {0}")]
    Unavailable(String),
}

/// External OCR capability.
///
/// Implementations return candidates best-first; the ensemble keeps only
/// the first one.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    /// Short engine name for logs.
    fn name(&self) -> &'static str;

    async fn recognize(
        &self,
        image: &[u8],
        options: &RecognitionOptions,
    ) -> Result<Vec<RankedText>, RecognizerError>;
}
