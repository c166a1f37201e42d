//! CAPTCHA recognition library
//!
//! Turns a CAPTCHA image into a single best-guess string:
//!
//! - [`preprocess`]: deterministic OCR-friendly image variants
//! - [`recognizer`]: contract with the external OCR engine
//! - [`ensemble`]: concurrent recognition over all variants plus consensus voting
//! - [`solver`]: the full pipeline behind one call
//! - [`tesseract`]: recognizer backed by the `tesseract` CLI

pub mod ensemble;
pub mod preprocess;
pub mod recognizer;
pub mod solver;
pub mod tesseract;
pub mod text;

pub use ensemble::{
    ConsensusBasis, ConsensusResolver, ConsensusResult, EnsembleConfig, RecognitionCandidate,
    RecognitionEnsemble,
};
pub use preprocess::{ImagePreprocessor, ImageVariant, PreprocessError, VariantKind};
pub use recognizer::{
    RankedText, RecognitionLevel, RecognitionOptions, RecognizerError, TextRecognizer,
};
pub use solver::{CaptchaSolver, SolveReport};
pub use tesseract::TesseractRecognizer;
