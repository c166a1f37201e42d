//! Multi-variant OCR ensemble.
//!
//! ```text
//!            ┌─────────── CaptchaImage bytes ───────────┐
//!            ▼                                          │
//!   ImagePreprocessor ─► [Identity, Contrast, Binary, Upscaled]
//!            │
//!            ▼
//!   RecognitionEnsemble (coordinator)
//!     JoinSet fan-out, one OCR call per variant, barrier join
//!            │
//!            ▼
//!   ConsensusResolver (voting)
//!     exact-length plurality, then first valid, then fallback
//! ```

pub mod coordinator;
pub mod voting;

pub use coordinator::{EnsembleConfig, RecognitionCandidate, RecognitionEnsemble};
pub use voting::{resolve, ConsensusBasis, ConsensusResolver, ConsensusResult};
