//! Runtime configuration.
//!
//! Precedence, highest first: command-line flags, `LOGIN_*` environment
//! variables, the TOML file passed with `--config`, built-in defaults.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use recognition::{
    CaptchaSolver, ConsensusResolver, EnsembleConfig, ImagePreprocessor, RecognitionEnsemble,
    RecognitionOptions, TesseractRecognizer,
};
use serde::{Deserialize, Serialize};

pub const ENV_BACKEND_URL: &str = "LOGIN_BACKEND_URL";
pub const ENV_SESSION_COOKIE: &str = "LOGIN_SESSION_COOKIE";
pub const ENV_MAX_ITERATIONS: &str = "LOGIN_MAX_ITERATIONS";
pub const ENV_RETRY_DELAY_MS: &str = "LOGIN_RETRY_DELAY_MS";
pub const ENV_TESSERACT_BIN: &str = "LOGIN_TESSERACT_BIN";
pub const ENV_USERNAME: &str = "LOGIN_USERNAME";
pub const ENV_PASSWORD: &str = "LOGIN_PASSWORD";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    /// Base URL the endpoint paths are resolved against.
    pub backend_url: String,
    /// CAPTCHA image endpoint; its response sets the session cookie.
    pub captcha_path: String,
    /// Credential submission endpoint.
    pub login_path: String,
    /// Name of the session cookie.
    pub session_cookie: String,
    pub request_timeout_ms: u64,
    /// Delay before retrying after a transport or missing-session failure.
    pub transport_retry_delay_ms: u64,
    /// Session fetches allowed per login sequence. 0 means unbounded.
    pub max_iterations: u32,
    pub ocr: OcrConfig,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8080/".into(),
            captcha_path: "login_key.php".into(),
            login_path: "login.php".into(),
            session_cookie: "PHPSESSID".into(),
            request_timeout_ms: 15_000,
            transport_retry_delay_ms: 1_000,
            max_iterations: 64,
            ocr: OcrConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub tesseract_bin: String,
    /// Per-variant recognition timeout. 0 disables the timeout.
    pub variant_timeout_ms: u64,
    pub languages: Vec<String>,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            tesseract_bin: "tesseract".into(),
            variant_timeout_ms: 10_000,
            languages: vec!["en-US".into()],
        }
    }
}

impl LoginConfig {
    /// Defaults, overlaid with `path` if given, overlaid with the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
        let config: LoginConfig =
            toml::from_str(&content).context("Failed to parse login config TOML")?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `LOGIN_*` overrides from any lookup. Unset or empty values are
    /// skipped; unparseable numbers are an error.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_BACKEND_URL) {
            self.backend_url = url;
        }
        if let Some(name) = get(ENV_SESSION_COOKIE) {
            self.session_cookie = name;
        }
        if let Some(raw) = get(ENV_MAX_ITERATIONS) {
            self.max_iterations = raw
                .trim()
                .parse()
                .context(format!("{ENV_MAX_ITERATIONS} must be a non-negative integer"))?;
        }
        if let Some(raw) = get(ENV_RETRY_DELAY_MS) {
            self.transport_retry_delay_ms = raw
                .trim()
                .parse()
                .context(format!("{ENV_RETRY_DELAY_MS} must be milliseconds"))?;
        }
        if let Some(bin) = get(ENV_TESSERACT_BIN) {
            self.ocr.tesseract_bin = bin;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn transport_retry_delay(&self) -> Duration {
        Duration::from_millis(self.transport_retry_delay_ms)
    }

    pub fn max_iterations(&self) -> Option<u32> {
        (self.max_iterations > 0).then_some(self.max_iterations)
    }

    pub fn ensemble_config(&self) -> EnsembleConfig {
        EnsembleConfig {
            options: RecognitionOptions {
                languages: self.ocr.languages.clone(),
                ..RecognitionOptions::captcha()
            },
            variant_timeout: (self.ocr.variant_timeout_ms > 0)
                .then(|| Duration::from_millis(self.ocr.variant_timeout_ms)),
            ..EnsembleConfig::default()
        }
    }

    /// Tesseract-backed solver built from the `ocr` section.
    pub fn build_solver(&self) -> CaptchaSolver {
        let recognizer = Arc::new(TesseractRecognizer::with_binary(&self.ocr.tesseract_bin));
        CaptchaSolver::new(
            ImagePreprocessor::default(),
            RecognitionEnsemble::new(recognizer, self.ensemble_config()),
            ConsensusResolver::default(),
        )
    }
}
