//! [`TextRecognizer`] backed by the `tesseract` command-line engine.
//!
//! Tesseract ships as a binary; the image is piped over stdin and the text
//! read back from stdout.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::recognizer::{
    RankedText, RecognitionLevel, RecognitionOptions, RecognizerError, TextRecognizer,
};

/// Treat the image as a single line of text.
const PAGE_SEG_SINGLE_LINE: &str = "7";

pub struct TesseractRecognizer {
    bin: String,
}

impl TesseractRecognizer {
    pub fn new() -> Self {
        Self::with_binary("tesseract")
    }

    pub fn with_binary(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Command-line arguments for one call.
    pub fn args(&self, options: &RecognitionOptions) -> Vec<String> {
        let oem = match options.level {
            RecognitionLevel::Accurate => "1",
            RecognitionLevel::Fast => "3",
        };
        let mut args: Vec<String> = vec![
            "stdin".into(),
            "stdout".into(),
            "--oem".into(),
            oem.into(),
            "--psm".into(),
            PAGE_SEG_SINGLE_LINE.into(),
            "-l".into(),
            tesseract_languages(&options.languages),
        ];
        if !options.vocabulary.is_empty() {
            args.push("-c".into());
            args.push(format!("tessedit_char_whitelist={}", options.vocabulary));
        }
        if !options.auto_correction {
            for dawg in ["load_system_dawg=0", "load_freq_dawg=0"] {
                args.push("-c".into());
                args.push(dawg.into());
            }
        }
        args
    }
}

impl Default for TesseractRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextRecognizer for TesseractRecognizer {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    async fn recognize(
        &self,
        image: &[u8],
        options: &RecognitionOptions,
    ) -> Result<Vec<RankedText>, RecognizerError> {
        let mut child = Command::new(&self.bin)
            .args(self.args(options))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RecognizerError::Spawn)?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RecognizerError::Unavailable("stdin was not captured".into()))?;
        stdin.write_all(image).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(RecognizerError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let ranked = parse_output(&String::from_utf8_lossy(&output.stdout));
        debug!(lines = ranked.len(), "tesseract finished");
        Ok(ranked)
    }
}

/// One candidate per non-empty output line, in output order.
pub fn parse_output(stdout: &str) -> Vec<RankedText> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| RankedText::new(l, 1.0))
        .collect()
}

/// `en-US` style tags to tesseract's three-letter codes, `+`-joined.
fn tesseract_languages(tags: &[String]) -> String {
    let codes: Vec<&str> = tags
        .iter()
        .map(|tag| {
            let primary = tag.split(['-', '_']).next().unwrap_or(tag);
            match primary.to_ascii_lowercase().as_str() {
                "en" => "eng",
                "de" => "deu",
                "fr" => "fra",
                "zh" => "chi_sim",
                _ => primary,
            }
        })
        .collect();
    if codes.is_empty() {
        "eng".to_string()
    } else {
        codes.join("+")
    }
}
