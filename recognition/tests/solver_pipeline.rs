//! Full solve pipeline with an in-process recognizer: real image
//! preprocessing, fake OCR.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use recognition::{
    CaptchaSolver, ConsensusBasis, RankedText, RecognitionOptions, RecognizerError,
    TextRecognizer, VariantKind,
};

const WIDTH: u32 = 40;
const HEIGHT: u32 = 16;

fn captcha_png() -> Vec<u8> {
    let img = RgbImage::from_fn(WIDTH, HEIGHT, |x, _| {
        if x % 5 == 0 {
            Rgb([10, 10, 10])
        } else {
            Rgb([230, 220, 210])
        }
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// Reads the upscaled variant differently from the rest.
struct SizeSensitive {
    calls: AtomicUsize,
}

#[async_trait]
impl TextRecognizer for SizeSensitive {
    fn name(&self) -> &'static str {
        "size-sensitive"
    }

    async fn recognize(
        &self,
        image: &[u8],
        options: &RecognitionOptions,
    ) -> Result<Vec<RankedText>, RecognizerError> {
        assert!(!options.auto_correction);
        self.calls.fetch_add(1, Ordering::SeqCst);
        let decoded = image::load_from_memory(image)
            .map_err(|e| RecognizerError::Unavailable(e.to_string()))?;
        if decoded.width() > WIDTH {
            Ok(vec![RankedText::new("AB12", 0.9)])
        } else {
            Ok(vec![RankedText::new("x-y 9 9", 0.8), RankedText::new("XY98", 0.1)])
        }
    }
}

struct AlwaysDown;

#[async_trait]
impl TextRecognizer for AlwaysDown {
    fn name(&self) -> &'static str {
        "down"
    }

    async fn recognize(
        &self,
        _image: &[u8],
        _options: &RecognitionOptions,
    ) -> Result<Vec<RankedText>, RecognizerError> {
        Err(RecognizerError::Unavailable("service offline".into()))
    }
}

#[tokio::test]
async fn majority_of_variants_wins() {
    let recognizer = Arc::new(SizeSensitive {
        calls: AtomicUsize::new(0),
    });
    let solver = CaptchaSolver::with_recognizer(recognizer.clone());

    let report = solver.solve(&captcha_png()).await;

    assert_eq!(report.variants, VariantKind::ALL.to_vec());
    assert_eq!(recognizer.calls.load(Ordering::SeqCst), 4);
    assert_eq!(report.candidates.len(), 4);
    assert_eq!(report.candidates[3].variant, VariantKind::Upscaled2x);
    assert_eq!(report.candidates[3].text, "AB12");
    assert_eq!(report.guess(), Some("xy99"));
    assert_eq!(report.consensus.support_count, 3);
    assert_eq!(report.consensus.basis, ConsensusBasis::Majority);
}

#[tokio::test]
async fn undecodable_image_never_reaches_the_recognizer() {
    let recognizer = Arc::new(SizeSensitive {
        calls: AtomicUsize::new(0),
    });
    let solver = CaptchaSolver::with_recognizer(recognizer.clone());

    let report = solver.solve(b"<html>session expired</html>").await;

    assert!(report.variants.is_empty());
    assert!(report.candidates.is_empty());
    assert!(report.guess().is_none());
    assert_eq!(recognizer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn recognizer_outage_yields_no_guess() {
    let solver = CaptchaSolver::with_recognizer(Arc::new(AlwaysDown));
    let report = solver.solve(&captcha_png()).await;

    assert_eq!(report.variants.len(), 4);
    assert!(report.candidates.is_empty());
    assert_eq!(report.consensus.basis, ConsensusBasis::Empty);
}
