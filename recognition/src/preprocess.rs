//! OCR-friendly variants of a CAPTCHA image.
//!
//! Every CAPTCHA is fanned out into the same four variants, always in the
//! same order:
//!
//! ```text
//! Identity          original bytes, untouched
//! ContrastEnhanced  grayscale, contrast x1.5, brightness +0.1
//! Binarized         grayscale, thresholded at luminance 0.5
//! Upscaled2x        2x linear size, bicubic (Catmull-Rom) resampling
//! ```
//!
//! A variant that cannot be produced is logged and left out. Nothing is
//! produced at all when the source image does not decode.

use std::fmt;
use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Kind of preprocessing applied to a variant.
///
/// The derived ordering is the dispatch order, which the resolver relies on
/// for tie-breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    Identity,
    ContrastEnhanced,
    Binarized,
    #[serde(rename = "upscaled_2x")]
    Upscaled2x,
}

impl VariantKind {
    /// All kinds in dispatch order.
    pub const ALL: [VariantKind; 4] = [
        VariantKind::Identity,
        VariantKind::ContrastEnhanced,
        VariantKind::Binarized,
        VariantKind::Upscaled2x,
    ];
}

impl fmt::Display for VariantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => write!(f, "identity"),
            Self::ContrastEnhanced => write!(f, "contrast_enhanced"),
            Self::Binarized => write!(f, "binarized"),
            Self::Upscaled2x => write!(f, "upscaled_2x"),
        }
    }
}

/// One encoded image handed to the recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageVariant {
    pub kind: VariantKind,
    pub bytes: Vec<u8>,
}

/// Failure to produce a single variant.
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("image could not be decoded: {0}")]
    Decode(#[source] image::ImageError),

    #[error("variant could not be encoded: {0}")]
    Encode(#[source] image::ImageError),

    #[error("image has no pixels")]
    Empty,

    #[error("upscaled size overflows: {width}x{height}")]
    Dimensions { width: u32, height: u32 },
}

/// Default contrast multiplier for `ContrastEnhanced`.
const DEFAULT_CONTRAST: f32 = 1.5;
/// Default additive brightness for `ContrastEnhanced` (0..1 scale).
const DEFAULT_BRIGHTNESS: f32 = 0.1;
/// Default luminance threshold for `Binarized` (0..1 scale).
const DEFAULT_THRESHOLD: f32 = 0.5;
/// Linear scale factor for `Upscaled2x`.
const UPSCALE_FACTOR: u32 = 2;

/// Stateless image transforms producing OCR variants.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    pub contrast: f32,
    pub brightness: f32,
    pub threshold: f32,
    pub upscale_filter: FilterType,
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self {
            contrast: DEFAULT_CONTRAST,
            brightness: DEFAULT_BRIGHTNESS,
            threshold: DEFAULT_THRESHOLD,
            upscale_filter: FilterType::CatmullRom,
        }
    }
}

impl ImagePreprocessor {
    /// Produce every variant that can be built from `bytes`, in dispatch order.
    pub fn variants(&self, bytes: &[u8]) -> Vec<ImageVariant> {
        let source = match decode(bytes) {
            Ok(img) => img,
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "captcha image did not decode, no variants");
                return Vec::new();
            }
        };

        let mut out = Vec::with_capacity(VariantKind::ALL.len());
        for kind in VariantKind::ALL {
            match self.variant(kind, bytes, &source) {
                Ok(variant) => out.push(variant),
                Err(e) => warn!(variant = %kind, error = %e, "variant skipped"),
            }
        }
        debug!(produced = out.len(), "preprocessing done");
        out
    }

    /// Build one variant from an already decoded source image.
    pub fn variant(
        &self,
        kind: VariantKind,
        original: &[u8],
        source: &DynamicImage,
    ) -> Result<ImageVariant, PreprocessError> {
        let bytes = match kind {
            VariantKind::Identity => original.to_vec(),
            VariantKind::ContrastEnhanced => encode_png(&DynamicImage::ImageLuma8(
                self.contrast_enhanced(source),
            ))?,
            VariantKind::Binarized => {
                encode_png(&DynamicImage::ImageLuma8(self.binarized(source)))?
            }
            VariantKind::Upscaled2x => encode_png(&self.upscaled(source)?)?,
        };
        Ok(ImageVariant { kind, bytes })
    }

    /// Grayscale, then brightness and contrast adjusted around mid-gray.
    pub fn contrast_enhanced(&self, source: &DynamicImage) -> GrayImage {
        let mut gray = source.to_luma8();
        for px in gray.pixels_mut() {
            let l = f32::from(px.0[0]) / 255.0 + self.brightness;
            let l = (l - 0.5) * self.contrast + 0.5;
            px.0[0] = to_channel(l);
        }
        gray
    }

    /// Grayscale, then each pixel becomes black or white.
    pub fn binarized(&self, source: &DynamicImage) -> GrayImage {
        let mut gray = source.to_luma8();
        for px in gray.pixels_mut() {
            let l = f32::from(px.0[0]) / 255.0;
            px.0[0] = if l >= self.threshold { 255 } else { 0 };
        }
        gray
    }

    /// Twice the linear size using the configured resampling filter.
    pub fn upscaled(&self, source: &DynamicImage) -> Result<DynamicImage, PreprocessError> {
        let (width, height) = (source.width(), source.height());
        let (Some(w), Some(h)) = (
            width.checked_mul(UPSCALE_FACTOR),
            height.checked_mul(UPSCALE_FACTOR),
        ) else {
            return Err(PreprocessError::Dimensions { width, height });
        };
        Ok(source.resize_exact(w, h, self.upscale_filter))
    }
}

/// Variants with the default transform parameters.
pub fn variants(bytes: &[u8]) -> Vec<ImageVariant> {
    ImagePreprocessor::default().variants(bytes)
}

fn decode(bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
    let img = image::load_from_memory(bytes).map_err(PreprocessError::Decode)?;
    if img.width() == 0 || img.height() == 0 {
        return Err(PreprocessError::Empty);
    }
    Ok(img)
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, PreprocessError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(PreprocessError::Encode)?;
    Ok(buf)
}

fn to_channel(l: f32) -> u8 {
    (l.clamp(0.0, 1.0) * 255.0).round() as u8
}
