//! Image quality gate: minimum size, exactly one face, sharpness.
//!
//! Checks run in that order and stop at the first failure. Face counting is
//! supplied by the caller because it depends on which detector is active.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_MIN_SIDE: u32 = 100;
/// Laplacian variance below which an image counts as blurry.
pub const DEFAULT_MIN_SHARPNESS: f64 = 30.0;

/// Why an image was refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum QualityIssue {
    TooSmall { width: u32, height: u32 },
    NoFace,
    MultipleFaces { count: usize },
    TooBlurry { sharpness: f64 },
}

impl fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityIssue::TooSmall { .. } => f.write_str("image too small"),
            QualityIssue::NoFace => f.write_str("no face detected"),
            QualityIssue::MultipleFaces { .. } => f.write_str("multiple faces detected"),
            QualityIssue::TooBlurry { .. } => f.write_str("image too blurry"),
        }
    }
}

/// `(accepted, reason)` pair handed back to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    pub accepted: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<QualityIssue>,
}

impl QualityVerdict {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: "image quality is acceptable".into(),
            issue: None,
        }
    }

    pub fn rejected(issue: QualityIssue) -> Self {
        Self {
            accepted: false,
            reason: issue.to_string(),
            issue: Some(issue),
        }
    }
}

impl From<Result<(), QualityIssue>> for QualityVerdict {
    fn from(result: Result<(), QualityIssue>) -> Self {
        match result {
            Ok(()) => QualityVerdict::accepted(),
            Err(issue) => QualityVerdict::rejected(issue),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityGate {
    pub min_side: u32,
    pub min_sharpness: f64,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            min_side: DEFAULT_MIN_SIDE,
            min_sharpness: DEFAULT_MIN_SHARPNESS,
        }
    }
}

impl QualityGate {
    pub fn check_dimensions(&self, image: &RgbImage) -> Result<(), QualityIssue> {
        let (width, height) = image.dimensions();
        if width < self.min_side || height < self.min_side {
            return Err(QualityIssue::TooSmall { width, height });
        }
        Ok(())
    }

    pub fn check_face_count(&self, count: usize) -> Result<(), QualityIssue> {
        match count {
            0 => Err(QualityIssue::NoFace),
            1 => Ok(()),
            count => Err(QualityIssue::MultipleFaces { count }),
        }
    }

    pub fn check_sharpness(&self, image: &RgbImage) -> Result<(), QualityIssue> {
        let sharpness = laplacian_variance(image);
        tracing::debug!(sharpness, min = self.min_sharpness, "sharpness measured");
        if sharpness < self.min_sharpness {
            return Err(QualityIssue::TooBlurry { sharpness });
        }
        Ok(())
    }

    /// Run every check given an already known face count.
    pub fn evaluate(&self, image: &RgbImage, face_count: usize) -> Result<(), QualityIssue> {
        self.check_dimensions(image)?;
        self.check_face_count(face_count)?;
        self.check_sharpness(image)
    }
}

/// ITU-R BT.601 luma, the same weighting OpenCV uses for RGB→gray.
pub fn luma(image: &RgbImage) -> Vec<f64> {
    image
        .pixels()
        .map(|p| 0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64)
        .collect()
}

/// Variance of the 4-neighbour Laplacian of the luma image.
///
/// Borders are mirrored without repeating the edge pixel (reflect-101).
pub fn laplacian_variance(image: &RgbImage) -> f64 {
    let (w, h) = (image.width() as usize, image.height() as usize);
    if w == 0 || h == 0 {
        return 0.0;
    }
    let gray = luma(image);

    let reflect = |i: isize, n: usize| -> usize {
        if n == 1 {
            return 0;
        }
        let last = n as isize - 1;
        let mut i = i;
        if i < 0 {
            i = -i;
        }
        if i > last {
            i = 2 * last - i;
        }
        i.clamp(0, last) as usize
    };

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for y in 0..h as isize {
        for x in 0..w as isize {
            let at = |dx: isize, dy: isize| {
                gray[reflect(y + dy, h) * w + reflect(x + dx, w)]
            };
            let value = at(0, -1) + at(0, 1) + at(-1, 0) + at(1, 0) - 4.0 * at(0, 0);
            sum += value;
            sum_sq += value * value;
        }
    }

    let n = (w * h) as f64;
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}
