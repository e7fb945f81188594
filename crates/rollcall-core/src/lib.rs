//! rollcall-core: image intake, quality checks and face matching primitives.
//!
//! With the `onnx` feature, SCRFD detection and ArcFace embedding run locally
//! via ONNX Runtime.

pub mod alignment;
pub mod analyzer;
#[cfg(feature = "onnx")]
pub mod detector;
pub mod payload;
pub mod quality;
#[cfg(feature = "onnx")]
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use analyzer::{AnalyzerError, FaceAnalyzer};
#[cfg(feature = "onnx")]
pub use analyzer::OnnxAnalyzer;
pub use payload::{ImageError, ImagePayload};
pub use quality::{QualityGate, QualityIssue, QualityVerdict};
pub use types::{
    nearest, BoundingBox, DistanceMetric, Embedding, GalleryEntry, MatchDecision, MatchPolicy,
    NearestMatch,
};

/// Default location of the ONNX model files.
pub fn default_model_dir() -> PathBuf {
    std::env::var("ROLLCALL_MODEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/rollcall/models"))
}
