//! The seam between the identity backends and whatever finds and embeds faces.

use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("face detection failed: {0}")]
    Detector(String),
    #[error("face embedding failed: {0}")]
    Recognizer(String),
    #[error("no face detected")]
    NoFace,
    #[error("analyzer state poisoned by a panicked inference call")]
    Poisoned,
}

/// Local face detection and embedding.
///
/// Implementations are synchronous and CPU-bound; async callers run them on the
/// blocking pool.
pub trait FaceAnalyzer: Send + Sync {
    /// All faces in the image, most confident first.
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, AnalyzerError>;

    /// Embedding of one detected face.
    fn embed(&self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, AnalyzerError>;

    /// Identifier of the embedding model, used to key persisted caches.
    fn model_version(&self) -> &str;

    /// Embed the most confident face in the image.
    fn embed_primary(&self, image: &RgbImage) -> Result<Embedding, AnalyzerError> {
        let faces = self.detect(image)?;
        let face = faces
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .ok_or(AnalyzerError::NoFace)?;
        self.embed(image, face)
    }
}

#[cfg(feature = "onnx")]
mod onnx {
    use super::{AnalyzerError, FaceAnalyzer};
    use crate::detector::{DetectorError, FaceDetector};
    use crate::recognizer::{FaceRecognizer, RecognizerError, ARCFACE_MODEL_VERSION};
    use crate::types::{BoundingBox, Embedding};
    use image::RgbImage;
    use std::path::Path;
    use std::sync::Mutex;

    pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
    pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

    impl From<DetectorError> for AnalyzerError {
        fn from(e: DetectorError) -> Self {
            AnalyzerError::Detector(e.to_string())
        }
    }

    impl From<RecognizerError> for AnalyzerError {
        fn from(e: RecognizerError) -> Self {
            AnalyzerError::Recognizer(e.to_string())
        }
    }

    /// SCRFD + ArcFace behind mutexes (ONNX sessions need `&mut` to run).
    pub struct OnnxAnalyzer {
        detector: Mutex<FaceDetector>,
        recognizer: Mutex<FaceRecognizer>,
    }

    impl OnnxAnalyzer {
        /// Load both models from `model_dir`.
        pub fn load(model_dir: &Path) -> Result<Self, AnalyzerError> {
            let det_path = model_dir.join(DETECTOR_MODEL_FILE);
            let rec_path = model_dir.join(RECOGNIZER_MODEL_FILE);
            let detector = FaceDetector::load(&det_path.to_string_lossy())?;
            let recognizer = FaceRecognizer::load(&rec_path.to_string_lossy())?;
            tracing::info!(dir = %model_dir.display(), "face models loaded");
            Ok(Self {
                detector: Mutex::new(detector),
                recognizer: Mutex::new(recognizer),
            })
        }
    }

    impl FaceAnalyzer for OnnxAnalyzer {
        fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, AnalyzerError> {
            let mut detector = self.detector.lock().map_err(|_| AnalyzerError::Poisoned)?;
            Ok(detector.detect(image)?)
        }

        fn embed(&self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, AnalyzerError> {
            let mut recognizer = self.recognizer.lock().map_err(|_| AnalyzerError::Poisoned)?;
            Ok(recognizer.extract(image, face)?)
        }

        fn model_version(&self) -> &str {
            ARCFACE_MODEL_VERSION
        }
    }
}

#[cfg(feature = "onnx")]
pub use onnx::{OnnxAnalyzer, DETECTOR_MODEL_FILE, RECOGNIZER_MODEL_FILE};

#[cfg(test)]
mod tests {
    use super::*;

    struct TwoFaces;

    impl FaceAnalyzer for TwoFaces {
        fn detect(&self, _image: &RgbImage) -> Result<Vec<BoundingBox>, AnalyzerError> {
            let face = |x: f32, confidence: f32| BoundingBox {
                x,
                y: 0.0,
                width: 10.0,
                height: 10.0,
                confidence,
                landmarks: None,
            };
            Ok(vec![face(0.0, 0.6), face(50.0, 0.9)])
        }

        fn embed(&self, _image: &RgbImage, face: &BoundingBox) -> Result<Embedding, AnalyzerError> {
            Ok(Embedding::new(vec![face.x]))
        }

        fn model_version(&self) -> &str {
            "two-faces"
        }
    }

    struct Blind;

    impl FaceAnalyzer for Blind {
        fn detect(&self, _image: &RgbImage) -> Result<Vec<BoundingBox>, AnalyzerError> {
            Ok(Vec::new())
        }

        fn embed(&self, _image: &RgbImage, _face: &BoundingBox) -> Result<Embedding, AnalyzerError> {
            unreachable!("no face to embed")
        }

        fn model_version(&self) -> &str {
            "blind"
        }
    }

    #[test]
    fn test_embed_primary_picks_most_confident() {
        let embedding = TwoFaces.embed_primary(&RgbImage::new(4, 4)).unwrap();
        assert_eq!(embedding.values, vec![50.0]);
    }

    #[test]
    fn test_embed_primary_without_face() {
        assert!(matches!(
            Blind.embed_primary(&RgbImage::new(4, 4)),
            Err(AnalyzerError::NoFace)
        ));
    }
}
