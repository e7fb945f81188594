//! Local face analysis on the blocking pool, bounded by timeouts.

use crate::error::BackendError;
use image::RgbImage;
use rollcall_core::{AnalyzerError, BoundingBox, Embedding, FaceAnalyzer};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct LocalAnalysis {
    analyzer: Arc<dyn FaceAnalyzer>,
    detect_timeout: Duration,
    embed_timeout: Duration,
}

impl LocalAnalysis {
    pub fn new(analyzer: Arc<dyn FaceAnalyzer>, detect_timeout: Duration, embed_timeout: Duration) -> Self {
        Self {
            analyzer,
            detect_timeout,
            embed_timeout,
        }
    }

    pub fn model_version(&self) -> &str {
        self.analyzer.model_version()
    }

    async fn run<T, F>(&self, stage: &'static str, limit: Duration, work: F) -> Result<T, BackendError>
    where
        F: FnOnce(&dyn FaceAnalyzer) -> Result<T, AnalyzerError> + Send + 'static,
        T: Send + 'static,
    {
        let analyzer = Arc::clone(&self.analyzer);
        let task = tokio::task::spawn_blocking(move || work(analyzer.as_ref()));
        match tokio::time::timeout(limit, task).await {
            Err(_) => {
                tracing::warn!(stage, timeout = ?limit, "face analysis timed out");
                Err(BackendError::Timeout { stage, after: limit })
            }
            Ok(Err(join)) => Err(BackendError::Unavailable(format!("{stage} task failed: {join}"))),
            Ok(Ok(result)) => Ok(result?),
        }
    }

    pub async fn detect(&self, image: &Arc<RgbImage>) -> Result<Vec<BoundingBox>, BackendError> {
        let image = Arc::clone(image);
        self.run("detection", self.detect_timeout, move |a| a.detect(&image))
            .await
    }

    /// Embedding of the most confident face, or `None` when there is no face.
    pub async fn embed_primary(&self, image: &Arc<RgbImage>) -> Result<Option<Embedding>, BackendError> {
        let faces = self.detect(image).await?;
        let Some(face) = faces
            .into_iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        else {
            return Ok(None);
        };
        let image = Arc::clone(image);
        let embedding = self
            .run("embedding", self.embed_timeout, move |a| a.embed(&image, &face))
            .await?;
        Ok(Some(embedding))
    }
}
