//! Remote token matching: the provider detects and compares, we keep tokens.

use super::BackendMatch;
use crate::error::{BackendError, EnrollmentFailure};
use crate::provider::{DetectedFace, FaceProvider, ProviderError, ProviderImage};
use image::RgbImage;
use rollcall_core::payload;
use rollcall_core::ImagePayload;
use rollcall_store::{BackendArtifact, BackendKind, Store};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub struct RemoteBackend {
    store: Store,
    provider: Arc<dyn FaceProvider>,
    /// Compare scores must exceed this (0-100).
    threshold: f32,
    faceset_token: Option<String>,
    timeout: Duration,
}

impl RemoteBackend {
    pub fn new(
        store: Store,
        provider: Arc<dyn FaceProvider>,
        threshold: f32,
        faceset_token: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            threshold,
            faceset_token,
            timeout,
        }
    }

    pub fn provider(&self) -> &Arc<dyn FaceProvider> {
        &self.provider
    }

    pub fn faceset_token(&self) -> Option<&str> {
        self.faceset_token.as_deref()
    }

    async fn bounded<T>(
        &self,
        stage: &'static str,
        call: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, BackendError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::warn!(stage, timeout = ?self.timeout, "face provider timed out");
                Err(BackendError::Timeout {
                    stage,
                    after: self.timeout,
                })
            }
        }
    }

    /// Detect faces in a decoded image, sent as canonical PNG base64.
    pub async fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, BackendError> {
        let png = payload::encode_canonical(image)
            .map_err(|e| BackendError::Unavailable(format!("cannot encode image for provider: {e}")))?;
        let request = ProviderImage::Base64(ImagePayload::Binary(png).to_base64());
        self.bounded("provider detect", self.provider.detect(&request)).await
    }

    /// Detected faces, reusing `detected` when the caller already asked the provider.
    async fn faces(
        &self,
        image: &RgbImage,
        detected: Option<Vec<DetectedFace>>,
    ) -> Result<Vec<DetectedFace>, BackendError> {
        match detected {
            Some(faces) => Ok(faces),
            None => self.detect(image).await,
        }
    }

    pub async fn enroll_face(
        &self,
        person_id: &str,
        image: &Arc<RgbImage>,
        detected: Option<Vec<DetectedFace>>,
    ) -> Result<BackendArtifact, EnrollmentFailure> {
        let faces = self.faces(image, detected).await?;
        let Some(face) = faces.into_iter().next() else {
            return Err(EnrollmentFailure::NoFace);
        };

        if let Some(faceset) = &self.faceset_token {
            let tokens = [face.face_token.clone()];
            match self
                .bounded("faceset add", self.provider.add_to_faceset(faceset, &tokens))
                .await
            {
                Ok(added) => tracing::debug!(person = %person_id, added, "face token added to faceset"),
                // The token alone is enough for compare-based recognition.
                Err(e) => tracing::warn!(person = %person_id, error = %e, "could not add face token to faceset"),
            }
        }

        tracing::info!(person = %person_id, "face token issued");
        Ok(BackendArtifact::FaceToken(face.face_token))
    }

    pub async fn recognize_face(
        &self,
        image: &Arc<RgbImage>,
        detected: Option<Vec<DetectedFace>>,
    ) -> Result<BackendMatch, BackendError> {
        let faces = self.faces(image, detected).await?;
        let Some(query) = faces.into_iter().next() else {
            return Ok(BackendMatch::NoFace);
        };

        let stored = self.store.successful_artifacts(BackendKind::Remote).await?;
        let mut best: Option<(String, f32)> = None;
        let mut compared = 0usize;
        for candidate in &stored {
            let BackendArtifact::FaceToken(token) = &candidate.artifact else {
                continue;
            };
            let score = match self
                .bounded("provider compare", self.provider.compare(&query.face_token, token))
                .await
            {
                Ok(score) => score,
                Err(BackendError::Provider(e)) if !e.is_transport() => {
                    tracing::warn!(enrollment = %candidate.enrollment_id, error = %e, "skipping uncomparable token");
                    continue;
                }
                Err(e) => return Err(e),
            };
            compared += 1;
            tracing::debug!(person = %candidate.person_id, score, "provider compare");
            if best.as_ref().map_or(true, |(_, s)| score > *s) {
                best = Some((candidate.person_id.clone(), score));
            }
        }

        let Some((person_id, score)) = best else {
            tracing::info!(stored = stored.len(), "no comparable face tokens");
            return Ok(BackendMatch::NoCandidates);
        };
        if score > self.threshold {
            Ok(BackendMatch::Matched {
                person_id,
                confidence: (score / 100.0).clamp(0.0, 1.0),
                distance: None,
                lenient: false,
            })
        } else {
            tracing::info!(best = score, threshold = self.threshold, compared, "no token above threshold");
            Ok(BackendMatch::NoMatch { best_distance: None })
        }
    }

    pub async fn discard_artifact(&self, artifact: &BackendArtifact) -> Result<(), BackendError> {
        let (BackendArtifact::FaceToken(token), Some(faceset)) = (artifact, &self.faceset_token) else {
            return Ok(());
        };
        let removed = self
            .bounded(
                "faceset remove",
                self.provider.remove_from_faceset(faceset, std::slice::from_ref(token)),
            )
            .await?;
        tracing::info!(removed, "face token removed from faceset");
        Ok(())
    }
}
