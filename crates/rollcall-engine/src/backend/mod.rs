//! Identity backends: a closed set chosen once from configuration.
//!
//! Every variant enrolls a face into a backend-specific artifact, recognizes a
//! face against the artifacts it produced, and applies the same quality gate.
//! Artifacts are tagged with their backend and never compared across backends.

mod corpus;
mod local;
mod remote;
mod vector;

pub use corpus::CorpusBackend;
pub use local::LocalAnalysis;
pub use remote::RemoteBackend;
pub use vector::VectorBackend;

use crate::config::Config;
use crate::error::{BackendError, EnrollmentFailure};
use crate::provider::{DetectedFace, FacePlusPlusClient, FaceProvider};
use image::RgbImage;
use rollcall_core::{FaceAnalyzer, QualityGate, QualityIssue, QualityVerdict};
use rollcall_store::{BackendArtifact, BackendKind, Store};
use serde::Serialize;
use std::sync::Arc;

/// What a backend concluded about a probe image.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BackendMatch {
    Matched {
        person_id: String,
        confidence: f32,
        distance: Option<f32>,
        /// Accepted only through the lenient fallback.
        lenient: bool,
    },
    /// Candidates existed but none was close enough.
    NoMatch { best_distance: Option<f32> },
    /// Nothing to compare against.
    NoCandidates,
    NoFace,
}

/// A quality verdict plus the provider detection it was based on.
///
/// Remote detection issues face tokens, so the enrollment or recognition that
/// follows a passed gate reuses `faces` instead of detecting again.
#[derive(Debug, Clone)]
pub struct Screening {
    pub verdict: QualityVerdict,
    pub(crate) faces: Option<Vec<DetectedFace>>,
}

impl Screening {
    fn rejected(issue: QualityIssue, faces: Option<Vec<DetectedFace>>) -> Self {
        Self {
            verdict: QualityVerdict::rejected(issue),
            faces,
        }
    }

    /// Provider faces to hand to the next backend call.
    pub fn detected(&self) -> Option<Vec<DetectedFace>> {
        self.faces.clone()
    }
}

pub enum IdentityBackend {
    Corpus(CorpusBackend),
    Vector(VectorBackend),
    Remote(RemoteBackend),
}

impl IdentityBackend {
    /// Build the configured backend.
    ///
    /// Local backends need an analyzer; the remote backend uses `provider` or
    /// else a Face++ client built from the configured credentials.
    pub fn from_config(
        config: &Config,
        store: Store,
        analyzer: Option<Arc<dyn FaceAnalyzer>>,
        provider: Option<Arc<dyn FaceProvider>>,
    ) -> Result<Self, BackendError> {
        let local = |analyzer: Option<Arc<dyn FaceAnalyzer>>| {
            analyzer
                .map(|a| LocalAnalysis::new(a, config.detect_timeout(), config.embed_timeout()))
                .ok_or_else(|| {
                    BackendError::Unavailable(format!(
                        "the {} backend needs a local face analyzer (build with the `onnx` feature)",
                        config.backend
                    ))
                })
        };

        let backend = match config.backend {
            BackendKind::Corpus => IdentityBackend::Corpus(CorpusBackend::new(
                config.corpus_dir(),
                store,
                local(analyzer)?,
                config.corpus.metric,
                config.corpus.policy(),
            )),
            BackendKind::Vector => IdentityBackend::Vector(VectorBackend::new(
                store,
                local(analyzer)?,
                config.vector.metric,
                config.vector.policy(),
            )),
            BackendKind::Remote => {
                let provider: Arc<dyn FaceProvider> = match provider {
                    Some(provider) => provider,
                    None => Arc::new(FacePlusPlusClient::new(
                        &config.remote.endpoint,
                        config.remote.api_key.as_deref(),
                        config.remote.api_secret.as_deref(),
                        config.remote_timeout(),
                    )?),
                };
                IdentityBackend::Remote(RemoteBackend::new(
                    store,
                    provider,
                    config.remote.threshold,
                    config.remote.faceset_token.clone(),
                    config.remote_timeout(),
                ))
            }
        };
        tracing::info!(backend = %backend.kind(), "identity backend ready");
        Ok(backend)
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            IdentityBackend::Corpus(_) => BackendKind::Corpus,
            IdentityBackend::Vector(_) => BackendKind::Vector,
            IdentityBackend::Remote(_) => BackendKind::Remote,
        }
    }

    /// Faces as seen by this backend's detector, with the provider's faces
    /// kept for reuse.
    async fn count_faces(&self, image: &Arc<RgbImage>) -> Result<(usize, Option<Vec<DetectedFace>>), BackendError> {
        match self {
            IdentityBackend::Corpus(b) => Ok((b.analysis().detect(image).await?.len(), None)),
            IdentityBackend::Vector(b) => Ok((b.analysis().detect(image).await?.len(), None)),
            IdentityBackend::Remote(b) => {
                let faces = b.detect(image).await?;
                Ok((faces.len(), Some(faces)))
            }
        }
    }

    /// Size, then exactly one face, then sharpness; stops at the first failure.
    pub async fn screen(&self, gate: &QualityGate, image: &Arc<RgbImage>) -> Result<Screening, BackendError> {
        if let Err(issue) = gate.check_dimensions(image) {
            return Ok(Screening::rejected(issue, None));
        }
        let (count, faces) = self.count_faces(image).await?;
        if let Err(issue) = gate.check_face_count(count) {
            return Ok(Screening::rejected(issue, faces));
        }
        Ok(Screening {
            verdict: gate.check_sharpness(image).into(),
            faces,
        })
    }

    pub async fn validate_image_quality(
        &self,
        gate: &QualityGate,
        image: &Arc<RgbImage>,
    ) -> Result<QualityVerdict, BackendError> {
        Ok(self.screen(gate, image).await?.verdict)
    }

    /// `detected` is the provider detection from a passed [`Screening`], if any.
    pub async fn enroll_face(
        &self,
        person_id: &str,
        image: &Arc<RgbImage>,
        enrollment_id: &str,
        detected: Option<Vec<DetectedFace>>,
    ) -> Result<BackendArtifact, EnrollmentFailure> {
        match self {
            IdentityBackend::Corpus(b) => b.enroll_face(person_id, image, enrollment_id).await,
            IdentityBackend::Vector(b) => b.enroll_face(image).await,
            IdentityBackend::Remote(b) => b.enroll_face(person_id, image, detected).await,
        }
    }

    pub async fn recognize_face(
        &self,
        image: &Arc<RgbImage>,
        detected: Option<Vec<DetectedFace>>,
    ) -> Result<BackendMatch, BackendError> {
        match self {
            IdentityBackend::Corpus(b) => b.recognize_face(image).await,
            IdentityBackend::Vector(b) => b.recognize_face(image).await,
            IdentityBackend::Remote(b) => b.recognize_face(image, detected).await,
        }
    }

    pub fn supports_cache_invalidation(&self) -> bool {
        matches!(self, IdentityBackend::Corpus(_))
    }

    pub async fn invalidate_cache(&self) -> Result<(), BackendError> {
        match self {
            IdentityBackend::Corpus(b) => b.invalidate_cache().await,
            _ => Ok(()),
        }
    }

    /// Remove what enrollment left outside the database (corpus file, faceset entry).
    pub async fn discard_artifact(&self, artifact: &BackendArtifact) -> Result<(), BackendError> {
        if artifact.backend() != self.kind() {
            tracing::debug!(
                artifact = %artifact.backend(),
                active = %self.kind(),
                "artifact belongs to another backend; leaving it"
            );
            return Ok(());
        }
        match self {
            IdentityBackend::Corpus(b) => b.discard_artifact(artifact).await,
            IdentityBackend::Vector(_) => Ok(()),
            IdentityBackend::Remote(b) => b.discard_artifact(artifact).await,
        }
    }

    pub fn as_corpus(&self) -> Option<&CorpusBackend> {
        match self {
            IdentityBackend::Corpus(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteBackend> {
        match self {
            IdentityBackend::Remote(b) => Some(b),
            _ => None,
        }
    }
}
