//! Recognition: optional soft quality gate, backend search, bounded retry.

use crate::backend::{BackendMatch, IdentityBackend};
use crate::error::{BackendError, EngineError};
use image::RgbImage;
use rollcall_core::{payload, ImagePayload, QualityGate, QualityIssue};
use serde::Serialize;
use std::sync::Arc;

/// Searches per request: the first, plus one after a cache rebuild.
const MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecognitionOutcome {
    Matched { person_id: String, confidence: f32 },
    NoMatch { confidence: f32 },
    /// The image was refused before or during search.
    Rejected { reason: String },
    BackendUnavailable { detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionReport {
    #[serde(flatten)]
    pub outcome: RecognitionOutcome,
    /// Backend searches performed.
    pub attempts: u32,
    /// Distance of the best candidate, for distance-based backends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    pub lenient: bool,
}

impl RecognitionReport {
    fn new(outcome: RecognitionOutcome, attempts: u32) -> Self {
        Self {
            outcome,
            attempts,
            distance: None,
            lenient: false,
        }
    }

    /// `(person, confidence)` when the image was matched.
    pub fn matched(&self) -> Option<(&str, f32)> {
        match &self.outcome {
            RecognitionOutcome::Matched { person_id, confidence } => Some((person_id.as_str(), *confidence)),
            _ => None,
        }
    }
}

pub struct RecognitionPipeline {
    backend: Arc<IdentityBackend>,
    gate: QualityGate,
    soft_gate: bool,
}

impl RecognitionPipeline {
    pub fn new(backend: Arc<IdentityBackend>, gate: QualityGate, soft_gate: bool) -> Self {
        Self {
            backend,
            gate,
            soft_gate,
        }
    }

    pub async fn recognize(&self, image: &ImagePayload) -> Result<RecognitionReport, EngineError> {
        let image = Arc::new(payload::decode(image)?);
        self.recognize_image(&image).await
    }

    /// Identify the face in an already decoded image. No side effects.
    pub async fn recognize_image(&self, image: &Arc<RgbImage>) -> Result<RecognitionReport, EngineError> {
        let mut detected = None;
        if self.soft_gate {
            match self.backend.screen(&self.gate, image).await {
                Ok(screening) if !screening.verdict.accepted => {
                    tracing::info!(reason = %screening.verdict.reason, "recognition image rejected");
                    return Ok(RecognitionReport::new(
                        RecognitionOutcome::Rejected {
                            reason: screening.verdict.reason,
                        },
                        0,
                    ));
                }
                Ok(screening) => detected = screening.faces,
                Err(e) => return fold_failure(e, 0),
            }
        }

        let mut attempts = 0;
        let found = loop {
            attempts += 1;
            let found = match self.backend.recognize_face(image, detected.clone()).await {
                Ok(found) => found,
                Err(e) => return fold_failure(e, attempts),
            };
            if found == BackendMatch::NoCandidates
                && attempts < MAX_ATTEMPTS
                && self.backend.supports_cache_invalidation()
            {
                tracing::info!(attempt = attempts, "no candidates; rebuilding representation cache and retrying");
                if let Err(e) = self.backend.invalidate_cache().await {
                    return fold_failure(e, attempts);
                }
                continue;
            }
            break found;
        };

        let report = match found {
            BackendMatch::Matched {
                person_id,
                confidence,
                distance,
                lenient,
            } => {
                tracing::info!(person = %person_id, confidence, attempts, "face recognized");
                RecognitionReport {
                    outcome: RecognitionOutcome::Matched { person_id, confidence },
                    attempts,
                    distance,
                    lenient,
                }
            }
            BackendMatch::NoMatch { best_distance } => RecognitionReport {
                distance: best_distance,
                ..RecognitionReport::new(RecognitionOutcome::NoMatch { confidence: 0.0 }, attempts)
            },
            BackendMatch::NoCandidates => {
                tracing::info!(attempts, "no enrolled faces to compare against");
                RecognitionReport::new(RecognitionOutcome::NoMatch { confidence: 0.0 }, attempts)
            }
            BackendMatch::NoFace => RecognitionReport::new(
                RecognitionOutcome::Rejected {
                    reason: QualityIssue::NoFace.to_string(),
                },
                attempts,
            ),
        };
        Ok(report)
    }
}

/// Service failures become an outcome; timeouts and local faults stay errors.
fn fold_failure(err: BackendError, attempts: u32) -> Result<RecognitionReport, EngineError> {
    match err {
        BackendError::Timeout { after, .. } => Err(EngineError::RecognitionTimeout(after)),
        e if e.is_service_failure() => {
            tracing::warn!(error = %e, "identity backend unavailable");
            Ok(RecognitionReport::new(
                RecognitionOutcome::BackendUnavailable { detail: e.to_string() },
                attempts,
            ))
        }
        other => Err(other.into()),
    }
}
