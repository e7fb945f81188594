//! Direct comparison against embeddings stored on enrollment rows.

use super::local::LocalAnalysis;
use super::BackendMatch;
use crate::error::{BackendError, EnrollmentFailure};
use image::RgbImage;
use rollcall_core::{nearest, DistanceMetric, Embedding, GalleryEntry, MatchDecision, MatchPolicy};
use rollcall_store::{BackendArtifact, BackendKind, Store};
use std::sync::Arc;

pub struct VectorBackend {
    store: Store,
    analysis: LocalAnalysis,
    metric: DistanceMetric,
    policy: MatchPolicy,
}

impl VectorBackend {
    pub fn new(store: Store, analysis: LocalAnalysis, metric: DistanceMetric, policy: MatchPolicy) -> Self {
        Self {
            store,
            analysis,
            metric,
            policy,
        }
    }

    pub(crate) fn analysis(&self) -> &LocalAnalysis {
        &self.analysis
    }

    pub async fn enroll_face(&self, image: &Arc<RgbImage>) -> Result<BackendArtifact, EnrollmentFailure> {
        match self.analysis.embed_primary(image).await? {
            Some(embedding) => Ok(BackendArtifact::Embedding(embedding.values)),
            None => Err(EnrollmentFailure::NoFace),
        }
    }

    pub async fn recognize_face(&self, image: &Arc<RgbImage>) -> Result<BackendMatch, BackendError> {
        let Some(probe) = self.analysis.embed_primary(image).await? else {
            return Ok(BackendMatch::NoFace);
        };

        let gallery: Vec<GalleryEntry> = self
            .store
            .successful_artifacts(BackendKind::Vector)
            .await?
            .into_iter()
            .filter_map(|stored| match stored.artifact {
                BackendArtifact::Embedding(values) => Some(GalleryEntry {
                    person_id: stored.person_id,
                    source: stored.enrollment_id,
                    embedding: Embedding::new(values),
                }),
                _ => None,
            })
            .collect();

        let Some(best) = nearest(&probe, &gallery, self.metric) else {
            return Ok(BackendMatch::NoCandidates);
        };
        tracing::debug!(
            person = %best.person_id,
            distance = best.distance,
            compared = best.candidates,
            "nearest stored embedding"
        );

        Ok(match self.policy.decide(best.distance) {
            MatchDecision::Accepted {
                confidence,
                distance,
                lenient,
            } => {
                if lenient {
                    tracing::warn!(person = %best.person_id, distance, "accepted by lenient fallback");
                }
                BackendMatch::Matched {
                    person_id: best.person_id,
                    confidence,
                    distance: Some(distance),
                    lenient,
                }
            }
            MatchDecision::Rejected { distance } => BackendMatch::NoMatch {
                best_distance: Some(distance),
            },
        })
    }
}
