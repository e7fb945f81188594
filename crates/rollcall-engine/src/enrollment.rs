//! Enrollment: quality gate, backend artifact, canonical image, record.

use crate::backend::IdentityBackend;
use crate::error::{BackendError, EngineError, EnrollmentFailure};
use image::RgbImage;
use rollcall_core::{payload, ImagePayload, QualityGate};
use rollcall_store::{BackendArtifact, EnrollmentRecord, MediaStore, Store};
use serde::Serialize;
use std::sync::Arc;

/// One image of a batch that could not be enrolled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchEnrollment {
    pub enrolled: Vec<EnrollmentRecord>,
    pub failures: Vec<BatchFailure>,
}

/// Removed enrollment and, if it held the flag, the record promoted to primary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemovedEnrollment {
    pub record: EnrollmentRecord,
    pub promoted: Option<String>,
}

pub struct EnrollmentPipeline {
    store: Store,
    media: MediaStore,
    backend: Arc<IdentityBackend>,
    gate: QualityGate,
}

/// A timed-out analysis during enrollment is an enrollment failure, not a
/// recognition timeout.
fn enrollment_error(err: BackendError) -> EngineError {
    match err {
        BackendError::Timeout { after, .. } => EngineError::Enrollment(EnrollmentFailure::Timeout(after)),
        other => other.into(),
    }
}

impl EnrollmentPipeline {
    pub fn new(store: Store, media: MediaStore, backend: Arc<IdentityBackend>, gate: QualityGate) -> Self {
        Self {
            store,
            media,
            backend,
            gate,
        }
    }

    /// Enroll one image for `person_id`.
    ///
    /// Nothing is persisted when the image fails to decode or fails the quality
    /// gate. Once the pending row exists every failure is recorded on it.
    pub async fn enroll(
        &self,
        person_id: &str,
        image: &ImagePayload,
        requested_primary: bool,
    ) -> Result<EnrollmentRecord, EngineError> {
        if self.store.get_person(person_id).await?.is_none() {
            return Err(EngineError::PersonNotFound(person_id.to_string()));
        }
        let image = Arc::new(payload::decode(image)?);

        let screening = self
            .backend
            .screen(&self.gate, &image)
            .await
            .map_err(enrollment_error)?;
        if let Some(issue) = screening.verdict.issue.clone() {
            tracing::info!(person = %person_id, reason = %issue, "enrollment image rejected");
            return Err(EngineError::QualityRejected(issue));
        }

        let pending = self
            .store
            .insert_pending_enrollment(person_id, self.backend.kind())
            .await?;

        let artifact = match self
            .backend
            .enroll_face(person_id, &image, &pending.id, screening.detected())
            .await
        {
            Ok(artifact) => artifact,
            Err(failure) => {
                self.store
                    .fail_enrollment(&pending.id, failure.status(), &failure.to_string())
                    .await?;
                return Err(failure.into());
            }
        };

        match self.persist(&pending, &image, artifact.clone(), requested_primary).await {
            Ok(record) => {
                tracing::debug!(person = %person_id, enrollment = %record.id, "canonical image stored");
                Ok(record)
            }
            Err(err) => {
                if let Err(e) = self.backend.discard_artifact(&artifact).await {
                    tracing::warn!(enrollment = %pending.id, error = %e, "could not discard backend artifact");
                }
                let failure = EnrollmentFailure::Storage(err.to_string());
                if let Err(e) = self
                    .store
                    .fail_enrollment(&pending.id, failure.status(), &failure.to_string())
                    .await
                {
                    tracing::warn!(enrollment = %pending.id, error = %e, "could not record enrollment failure");
                }
                Err(failure.into())
            }
        }
    }

    /// Save the canonical image and complete the pending row.
    async fn persist(
        &self,
        pending: &EnrollmentRecord,
        image: &RgbImage,
        artifact: BackendArtifact,
        requested_primary: bool,
    ) -> Result<EnrollmentRecord, EngineError> {
        let png = payload::encode_canonical(image)?;
        let reference = self
            .media
            .save_enrollment_image(&pending.person_id, &pending.id, &png)
            .await?;
        match self
            .store
            .complete_enrollment(&pending.id, artifact, Some(reference.clone()), requested_primary)
            .await
        {
            Ok(record) => Ok(record),
            Err(e) => {
                if let Err(remove) = self.media.remove(&reference).await {
                    tracing::warn!(image = %reference, error = %remove, "could not remove enrollment image");
                }
                Err(e.into())
            }
        }
    }

    /// Enroll several images independently.
    ///
    /// A requested primary goes to the first image that succeeds. Fails with
    /// `NothingEnrolled` when no image could be enrolled; errors that are not
    /// about a single image abort the batch.
    pub async fn enroll_batch(
        &self,
        person_id: &str,
        images: &[ImagePayload],
        requested_primary: bool,
    ) -> Result<BatchEnrollment, EngineError> {
        let mut batch = BatchEnrollment {
            enrolled: Vec::new(),
            failures: Vec::new(),
        };
        for (index, image) in images.iter().enumerate() {
            let primary = requested_primary && batch.enrolled.is_empty();
            match self.enroll(person_id, image, primary).await {
                Ok(record) => batch.enrolled.push(record),
                Err(e) if e.is_item_failure() => {
                    tracing::info!(person = %person_id, index, error = %e, "batch image not enrolled");
                    batch.failures.push(BatchFailure {
                        index,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        if batch.enrolled.is_empty() {
            return Err(EngineError::NothingEnrolled {
                attempted: images.len(),
                errors: batch.failures.into_iter().map(|f| f.reason).collect(),
            });
        }
        tracing::info!(
            person = %person_id,
            enrolled = batch.enrolled.len(),
            failed = batch.failures.len(),
            "batch enrollment finished"
        );
        Ok(batch)
    }

    /// Delete an enrollment together with its image and backend artifact.
    pub async fn delete_enrollment(&self, enrollment_id: &str) -> Result<RemovedEnrollment, EngineError> {
        let deleted = self
            .store
            .delete_enrollment(enrollment_id)
            .await?
            .ok_or_else(|| EngineError::EnrollmentNotFound(enrollment_id.to_string()))?;

        if let Some(reference) = &deleted.record.image_path {
            if !self.media.remove(reference).await? {
                tracing::debug!(image = %reference, "enrollment image already gone");
            }
        }
        if let Some(artifact) = &deleted.record.artifact {
            self.backend.discard_artifact(artifact).await?;
        }
        Ok(RemovedEnrollment {
            record: deleted.record,
            promoted: deleted.promoted,
        })
    }

    pub async fn primary_enrollment(&self, person_id: &str) -> Result<EnrollmentRecord, EngineError> {
        if self.store.get_person(person_id).await?.is_none() {
            return Err(EngineError::PersonNotFound(person_id.to_string()));
        }
        self.store
            .primary_enrollment(person_id)
            .await?
            .ok_or_else(|| EngineError::NotEnrolled(person_id.to_string()))
    }

    pub async fn list_enrollments(&self, person_id: &str) -> Result<Vec<EnrollmentRecord>, EngineError> {
        Ok(self.store.list_enrollments(person_id).await?)
    }
}
