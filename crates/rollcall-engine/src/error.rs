use crate::config::ConfigError;
use crate::provider::ProviderError;
use chrono::NaiveDate;
use rollcall_core::{AnalyzerError, ImageError, QualityIssue};
use rollcall_store::{DetectionStatus, StoreError};
use std::time::Duration;
use thiserror::Error;

/// Why a backend could not produce an enrollment artifact.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollmentFailure {
    #[error("no face detected")]
    NoFace,
    #[error("face provider error: {0}")]
    Provider(String),
    #[error("face analysis failed: {0}")]
    Analysis(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl EnrollmentFailure {
    /// Detection status recorded on the enrollment row.
    pub fn status(&self) -> DetectionStatus {
        match self {
            EnrollmentFailure::NoFace => DetectionStatus::NoFace,
            _ => DetectionStatus::Error,
        }
    }
}

/// Failures inside an identity backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },
    #[error("face analysis failed: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("face provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("corpus i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("representation cache error: {0}")]
    Cache(String),
}

impl BackendError {
    /// Whether the failure lies with the face service rather than local state.
    pub fn is_service_failure(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable(_) | BackendError::Analyzer(_) | BackendError::Provider(_)
        )
    }
}

impl From<BackendError> for EnrollmentFailure {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Timeout { after, .. } => EnrollmentFailure::Timeout(after),
            BackendError::Analyzer(AnalyzerError::NoFace) => EnrollmentFailure::NoFace,
            BackendError::Analyzer(e) => EnrollmentFailure::Analysis(e.to_string()),
            BackendError::Provider(e) => EnrollmentFailure::Provider(e.to_string()),
            BackendError::Unavailable(detail) => EnrollmentFailure::Provider(detail),
            other => EnrollmentFailure::Storage(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid image: {0}")]
    InvalidImage(#[from] ImageError),
    #[error("image rejected: {0}")]
    QualityRejected(QualityIssue),
    #[error("enrollment failed: {0}")]
    Enrollment(#[from] EnrollmentFailure),
    #[error("no image in the batch could be enrolled ({attempted} attempted)")]
    NothingEnrolled {
        attempted: usize,
        errors: Vec<String>,
    },
    #[error("identity backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("recognition timed out after {0:?}")]
    RecognitionTimeout(Duration),
    #[error("person {0} has no successful enrollment")]
    NotEnrolled(String),
    #[error("person not found: {0}")]
    PersonNotFound(String),
    #[error("class not found: {0}")]
    ClassNotFound(String),
    #[error("enrollment not found: {0}")]
    EnrollmentNotFound(String),
    #[error("attendance session for class {class_id} on {date} is closed")]
    SessionClosed { class_id: String, date: NaiveDate },
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("backend error: {0}")]
    Backend(BackendError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SessionClosed { class_id, date } => EngineError::SessionClosed { class_id, date },
            StoreError::NotFound { kind: "person", id } => EngineError::PersonNotFound(id),
            StoreError::NotFound { kind: "class", id } => EngineError::ClassNotFound(id),
            StoreError::NotFound { kind: "enrollment", id } => EngineError::EnrollmentNotFound(id),
            other => EngineError::Store(other),
        }
    }
}

impl From<BackendError> for EngineError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Timeout { after, .. } => EngineError::RecognitionTimeout(after),
            BackendError::Store(e) => e.into(),
            e if e.is_service_failure() => EngineError::BackendUnavailable(e.to_string()),
            other => EngineError::Backend(other),
        }
    }
}

impl EngineError {
    /// Failures that concern one image rather than the system; batch
    /// enrollment records them per item and moves on.
    pub fn is_item_failure(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidImage(_) | EngineError::QualityRejected(_) | EngineError::Enrollment(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_status() {
        assert_eq!(EnrollmentFailure::NoFace.status(), DetectionStatus::NoFace);
        assert_eq!(
            EnrollmentFailure::Timeout(Duration::from_secs(1)).status(),
            DetectionStatus::Error
        );
    }

    #[test]
    fn test_backend_timeout_maps_to_recognition_timeout() {
        let err: EngineError = BackendError::Timeout {
            stage: "embedding",
            after: Duration::from_secs(30),
        }
        .into();
        assert!(matches!(err, EngineError::RecognitionTimeout(d) if d == Duration::from_secs(30)));
    }

    #[test]
    fn test_store_not_found_maps_by_kind() {
        let err: EngineError = StoreError::NotFound {
            kind: "class",
            id: "c9".into(),
        }
        .into();
        assert!(matches!(err, EngineError::ClassNotFound(ref id) if id == "c9"));
    }

    #[test]
    fn test_no_face_analysis_is_no_face_failure() {
        let failure: EnrollmentFailure = BackendError::Analyzer(AnalyzerError::NoFace).into();
        assert_eq!(failure, EnrollmentFailure::NoFace);
    }
}
