//! `AttendanceService`: the one entry point callers construct and hold.

use crate::attendance::{AttendanceEngine, AttendanceMark, AttendanceReport, AttendanceResult, CleanupReport};
use crate::backend::IdentityBackend;
use crate::config::Config;
use crate::enrollment::{BatchEnrollment, EnrollmentPipeline, RemovedEnrollment};
use crate::error::{BackendError, EngineError};
use crate::provider::{FaceProvider, FacesetDetail};
use crate::recognition::{RecognitionPipeline, RecognitionReport};
use chrono::NaiveDate;
use rollcall_core::{payload, FaceAnalyzer, ImagePayload, QualityGate, QualityVerdict};
use rollcall_store::{
    AttendanceSession, BackendKind, Class, EnrollmentRecord, MarkOutcome, MediaStore, NewClass, NewPerson, Person,
    Store,
};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct AttendanceService {
    config: Config,
    store: Store,
    backend: Arc<IdentityBackend>,
    gate: QualityGate,
    enrollment: EnrollmentPipeline,
    recognition: Arc<RecognitionPipeline>,
    attendance: AttendanceEngine,
}

impl AttendanceService {
    /// Assemble the service from already constructed parts.
    pub fn new(config: Config, store: Store, backend: IdentityBackend) -> Self {
        let backend = Arc::new(backend);
        let media = MediaStore::new(config.media_dir());
        let gate = config.quality_gate();
        let recognition = Arc::new(RecognitionPipeline::new(
            Arc::clone(&backend),
            gate,
            config.quality.gate_recognition,
        ));
        let enrollment = EnrollmentPipeline::new(store.clone(), media.clone(), Arc::clone(&backend), gate);
        let attendance = AttendanceEngine::new(
            store.clone(),
            media,
            Arc::clone(&recognition),
            config.attendance.cleanup_hours,
        );
        Self {
            config,
            store,
            backend,
            gate,
            enrollment,
            recognition,
            attendance,
        }
    }

    /// Open the database and build the configured backend.
    ///
    /// `provider` replaces the HTTP client for the remote backend.
    pub async fn open(config: Config, provider: Option<Arc<dyn FaceProvider>>) -> Result<Self, EngineError> {
        config.validate()?;
        let store = Store::open(config.db_path()).await?;
        let analyzer = local_analyzer(&config)?;
        let backend = IdentityBackend::from_config(&config, store.clone(), analyzer, provider)?;
        tracing::info!(
            backend = %backend.kind(),
            db = %config.db_path().display(),
            media = %config.media_dir().display(),
            "attendance service ready"
        );
        Ok(Self::new(config, store, backend))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    // Roster

    pub async fn create_person(&self, person: NewPerson) -> Result<Person, EngineError> {
        Ok(self.store.create_person(person).await?)
    }

    pub async fn create_class(&self, class: NewClass) -> Result<Class, EngineError> {
        Ok(self.store.create_class(class).await?)
    }

    pub async fn add_to_class(&self, class_id: &str, person_id: &str) -> Result<(), EngineError> {
        Ok(self.store.add_to_class(class_id, person_id).await?)
    }

    pub async fn remove_from_class(&self, class_id: &str, person_id: &str) -> Result<bool, EngineError> {
        Ok(self.store.remove_from_class(class_id, person_id).await?)
    }

    /// Look a class up by id, falling back to its code.
    pub async fn find_class(&self, id_or_code: &str) -> Result<Class, EngineError> {
        if let Some(class) = self.store.get_class(id_or_code).await? {
            return Ok(class);
        }
        self.store
            .get_class_by_code(id_or_code)
            .await?
            .ok_or_else(|| EngineError::ClassNotFound(id_or_code.to_string()))
    }

    // Enrollment

    pub async fn enroll(
        &self,
        person_id: &str,
        image: &ImagePayload,
        primary: bool,
    ) -> Result<EnrollmentRecord, EngineError> {
        self.enrollment.enroll(person_id, image, primary).await
    }

    pub async fn enroll_batch(
        &self,
        person_id: &str,
        images: &[ImagePayload],
        primary: bool,
    ) -> Result<BatchEnrollment, EngineError> {
        self.enrollment.enroll_batch(person_id, images, primary).await
    }

    pub async fn delete_enrollment(&self, enrollment_id: &str) -> Result<RemovedEnrollment, EngineError> {
        self.enrollment.delete_enrollment(enrollment_id).await
    }

    pub async fn primary_enrollment(&self, person_id: &str) -> Result<EnrollmentRecord, EngineError> {
        self.enrollment.primary_enrollment(person_id).await
    }

    pub async fn list_enrollments(&self, person_id: &str) -> Result<Vec<EnrollmentRecord>, EngineError> {
        self.enrollment.list_enrollments(person_id).await
    }

    /// The active backend's quality verdict for an image, without side effects.
    pub async fn validate_image(&self, image: &ImagePayload) -> Result<QualityVerdict, EngineError> {
        let image = Arc::new(payload::decode(image)?);
        Ok(self.backend.validate_image_quality(&self.gate, &image).await?)
    }

    // Recognition and attendance

    pub async fn recognize(&self, image: &ImagePayload) -> Result<RecognitionReport, EngineError> {
        self.recognition.recognize(image).await
    }

    pub async fn recognize_and_mark(
        &self,
        class_id: &str,
        date: NaiveDate,
        image: &ImagePayload,
        created_by: Option<&str>,
    ) -> Result<AttendanceResult, EngineError> {
        self.attendance
            .recognize_and_mark(class_id, date, image, created_by)
            .await
    }

    pub async fn mark_attendance(&self, mark: AttendanceMark) -> Result<MarkOutcome, EngineError> {
        self.attendance.mark_attendance(mark).await
    }

    pub async fn get_or_create_session(
        &self,
        class_id: &str,
        date: NaiveDate,
        created_by: Option<&str>,
    ) -> Result<AttendanceSession, EngineError> {
        self.attendance
            .get_or_create_session(class_id, date, created_by)
            .await
    }

    pub async fn end_session(&self, class_id: &str, date: NaiveDate) -> Result<AttendanceSession, EngineError> {
        self.attendance.end_session(class_id, date).await
    }

    pub async fn attendance_status(&self, class_id: &str, date: NaiveDate) -> Result<AttendanceReport, EngineError> {
        self.attendance.attendance_status(class_id, date).await
    }

    pub async fn run_stale_attendance_cleanup(
        &self,
        age_hours: Option<u64>,
        dry_run: bool,
    ) -> Result<CleanupReport, EngineError> {
        self.attendance
            .run_stale_attendance_cleanup(age_hours, dry_run)
            .await
    }

    pub fn attendance(&self) -> &AttendanceEngine {
        &self.attendance
    }

    // Backend maintenance

    /// Images per person in the corpus directory.
    pub async fn corpus_inventory(&self) -> Result<BTreeMap<String, usize>, EngineError> {
        let corpus = self
            .backend
            .as_corpus()
            .ok_or_else(|| EngineError::BackendUnavailable("the active backend has no corpus".into()))?;
        Ok(corpus.inventory().await?)
    }

    /// Drop the representation cache. Returns false when the backend keeps none.
    pub async fn clear_representation_cache(&self) -> Result<bool, EngineError> {
        if !self.backend.supports_cache_invalidation() {
            return Ok(false);
        }
        self.backend.invalidate_cache().await?;
        Ok(true)
    }

    fn remote_provider(&self) -> Result<&Arc<dyn FaceProvider>, EngineError> {
        self.backend
            .as_remote()
            .map(|remote| remote.provider())
            .ok_or_else(|| EngineError::BackendUnavailable("the active backend has no face provider".into()))
    }

    pub async fn create_faceset(&self, outer_id: Option<&str>) -> Result<String, EngineError> {
        let provider = self.remote_provider()?;
        let token = provider.create_faceset(outer_id).await.map_err(BackendError::from)?;
        tracing::info!(faceset = %token, "faceset created");
        Ok(token)
    }

    /// Details of `faceset_token`, or of the configured faceset.
    pub async fn faceset_detail(&self, faceset_token: Option<&str>) -> Result<FacesetDetail, EngineError> {
        let provider = self.remote_provider()?;
        let configured = self.backend.as_remote().and_then(|remote| remote.faceset_token());
        let token = faceset_token
            .or(configured)
            .ok_or_else(|| EngineError::BackendUnavailable("no faceset configured".into()))?;
        Ok(provider
            .faceset_detail(token)
            .await
            .map_err(BackendError::from)?)
    }
}

#[cfg(feature = "onnx")]
fn local_analyzer(config: &Config) -> Result<Option<Arc<dyn FaceAnalyzer>>, EngineError> {
    if config.backend == BackendKind::Remote {
        return Ok(None);
    }
    let analyzer = rollcall_core::OnnxAnalyzer::load(&config.model_dir)
        .map_err(|e| EngineError::BackendUnavailable(format!("cannot load face models: {e}")))?;
    Ok(Some(Arc::new(analyzer)))
}

#[cfg(not(feature = "onnx"))]
fn local_analyzer(config: &Config) -> Result<Option<Arc<dyn FaceAnalyzer>>, EngineError> {
    if config.backend != BackendKind::Remote {
        tracing::warn!(backend = %config.backend, "built without local face analysis");
    }
    Ok(None)
}
