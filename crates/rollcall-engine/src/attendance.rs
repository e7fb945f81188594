//! Attendance sessions and marking, manual and recognition-driven.

use crate::error::EngineError;
use crate::recognition::{RecognitionOutcome, RecognitionPipeline};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rollcall_core::{payload, ImagePayload};
use rollcall_store::{
    AttendanceRecord, AttendanceSession, AttendanceStatus, MarkMode, MarkOutcome, MarkRequest, MediaStore, Store,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// A mark entered by hand rather than by recognition.
#[derive(Debug, Clone)]
pub struct AttendanceMark {
    pub person_id: String,
    pub class_id: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub confidence: Option<f32>,
    pub notes: Option<String>,
    pub created_by: Option<String>,
}

impl AttendanceMark {
    pub fn new(person_id: &str, class_id: &str, date: NaiveDate, status: AttendanceStatus) -> Self {
        Self {
            person_id: person_id.to_string(),
            class_id: class_id.to_string(),
            date,
            status,
            confidence: None,
            notes: None,
            created_by: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkStatus {
    Marked,
    /// Already present or late today; nothing was written.
    AlreadyMarked,
    /// Recognized, but not on the class roster.
    PolicyRejected,
    NotRecognized,
    /// The image was refused by the quality gate.
    Rejected,
    BackendUnavailable,
}

/// Result of a recognize-and-mark request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceResult {
    pub success: bool,
    pub status: MarkStatus,
    pub message: String,
    pub person_id: Option<String>,
    pub confidence: Option<f32>,
    /// When the person was marked; for `AlreadyMarked`, the original mark.
    pub timestamp: Option<DateTime<Utc>>,
    pub present_count: Option<u32>,
}

impl AttendanceResult {
    fn refused(status: MarkStatus, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status,
            message: message.into(),
            person_id: None,
            confidence: None,
            timestamp: None,
            present_count: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresentEntry {
    pub person_id: String,
    pub display_name: Option<String>,
    pub status: AttendanceStatus,
    pub timestamp: DateTime<Utc>,
    pub confidence: Option<f32>,
    pub marked_by_recognition: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceReport {
    pub class_id: String,
    pub date: NaiveDate,
    pub session: Option<AttendanceSession>,
    pub total_students: u32,
    pub present_count: u32,
    /// Everyone present or late, earliest first.
    pub present: Vec<PresentEntry>,
    /// Percent of the roster present, two decimals.
    pub attendance_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupReport {
    pub window_hours: u64,
    pub cutoff: DateTime<Utc>,
    pub dry_run: bool,
    /// Records deleted, or that would be deleted on a dry run.
    pub records: Vec<AttendanceRecord>,
    pub sessions: usize,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub struct AttendanceEngine {
    store: Store,
    media: MediaStore,
    recognition: Arc<RecognitionPipeline>,
    cleanup_hours: u64,
}

impl AttendanceEngine {
    pub fn new(store: Store, media: MediaStore, recognition: Arc<RecognitionPipeline>, cleanup_hours: u64) -> Self {
        Self {
            store,
            media,
            recognition,
            cleanup_hours,
        }
    }

    pub async fn get_or_create_session(
        &self,
        class_id: &str,
        date: NaiveDate,
        created_by: Option<&str>,
    ) -> Result<AttendanceSession, EngineError> {
        Ok(self.store.get_or_create_session(class_id, date, created_by).await?)
    }

    pub async fn end_session(&self, class_id: &str, date: NaiveDate) -> Result<AttendanceSession, EngineError> {
        Ok(self.store.end_session(class_id, date).await?)
    }

    /// One store write, retried once when it hits a constraint or a busy database.
    async fn write_mark(&self, request: MarkRequest) -> Result<MarkOutcome, EngineError> {
        match self.store.mark_attendance(request.clone()).await {
            Err(e) if e.is_conflict() => {
                tracing::warn!(
                    person = %request.person_id,
                    class = %request.class_id,
                    error = %e,
                    "attendance write conflicted; retrying once"
                );
                Ok(self.store.mark_attendance(request).await?)
            }
            other => Ok(other?),
        }
    }

    /// Insert or update the day's record for a person.
    pub async fn mark_attendance(&self, mark: AttendanceMark) -> Result<MarkOutcome, EngineError> {
        self.write_mark(MarkRequest {
            person_id: mark.person_id,
            class_id: mark.class_id,
            date: mark.date,
            status: mark.status,
            confidence: mark.confidence,
            marked_by_recognition: false,
            image_ref: None,
            notes: mark.notes,
            created_by: mark.created_by,
            timestamp: Utc::now(),
            mode: MarkMode::Upsert,
        })
        .await
    }

    /// Recognize the face in `image` and mark that person present.
    ///
    /// Every outcome short of an infrastructure failure is reported in the
    /// result rather than as an error.
    pub async fn recognize_and_mark(
        &self,
        class_id: &str,
        date: NaiveDate,
        image: &ImagePayload,
        created_by: Option<&str>,
    ) -> Result<AttendanceResult, EngineError> {
        if self.store.get_class(class_id).await?.is_none() {
            return Err(EngineError::ClassNotFound(class_id.to_string()));
        }
        let image = Arc::new(payload::decode(image)?);
        let report = self.recognition.recognize_image(&image).await?;

        let (person_id, confidence) = match report.outcome {
            RecognitionOutcome::Matched { person_id, confidence } => (person_id, confidence),
            RecognitionOutcome::NoMatch { .. } => {
                return Ok(AttendanceResult::refused(MarkStatus::NotRecognized, "face not recognized"));
            }
            RecognitionOutcome::Rejected { reason } => {
                return Ok(AttendanceResult::refused(MarkStatus::Rejected, reason));
            }
            RecognitionOutcome::BackendUnavailable { detail } => {
                return Ok(AttendanceResult::refused(MarkStatus::BackendUnavailable, detail));
            }
        };

        if !self.store.is_member(class_id, &person_id).await? {
            tracing::info!(person = %person_id, class = %class_id, "recognized person is not on the roster");
            return Ok(AttendanceResult {
                person_id: Some(person_id.clone()),
                confidence: Some(confidence),
                ..AttendanceResult::refused(
                    MarkStatus::PolicyRejected,
                    format!("{person_id} is not enrolled in this class"),
                )
            });
        }

        if let Some(existing) = self.store.get_attendance_record(&person_id, class_id, date).await? {
            if existing.status.is_attended() {
                return Ok(already_marked(existing, confidence));
            }
        }

        let now = Utc::now();
        let png = payload::encode_canonical(&image)?;
        let capture = self
            .media
            .save_attendance_capture(class_id, date, &person_id, now, &png)
            .await?;

        let outcome = self
            .write_mark(MarkRequest {
                person_id: person_id.clone(),
                class_id: class_id.to_string(),
                date,
                status: AttendanceStatus::Present,
                confidence: Some(confidence),
                marked_by_recognition: true,
                image_ref: Some(capture.clone()),
                notes: None,
                created_by: created_by.map(str::to_string),
                timestamp: now,
                mode: MarkMode::FirstMark,
            })
            .await;

        match outcome {
            Ok(MarkOutcome::Marked { record, session, .. }) => Ok(AttendanceResult {
                success: true,
                status: MarkStatus::Marked,
                message: format!("attendance marked for {person_id}"),
                person_id: Some(person_id),
                confidence: Some(confidence),
                timestamp: Some(record.timestamp),
                present_count: Some(session.present_count),
            }),
            Ok(MarkOutcome::AlreadyMarked { record }) => {
                // Captures are named by millisecond; a concurrent winner may own the same file.
                if record.image_ref.as_deref() != Some(capture.as_str()) {
                    self.discard_capture(&capture).await;
                }
                Ok(already_marked(record, confidence))
            }
            Err(e) => {
                self.discard_capture(&capture).await;
                Err(e)
            }
        }
    }

    async fn discard_capture(&self, reference: &str) {
        if let Err(e) = self.media.remove(reference).await {
            tracing::warn!(image = %reference, error = %e, "could not remove attendance capture");
        }
    }

    /// Roster size, who is present, and the attendance rate for a (class, date).
    pub async fn attendance_status(&self, class_id: &str, date: NaiveDate) -> Result<AttendanceReport, EngineError> {
        if self.store.get_class(class_id).await?.is_none() {
            return Err(EngineError::ClassNotFound(class_id.to_string()));
        }
        let session = self.store.get_session(class_id, date).await?;
        let total_students = match &session {
            Some(session) => session.total_students,
            None => self.store.count_active_members(class_id).await?,
        };
        let names: HashMap<String, String> = self
            .store
            .class_members(class_id)
            .await?
            .into_iter()
            .map(|p| (p.id, p.display_name))
            .collect();

        let present: Vec<PresentEntry> = self
            .store
            .list_attendance(class_id, date)
            .await?
            .into_iter()
            .filter(|r| r.status.is_attended())
            .map(|r| PresentEntry {
                display_name: names.get(&r.person_id).cloned(),
                person_id: r.person_id,
                status: r.status,
                timestamp: r.timestamp,
                confidence: r.recognition_confidence,
                marked_by_recognition: r.marked_by_recognition,
            })
            .collect();
        let present_count = present
            .iter()
            .filter(|p| p.status == AttendanceStatus::Present)
            .count() as u32;
        let attendance_rate = if total_students == 0 {
            0.0
        } else {
            round2(present_count as f64 / total_students as f64 * 100.0)
        };

        Ok(AttendanceReport {
            class_id: class_id.to_string(),
            date,
            session,
            total_students,
            present_count,
            present,
            attendance_rate,
        })
    }

    /// Delete present/late records older than the window (default from config).
    pub async fn run_stale_attendance_cleanup(
        &self,
        age_hours: Option<u64>,
        dry_run: bool,
    ) -> Result<CleanupReport, EngineError> {
        self.cleanup_at(Utc::now(), age_hours, dry_run).await
    }

    pub async fn cleanup_at(
        &self,
        now: DateTime<Utc>,
        age_hours: Option<u64>,
        dry_run: bool,
    ) -> Result<CleanupReport, EngineError> {
        let window_hours = age_hours.unwrap_or(self.cleanup_hours);
        let hours = i64::try_from(window_hours).unwrap_or(i64::MAX);
        let cutoff = Duration::try_hours(hours)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let records = if dry_run {
            self.store.stale_attendance(cutoff).await?
        } else {
            let deleted = self.store.delete_stale_attendance(cutoff).await?;
            for reference in deleted.iter().filter_map(|r| r.image_ref.as_deref()) {
                self.discard_capture(reference).await;
            }
            deleted
        };
        let sessions = records
            .iter()
            .map(|r| (r.class_id.as_str(), r.date))
            .collect::<BTreeSet<_>>()
            .len();

        tracing::info!(
            window_hours,
            %cutoff,
            dry_run,
            records = records.len(),
            sessions,
            "stale attendance cleanup"
        );
        Ok(CleanupReport {
            window_hours,
            cutoff,
            dry_run,
            records,
            sessions,
        })
    }
}

fn already_marked(record: AttendanceRecord, confidence: f32) -> AttendanceResult {
    tracing::info!(person = %record.person_id, class = %record.class_id, "already marked today");
    AttendanceResult {
        success: false,
        status: MarkStatus::AlreadyMarked,
        message: format!("{} was already marked at {}", record.person_id, record.timestamp.format("%H:%M:%S")),
        person_id: Some(record.person_id),
        confidence: Some(confidence),
        timestamp: Some(record.timestamp),
        present_count: None,
    }
}
