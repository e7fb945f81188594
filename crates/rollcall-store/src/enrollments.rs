//! Enrollment records and the single-primary invariant.
//!
//! A record is inserted as pending (status `error`, "enrollment in progress")
//! before the backend runs, then completed or failed. Among a person's
//! successful records exactly one is primary.

use crate::error::{Result, StoreError};
use crate::models::{
    from_millis, to_millis, BackendArtifact, BackendKind, DeletedEnrollment, DetectionStatus,
    EnrollmentRecord, StoredArtifact,
};
use crate::roster::person_exists;
use crate::{new_id, Store};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

pub const PENDING_MESSAGE: &str = "enrollment in progress";

const ENROLLMENT_COLUMNS: &str =
    "id, person_id, backend, image_path, artifact, is_primary, detection_status, error_message, created_at";

fn enrollment_from_row(row: &Row<'_>) -> rusqlite::Result<EnrollmentRecord> {
    let backend: BackendKind = row.get(2)?;
    let artifact = row
        .get::<_, Option<String>>(4)?
        .map(|text| BackendArtifact::from_column(backend, text))
        .transpose()?;
    Ok(EnrollmentRecord {
        id: row.get(0)?,
        person_id: row.get(1)?,
        backend,
        image_path: row.get(3)?,
        artifact,
        is_primary: row.get(5)?,
        detection_status: row.get(6)?,
        error_message: row.get(7)?,
        created_at: from_millis(row.get(8)?)?,
    })
}

fn load(conn: &Connection, enrollment_id: &str) -> Result<EnrollmentRecord> {
    conn.query_row(
        &format!("SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE id = ?1"),
        [enrollment_id],
        enrollment_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found("enrollment", enrollment_id))
}

fn successful_count(conn: &Connection, person_id: &str, excluding: &str) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COUNT(*) FROM enrollments
         WHERE person_id = ?1 AND detection_status = 'success' AND id != ?2",
        params![person_id, excluding],
        |row| row.get(0),
    )
}

impl Store {
    /// Insert the placeholder row written before the backend is invoked.
    pub async fn insert_pending_enrollment(
        &self,
        person_id: &str,
        backend: BackendKind,
    ) -> Result<EnrollmentRecord> {
        let person_id = person_id.to_string();
        self.with_conn(move |conn| {
            if !person_exists(conn, &person_id)? {
                return Err(StoreError::not_found("person", person_id));
            }
            let id = new_id();
            conn.execute(
                "INSERT INTO enrollments (id, person_id, backend, is_primary, detection_status, error_message, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6)",
                params![
                    id,
                    person_id,
                    backend,
                    DetectionStatus::Error,
                    PENDING_MESSAGE,
                    to_millis(Utc::now())
                ],
            )?;
            load(conn, &id)
        })
        .await
    }

    /// Mark a pending record successful and settle the primary flag.
    ///
    /// The record becomes primary when `requested_primary` is set or when the
    /// person has no other successful enrollment; a new primary demotes the old.
    pub async fn complete_enrollment(
        &self,
        enrollment_id: &str,
        artifact: BackendArtifact,
        image_path: Option<String>,
        requested_primary: bool,
    ) -> Result<EnrollmentRecord> {
        let enrollment_id = enrollment_id.to_string();
        let artifact_text = artifact.to_column()?;
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let pending = load(&tx, &enrollment_id)?;
            if artifact.backend() != pending.backend {
                return Err(StoreError::Corrupt {
                    column: "artifact",
                    detail: format!(
                        "{} artifact for a {} enrollment",
                        artifact.backend(),
                        pending.backend
                    ),
                });
            }

            let first_success = successful_count(&tx, &pending.person_id, &enrollment_id)? == 0;
            let primary = requested_primary || first_success;
            if primary {
                tx.execute(
                    "UPDATE enrollments SET is_primary = 0 WHERE person_id = ?1 AND id != ?2",
                    params![pending.person_id, enrollment_id],
                )?;
            }
            tx.execute(
                "UPDATE enrollments
                 SET detection_status = ?2, error_message = NULL, artifact = ?3, image_path = ?4, is_primary = ?5
                 WHERE id = ?1",
                params![
                    enrollment_id,
                    DetectionStatus::Success,
                    artifact_text,
                    image_path,
                    primary
                ],
            )?;
            let record = load(&tx, &enrollment_id)?;
            tx.commit()?;
            tracing::info!(
                enrollment = %record.id,
                person = %record.person_id,
                backend = %record.backend,
                primary,
                "enrollment completed"
            );
            Ok(record)
        })
        .await
    }

    /// Record why a pending enrollment did not succeed.
    pub async fn fail_enrollment(
        &self,
        enrollment_id: &str,
        status: DetectionStatus,
        message: &str,
    ) -> Result<EnrollmentRecord> {
        let (enrollment_id, message) = (enrollment_id.to_string(), message.to_string());
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE enrollments SET detection_status = ?2, error_message = ?3, is_primary = 0
                 WHERE id = ?1",
                params![enrollment_id, status, message],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("enrollment", enrollment_id));
            }
            let record = load(conn, &enrollment_id)?;
            tracing::warn!(
                enrollment = %record.id,
                person = %record.person_id,
                status = %status,
                reason = %message,
                "enrollment failed"
            );
            Ok(record)
        })
        .await
    }

    pub async fn get_enrollment(&self, enrollment_id: &str) -> Result<Option<EnrollmentRecord>> {
        let enrollment_id = enrollment_id.to_string();
        self.with_conn(move |conn| match load(conn, &enrollment_id) {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    /// All of a person's enrollments, newest first.
    pub async fn list_enrollments(&self, person_id: &str) -> Result<Vec<EnrollmentRecord>> {
        let person_id = person_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE person_id = ?1
                 ORDER BY created_at DESC, rowid DESC"
            ))?;
            let records = stmt
                .query_map([&person_id], enrollment_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    pub async fn primary_enrollment(&self, person_id: &str) -> Result<Option<EnrollmentRecord>> {
        let person_id = person_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE person_id = ?1 AND is_primary = 1"
                    ),
                    [&person_id],
                    enrollment_from_row,
                )
                .optional()?)
        })
        .await
    }

    pub async fn count_successful_enrollments(&self, person_id: &str) -> Result<u32> {
        let person_id = person_id.to_string();
        self.with_conn(move |conn| Ok(successful_count(conn, &person_id, "")?))
            .await
    }

    /// Every successful artifact produced by `backend`, for a full recognition scan.
    pub async fn successful_artifacts(&self, backend: BackendKind) -> Result<Vec<StoredArtifact>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT e.id, e.person_id, e.artifact FROM enrollments e
                 JOIN persons p ON p.id = e.person_id
                 WHERE e.backend = ?1 AND e.detection_status = 'success' AND e.artifact IS NOT NULL
                   AND p.is_active = 1
                 ORDER BY e.created_at, e.rowid",
            )?;
            let artifacts = stmt
                .query_map([backend], |row| {
                    Ok(StoredArtifact {
                        enrollment_id: row.get(0)?,
                        person_id: row.get(1)?,
                        artifact: BackendArtifact::from_column(backend, row.get(2)?)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(artifacts)
        })
        .await
    }

    /// Delete a record; if it was primary, promote the newest remaining success.
    ///
    /// Returns `None` when no such record exists. Media and backend artifacts
    /// are the caller's to remove.
    pub async fn delete_enrollment(&self, enrollment_id: &str) -> Result<Option<DeletedEnrollment>> {
        let enrollment_id = enrollment_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let record = match load(&tx, &enrollment_id) {
                Ok(record) => record,
                Err(StoreError::NotFound { .. }) => return Ok(None),
                Err(e) => return Err(e),
            };
            tx.execute("DELETE FROM enrollments WHERE id = ?1", [&enrollment_id])?;

            let mut promoted = None;
            if record.is_primary {
                promoted = tx
                    .query_row(
                        "SELECT id FROM enrollments WHERE person_id = ?1 AND detection_status = 'success'
                         ORDER BY created_at DESC, rowid DESC LIMIT 1",
                        [&record.person_id],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                if let Some(next) = &promoted {
                    tx.execute("UPDATE enrollments SET is_primary = 1 WHERE id = ?1", [next])?;
                }
            }
            tx.commit()?;
            tracing::info!(
                enrollment = %record.id,
                person = %record.person_id,
                promoted = ?promoted,
                "enrollment deleted"
            );
            Ok(Some(DeletedEnrollment { record, promoted }))
        })
        .await
    }
}
