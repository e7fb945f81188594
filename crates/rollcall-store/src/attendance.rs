//! Attendance sessions and records.
//!
//! One session per (class, date), created lazily with a snapshot of the active
//! roster size. One record per (person, class, date). Every write recounts the
//! session's `present_count` from the records inside the same transaction.

use crate::error::{Result, StoreError};
use crate::models::{
    date_text, from_millis, parse_date, to_millis, AttendanceRecord, AttendanceSession,
    AttendanceStatus,
};
use crate::roster::{active_member_count, class_exists, person_exists};
use crate::{new_id, Store};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::collections::BTreeSet;

const SESSION_COLUMNS: &str =
    "id, class_id, date, start_time, end_time, is_active, total_students, present_count, created_by";
const RECORD_COLUMNS: &str = "id, person_id, class_id, date, timestamp, status, recognition_confidence, \
     marked_by_recognition, image_ref, notes";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceSession> {
    Ok(AttendanceSession {
        id: row.get(0)?,
        class_id: row.get(1)?,
        date: parse_date(&row.get::<_, String>(2)?)?,
        start_time: from_millis(row.get(3)?)?,
        end_time: row.get::<_, Option<i64>>(4)?.map(from_millis).transpose()?,
        is_active: row.get(5)?,
        total_students: row.get(6)?,
        present_count: row.get(7)?,
        created_by: row.get(8)?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        id: row.get(0)?,
        person_id: row.get(1)?,
        class_id: row.get(2)?,
        date: parse_date(&row.get::<_, String>(3)?)?,
        timestamp: from_millis(row.get(4)?)?,
        status: row.get(5)?,
        recognition_confidence: row.get::<_, Option<f64>>(6)?.map(|c| c as f32),
        marked_by_recognition: row.get(7)?,
        image_ref: row.get(8)?,
        notes: row.get(9)?,
    })
}

/// How a mark treats a record that already exists for the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkMode {
    /// Overwrite status, confidence and timestamp in place.
    #[default]
    Upsert,
    /// Leave an existing present/late record untouched and report it.
    FirstMark,
}

#[derive(Debug, Clone)]
pub struct MarkRequest {
    pub person_id: String,
    pub class_id: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub confidence: Option<f32>,
    pub marked_by_recognition: bool,
    pub image_ref: Option<String>,
    pub notes: Option<String>,
    /// Recorded on the session if this mark creates it.
    pub created_by: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub mode: MarkMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MarkOutcome {
    Marked {
        record: AttendanceRecord,
        session: AttendanceSession,
        /// False when an existing record was updated.
        created: bool,
    },
    AlreadyMarked {
        record: AttendanceRecord,
    },
}

fn find_session(conn: &Connection, class_id: &str, date: NaiveDate) -> rusqlite::Result<Option<AttendanceSession>> {
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM attendance_sessions WHERE class_id = ?1 AND date = ?2"),
        params![class_id, date_text(date)],
        session_from_row,
    )
    .optional()
}

fn find_record(
    conn: &Connection,
    person_id: &str,
    class_id: &str,
    date: NaiveDate,
) -> rusqlite::Result<Option<AttendanceRecord>> {
    conn.query_row(
        &format!(
            "SELECT {RECORD_COLUMNS} FROM attendance_records WHERE person_id = ?1 AND class_id = ?2 AND date = ?3"
        ),
        params![person_id, class_id, date_text(date)],
        record_from_row,
    )
    .optional()
}

/// Get or create the (class, date) session; the roster snapshot is taken once.
fn ensure_session(
    conn: &Connection,
    class_id: &str,
    date: NaiveDate,
    created_by: Option<&str>,
    now: DateTime<Utc>,
) -> Result<AttendanceSession> {
    if let Some(session) = find_session(conn, class_id, date)? {
        return Ok(session);
    }
    if !class_exists(conn, class_id)? {
        return Err(StoreError::not_found("class", class_id));
    }
    let total = active_member_count(conn, class_id)?;
    conn.execute(
        "INSERT OR IGNORE INTO attendance_sessions
           (id, class_id, date, start_time, is_active, total_students, present_count, created_by)
         VALUES (?1, ?2, ?3, ?4, 1, ?5, 0, ?6)",
        params![new_id(), class_id, date_text(date), to_millis(now), total, created_by],
    )?;
    let session = find_session(conn, class_id, date)?
        .ok_or_else(|| StoreError::not_found("attendance session", format!("{class_id}/{date}")))?;
    tracing::info!(
        class = %class_id,
        %date,
        total_students = session.total_students,
        "attendance session started"
    );
    Ok(session)
}

/// Recompute `present_count` from the records and return the session.
fn recount(conn: &Connection, class_id: &str, date: NaiveDate) -> Result<Option<AttendanceSession>> {
    conn.execute(
        "UPDATE attendance_sessions SET present_count = (
           SELECT COUNT(*) FROM attendance_records
           WHERE class_id = ?1 AND date = ?2 AND status = 'present'
         ) WHERE class_id = ?1 AND date = ?2",
        params![class_id, date_text(date)],
    )?;
    Ok(find_session(conn, class_id, date)?)
}

fn stale_records(conn: &Connection, cutoff: DateTime<Utc>) -> rusqlite::Result<Vec<AttendanceRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM attendance_records
         WHERE status IN ('present', 'late') AND timestamp < ?1
         ORDER BY timestamp"
    ))?;
    let records = stmt
        .query_map([to_millis(cutoff)], record_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

impl Store {
    pub async fn get_or_create_session(
        &self,
        class_id: &str,
        date: NaiveDate,
        created_by: Option<&str>,
    ) -> Result<AttendanceSession> {
        let class_id = class_id.to_string();
        let created_by = created_by.map(str::to_string);
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let session = ensure_session(&tx, &class_id, date, created_by.as_deref(), Utc::now())?;
            tx.commit()?;
            Ok(session)
        })
        .await
    }

    pub async fn get_session(&self, class_id: &str, date: NaiveDate) -> Result<Option<AttendanceSession>> {
        let class_id = class_id.to_string();
        self.with_conn(move |conn| Ok(find_session(conn, &class_id, date)?))
            .await
    }

    /// Close a session. Closing an already closed session returns it unchanged.
    pub async fn end_session(&self, class_id: &str, date: NaiveDate) -> Result<AttendanceSession> {
        let class_id = class_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let session = find_session(&tx, &class_id, date)?
                .ok_or_else(|| StoreError::not_found("attendance session", format!("{class_id}/{date}")))?;
            if !session.is_active {
                return Ok(session);
            }
            tx.execute(
                "UPDATE attendance_sessions SET is_active = 0, end_time = ?2 WHERE id = ?1",
                params![session.id, to_millis(Utc::now())],
            )?;
            let closed = find_session(&tx, &class_id, date)?
                .ok_or_else(|| StoreError::not_found("attendance session", session.id.clone()))?;
            tx.commit()?;
            tracing::info!(
                class = %class_id,
                %date,
                present = closed.present_count,
                total = closed.total_students,
                "attendance session ended"
            );
            Ok(closed)
        })
        .await
    }

    /// Mark one person in one immediate transaction: get-or-create the session,
    /// refuse closed sessions, insert or update the record, recount.
    pub async fn mark_attendance(&self, request: MarkRequest) -> Result<MarkOutcome> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let MarkRequest {
                person_id,
                class_id,
                date,
                ..
            } = &request;

            if !person_exists(&tx, person_id)? {
                return Err(StoreError::not_found("person", person_id.clone()));
            }
            let session = ensure_session(
                &tx,
                class_id,
                *date,
                request.created_by.as_deref(),
                request.timestamp,
            )?;
            if !session.is_active {
                return Err(StoreError::SessionClosed {
                    class_id: class_id.clone(),
                    date: *date,
                });
            }

            let existing = find_record(&tx, person_id, class_id, *date)?;
            let created = match existing {
                Some(record) if request.mode == MarkMode::FirstMark && record.status.is_attended() => {
                    return Ok(MarkOutcome::AlreadyMarked { record });
                }
                Some(record) => {
                    tx.execute(
                        "UPDATE attendance_records
                         SET status = ?2, recognition_confidence = ?3, timestamp = ?4,
                             marked_by_recognition = ?5,
                             image_ref = COALESCE(?6, image_ref), notes = COALESCE(?7, notes)
                         WHERE id = ?1",
                        params![
                            record.id,
                            request.status,
                            request.confidence.map(f64::from),
                            to_millis(request.timestamp),
                            request.marked_by_recognition,
                            request.image_ref,
                            request.notes
                        ],
                    )?;
                    false
                }
                None => {
                    tx.execute(
                        "INSERT INTO attendance_records
                           (id, person_id, class_id, date, timestamp, status, recognition_confidence,
                            marked_by_recognition, image_ref, notes)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        params![
                            new_id(),
                            person_id,
                            class_id,
                            date_text(*date),
                            to_millis(request.timestamp),
                            request.status,
                            request.confidence.map(f64::from),
                            request.marked_by_recognition,
                            request.image_ref,
                            request.notes
                        ],
                    )?;
                    true
                }
            };

            let record = find_record(&tx, person_id, class_id, *date)?
                .ok_or_else(|| StoreError::not_found("attendance record", person_id.clone()))?;
            let session = recount(&tx, class_id, *date)?
                .ok_or_else(|| StoreError::not_found("attendance session", class_id.clone()))?;
            tx.commit()?;

            tracing::info!(
                person = %person_id,
                class = %class_id,
                %date,
                status = %record.status,
                created,
                present = session.present_count,
                "attendance marked"
            );
            Ok(MarkOutcome::Marked {
                record,
                session,
                created,
            })
        })
        .await
    }

    pub async fn get_attendance_record(
        &self,
        person_id: &str,
        class_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>> {
        let (person_id, class_id) = (person_id.to_string(), class_id.to_string());
        self.with_conn(move |conn| Ok(find_record(conn, &person_id, &class_id, date)?))
            .await
    }

    /// All records of a (class, date), earliest first.
    pub async fn list_attendance(&self, class_id: &str, date: NaiveDate) -> Result<Vec<AttendanceRecord>> {
        let class_id = class_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM attendance_records WHERE class_id = ?1 AND date = ?2
                 ORDER BY timestamp, rowid"
            ))?;
            let records = stmt
                .query_map(params![class_id, date_text(date)], record_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    /// Present/late records timestamped before `cutoff`.
    pub async fn stale_attendance(&self, cutoff: DateTime<Utc>) -> Result<Vec<AttendanceRecord>> {
        self.with_conn(move |conn| Ok(stale_records(conn, cutoff)?)).await
    }

    /// Delete present/late records older than `cutoff` and recount the
    /// sessions they belonged to. Returns the deleted records.
    pub async fn delete_stale_attendance(&self, cutoff: DateTime<Utc>) -> Result<Vec<AttendanceRecord>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stale = stale_records(&tx, cutoff)?;
            for record in &stale {
                tx.execute("DELETE FROM attendance_records WHERE id = ?1", [&record.id])?;
            }
            let sessions: BTreeSet<(String, NaiveDate)> = stale
                .iter()
                .map(|r| (r.class_id.clone(), r.date))
                .collect();
            for (class_id, date) in &sessions {
                recount(&tx, class_id, *date)?;
            }
            tx.commit()?;
            if !stale.is_empty() {
                tracing::info!(
                    deleted = stale.len(),
                    sessions = sessions.len(),
                    cutoff = %cutoff,
                    "stale attendance removed"
                );
            }
            Ok(stale)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Class, NewClass, NewPerson};
    use chrono::Duration;

    async fn setup() -> (Store, Class) {
        let store = Store::open_in_memory().await.unwrap();
        let class = store
            .create_class(NewClass {
                code: "BIO".into(),
                name: "Biology".into(),
                instructor: None,
            })
            .await
            .unwrap();
        for id in ["s1", "s2", "s3"] {
            store
                .create_person(NewPerson {
                    id: id.into(),
                    display_name: id.to_uppercase(),
                    class_ids: vec![class.id.clone()],
                })
                .await
                .unwrap();
        }
        (store, class)
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, 2).unwrap()
    }

    fn request(person: &str, class: &Class, status: AttendanceStatus, mode: MarkMode) -> MarkRequest {
        MarkRequest {
            person_id: person.into(),
            class_id: class.id.clone(),
            date: day(),
            status,
            confidence: Some(0.8),
            marked_by_recognition: true,
            image_ref: None,
            notes: None,
            created_by: Some("t1".into()),
            timestamp: Utc::now(),
            mode,
        }
    }

    #[tokio::test]
    async fn test_session_snapshot_and_idempotent_creation() {
        let (store, class) = setup().await;
        let first = store.get_or_create_session(&class.id, day(), Some("t1")).await.unwrap();
        let again = store.get_or_create_session(&class.id, day(), None).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(first.total_students, 3);
        assert_eq!(first.present_count, 0);
        assert_eq!(again.created_by.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_mark_twice_leaves_one_row() {
        let (store, class) = setup().await;
        let first = store
            .mark_attendance(request("s1", &class, AttendanceStatus::Present, MarkMode::Upsert))
            .await
            .unwrap();
        assert!(matches!(first, MarkOutcome::Marked { created: true, .. }));
        let second = store
            .mark_attendance(request("s1", &class, AttendanceStatus::Late, MarkMode::Upsert))
            .await
            .unwrap();
        let MarkOutcome::Marked { record, session, created } = second else {
            panic!("expected update");
        };
        assert!(!created);
        assert_eq!(record.status, AttendanceStatus::Late);
        // Late does not count toward present_count.
        assert_eq!(session.present_count, 0);
        assert_eq!(store.list_attendance(&class.id, day()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_first_mark_reports_already_marked() {
        let (store, class) = setup().await;
        let MarkOutcome::Marked { record: original, .. } = store
            .mark_attendance(request("s1", &class, AttendanceStatus::Present, MarkMode::FirstMark))
            .await
            .unwrap()
        else {
            panic!("expected mark");
        };
        let repeat = store
            .mark_attendance(request("s1", &class, AttendanceStatus::Present, MarkMode::FirstMark))
            .await
            .unwrap();
        match repeat {
            MarkOutcome::AlreadyMarked { record } => assert_eq!(record.timestamp, original.timestamp),
            other => panic!("expected AlreadyMarked, got {other:?}"),
        }
        let session = store.get_session(&class.id, day()).await.unwrap().unwrap();
        assert_eq!(session.present_count, 1);
    }

    #[tokio::test]
    async fn test_first_mark_upgrades_absent() {
        let (store, class) = setup().await;
        store
            .mark_attendance(request("s2", &class, AttendanceStatus::Absent, MarkMode::Upsert))
            .await
            .unwrap();
        let outcome = store
            .mark_attendance(request("s2", &class, AttendanceStatus::Present, MarkMode::FirstMark))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            MarkOutcome::Marked { created: false, ref session, .. } if session.present_count == 1
        ));
    }

    #[tokio::test]
    async fn test_closed_session_refuses_marks() {
        let (store, class) = setup().await;
        store.get_or_create_session(&class.id, day(), None).await.unwrap();
        let closed = store.end_session(&class.id, day()).await.unwrap();
        assert!(!closed.is_active);
        assert!(closed.end_time.is_some());

        let again = store.end_session(&class.id, day()).await.unwrap();
        assert_eq!(again.end_time, closed.end_time);

        let err = store
            .mark_attendance(request("s1", &class, AttendanceStatus::Present, MarkMode::Upsert))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SessionClosed { .. }));
        assert!(store.list_attendance(&class.id, day()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_end_missing_session() {
        let (store, class) = setup().await;
        assert!(matches!(
            store.end_session(&class.id, day()).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_stale_recounts() {
        let (store, class) = setup().await;
        let now = Utc::now();
        let mut old = request("s1", &class, AttendanceStatus::Present, MarkMode::Upsert);
        old.timestamp = now - Duration::hours(20);
        let mut recent = request("s2", &class, AttendanceStatus::Present, MarkMode::Upsert);
        recent.timestamp = now - Duration::hours(10);
        let mut absent = request("s3", &class, AttendanceStatus::Absent, MarkMode::Upsert);
        absent.timestamp = now - Duration::hours(30);
        for r in [old, recent, absent] {
            store.mark_attendance(r).await.unwrap();
        }
        assert_eq!(
            store.get_session(&class.id, day()).await.unwrap().unwrap().present_count,
            2
        );

        let cutoff = now - Duration::hours(15);
        assert_eq!(store.stale_attendance(cutoff).await.unwrap().len(), 1);
        let deleted = store.delete_stale_attendance(cutoff).await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].person_id, "s1");

        let session = store.get_session(&class.id, day()).await.unwrap().unwrap();
        assert_eq!(session.present_count, 1);
        assert_eq!(store.list_attendance(&class.id, day()).await.unwrap().len(), 2);
    }
}
