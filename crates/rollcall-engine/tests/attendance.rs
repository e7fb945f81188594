mod common;

use chrono::{Duration, NaiveDate, Utc};
use common::*;
use rollcall_engine::{AttendanceMark, EngineError, MarkStatus};
use rollcall_store::{AttendanceStatus, BackendKind, MarkMode, MarkOutcome, MarkRequest};
use std::sync::Arc;

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 10, 7).unwrap()
}

fn capture_count(h: &Harness) -> usize {
    let dir = h.dir.path().join("media/attendance");
    walk(&dir)
}

fn walk(dir: &std::path::Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .map(|e| e.unwrap().path())
        .map(|p| if p.is_dir() { walk(&p) } else { 1 })
        .sum()
}

#[tokio::test]
async fn recognition_marks_once_then_reports_already_marked() {
    let h = harness(BackendKind::Corpus).await;
    let class = class_with(&h.service, "CS101", &["s1", "s2"]).await;
    h.service.enroll("s1", &png(&face_image(FACE_A)), false).await.unwrap();

    let first = h
        .service
        .recognize_and_mark(&class.id, day(), &png(&face_image(FACE_A)), Some("kiosk-3"))
        .await
        .unwrap();
    assert!(first.success, "{}", first.message);
    assert_eq!(first.status, MarkStatus::Marked);
    assert_eq!(first.person_id.as_deref(), Some("s1"));
    assert_eq!(first.present_count, Some(1));

    let second = h
        .service
        .recognize_and_mark(&class.id, day(), &png(&face_image(FACE_A)), Some("kiosk-3"))
        .await
        .unwrap();
    assert!(!second.success);
    assert_eq!(second.status, MarkStatus::AlreadyMarked);
    assert_eq!(second.timestamp, first.timestamp);

    let records = h.service.store().list_attendance(&class.id, day()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, AttendanceStatus::Present);
    assert!(records[0].marked_by_recognition);
    assert!(records[0].recognition_confidence.unwrap() > 0.0);
    assert!(records[0].image_ref.is_some());
    assert_eq!(capture_count(&h), 1);

    let session = h.service.store().get_session(&class.id, day()).await.unwrap().unwrap();
    assert_eq!(session.present_count, 1);
    assert_eq!(session.total_students, 2);
    assert_eq!(session.created_by.as_deref(), Some("kiosk-3"));
}

#[tokio::test]
async fn person_off_the_roster_is_policy_rejected() {
    let h = harness(BackendKind::Vector).await;
    let class = class_with(&h.service, "CS101", &["s1"]).await;
    person(&h.service, "visitor").await;
    h.service.enroll("visitor", &png(&face_image(FACE_B)), false).await.unwrap();

    let result = h
        .service
        .recognize_and_mark(&class.id, day(), &png(&face_image(FACE_B)), None)
        .await
        .unwrap();
    assert_eq!(result.status, MarkStatus::PolicyRejected);
    assert_eq!(result.person_id.as_deref(), Some("visitor"));
    assert!(h.service.store().list_attendance(&class.id, day()).await.unwrap().is_empty());
    assert_eq!(capture_count(&h), 0);
}

#[tokio::test]
async fn unrecognized_and_rejected_images_write_nothing() {
    let h = harness(BackendKind::Corpus).await;
    let class = class_with(&h.service, "CS101", &["s1"]).await;
    h.service.enroll("s1", &png(&face_image(FACE_A)), false).await.unwrap();

    let result = h
        .service
        .recognize_and_mark(&class.id, day(), &png(&face_image(FACE_C)), None)
        .await
        .unwrap();
    assert_eq!(result.status, MarkStatus::NotRecognized);

    let result = h
        .service
        .recognize_and_mark(&class.id, day(), &png(&blurry_image()), None)
        .await
        .unwrap();
    assert_eq!(result.status, MarkStatus::Rejected);
    assert_eq!(result.message, "image too blurry");

    assert!(h.service.store().list_attendance(&class.id, day()).await.unwrap().is_empty());
    assert!(h.service.store().get_session(&class.id, day()).await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_class_is_an_error() {
    let h = harness(BackendKind::Corpus).await;
    let err = h
        .service
        .recognize_and_mark("no-such-class", day(), &png(&face_image(FACE_A)), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ClassNotFound(_)));
}

#[tokio::test]
async fn remarking_updates_the_single_row() {
    let h = harness(BackendKind::Vector).await;
    let class = class_with(&h.service, "CS101", &["s1", "s2"]).await;

    let outcome = h
        .service
        .mark_attendance(AttendanceMark::new("s1", &class.id, day(), AttendanceStatus::Present))
        .await
        .unwrap();
    assert!(matches!(outcome, MarkOutcome::Marked { created: true, ref session, .. } if session.present_count == 1));

    let outcome = h
        .service
        .mark_attendance(AttendanceMark::new("s1", &class.id, day(), AttendanceStatus::Late))
        .await
        .unwrap();
    let MarkOutcome::Marked { record, session, created } = outcome else {
        panic!("manual marks always write");
    };
    assert!(!created);
    assert_eq!(record.status, AttendanceStatus::Late);
    assert_eq!(session.present_count, 0);

    let records = h.service.store().list_attendance(&class.id, day()).await.unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn closed_sessions_refuse_marks() {
    let h = harness(BackendKind::Corpus).await;
    let class = class_with(&h.service, "CS101", &["s1", "s2"]).await;
    h.service.enroll("s2", &png(&face_image(FACE_B)), false).await.unwrap();

    let session = h.service.get_or_create_session(&class.id, day(), Some("dr-okafor")).await.unwrap();
    assert!(session.is_active);
    let closed = h.service.end_session(&class.id, day()).await.unwrap();
    assert!(!closed.is_active);
    assert!(closed.end_time.is_some());
    let again = h.service.end_session(&class.id, day()).await.unwrap();
    assert_eq!(again.end_time, closed.end_time);

    let err = h
        .service
        .mark_attendance(AttendanceMark::new("s1", &class.id, day(), AttendanceStatus::Present))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SessionClosed { .. }), "got {err}");

    let err = h
        .service
        .recognize_and_mark(&class.id, day(), &png(&face_image(FACE_B)), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SessionClosed { .. }), "got {err}");
    assert_eq!(capture_count(&h), 0);
    assert!(h.service.store().list_attendance(&class.id, day()).await.unwrap().is_empty());
}

#[tokio::test]
async fn session_snapshots_the_roster_once() {
    let h = harness(BackendKind::Corpus).await;
    let class = class_with(&h.service, "CS101", &["s1", "s2", "s3"]).await;

    let session = h.service.get_or_create_session(&class.id, day(), None).await.unwrap();
    assert_eq!(session.total_students, 3);

    person(&h.service, "s4").await;
    h.service.add_to_class(&class.id, "s4").await.unwrap();
    let same = h.service.get_or_create_session(&class.id, day(), None).await.unwrap();
    assert_eq!(same.id, session.id);
    assert_eq!(same.total_students, 3);
}

#[tokio::test]
async fn status_lists_attendees_and_rate() {
    let h = harness(BackendKind::Corpus).await;
    let class = class_with(&h.service, "CS101", &["s1", "s2", "s3"]).await;

    let empty = h.service.attendance_status(&class.id, day()).await.unwrap();
    assert_eq!(empty.total_students, 3);
    assert!(empty.session.is_none());
    assert_eq!(empty.attendance_rate, 0.0);

    for (id, status) in [("s1", AttendanceStatus::Present), ("s2", AttendanceStatus::Present), ("s3", AttendanceStatus::Absent)] {
        h.service
            .mark_attendance(AttendanceMark::new(id, &class.id, day(), status))
            .await
            .unwrap();
    }

    let report = h.service.attendance_status(&class.id, day()).await.unwrap();
    assert_eq!(report.present_count, 2);
    assert_eq!(report.present.len(), 2);
    assert_eq!(report.present[0].display_name.as_deref(), Some("S1"));
    assert_eq!(report.attendance_rate, 66.67);
    assert_eq!(report.session.unwrap().present_count, 2);
}

#[tokio::test]
async fn cleanup_removes_only_records_past_the_window() {
    let h = harness(BackendKind::Corpus).await;
    let class = class_with(&h.service, "CS101", &["s1", "s2"]).await;
    let now = Utc::now();

    for (id, age) in [("s1", 20), ("s2", 10)] {
        h.service
            .store()
            .mark_attendance(MarkRequest {
                person_id: id.into(),
                class_id: class.id.clone(),
                date: day(),
                status: AttendanceStatus::Present,
                confidence: Some(0.8),
                marked_by_recognition: true,
                image_ref: None,
                notes: None,
                created_by: None,
                timestamp: now - Duration::hours(age),
                mode: MarkMode::Upsert,
            })
            .await
            .unwrap();
    }

    let preview = h.service.attendance().cleanup_at(now, Some(15), true).await.unwrap();
    assert!(preview.dry_run);
    assert_eq!(preview.records.len(), 1);
    assert_eq!(preview.records[0].person_id, "s1");
    assert_eq!(h.service.store().list_attendance(&class.id, day()).await.unwrap().len(), 2);

    let report = h.service.attendance().cleanup_at(now, Some(15), false).await.unwrap();
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.sessions, 1);

    let left = h.service.store().list_attendance(&class.id, day()).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].person_id, "s2");
    let session = h.service.store().get_session(&class.id, day()).await.unwrap().unwrap();
    assert_eq!(session.present_count, 1);
}

#[tokio::test]
async fn cleanup_window_defaults_to_configuration() {
    let h = harness_with(BackendKind::Corpus, |c| c.attendance.cleanup_hours = 1).await;
    let class = class_with(&h.service, "CS101", &["s1"]).await;
    h.service
        .mark_attendance(AttendanceMark::new("s1", &class.id, day(), AttendanceStatus::Present))
        .await
        .unwrap();

    let later = Utc::now() + Duration::hours(2);
    let report = h.service.attendance().cleanup_at(later, None, false).await.unwrap();
    assert_eq!(report.window_hours, 1);
    assert_eq!(report.records.len(), 1);
}

#[tokio::test]
async fn concurrent_recognitions_leave_one_record() {
    let h = harness(BackendKind::Vector).await;
    let class = class_with(&h.service, "CS101", &["s1"]).await;
    h.service.enroll("s1", &png(&face_image(FACE_A)), false).await.unwrap();

    let service = Arc::new(h.service);
    let mut tasks = Vec::new();
    for _ in 0..6 {
        let service = Arc::clone(&service);
        let class_id = class.id.clone();
        tasks.push(tokio::spawn(async move {
            service
                .recognize_and_mark(&class_id, day(), &png(&face_image(FACE_A)), None)
                .await
                .unwrap()
        }));
    }
    let mut marked = 0;
    for task in tasks {
        let result = task.await.unwrap();
        match result.status {
            MarkStatus::Marked => marked += 1,
            MarkStatus::AlreadyMarked => {}
            other => panic!("unexpected status {other:?}"),
        }
    }
    assert_eq!(marked, 1);

    let records = service.store().list_attendance(&class.id, day()).await.unwrap();
    assert_eq!(records.len(), 1);
    let session = service.store().get_session(&class.id, day()).await.unwrap().unwrap();
    assert_eq!(session.present_count, 1);
    let captures = walk(&h.dir.path().join("media/attendance"));
    assert_eq!(captures, 1);
}
