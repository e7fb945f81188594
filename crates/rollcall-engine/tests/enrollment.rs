mod common;

use common::*;
use rollcall_core::{ImagePayload, QualityIssue};
use rollcall_engine::{EngineError, EnrollmentFailure};
use rollcall_store::{BackendArtifact, BackendKind, DetectionStatus};
use std::sync::atomic::Ordering;

#[tokio::test]
async fn first_successful_enrollment_becomes_primary() {
    let h = harness(BackendKind::Corpus).await;
    person(&h.service, "s1").await;

    let first = h.service.enroll("s1", &png(&face_image(FACE_A)), false).await.unwrap();
    assert!(first.is_primary);
    assert_eq!(first.detection_status, DetectionStatus::Success);
    assert_eq!(first.error_message, None);

    let image = first.image_path.as_deref().unwrap();
    assert!(h.dir.path().join("media").join(image).is_file());
    let Some(BackendArtifact::CorpusFile(file)) = &first.artifact else {
        panic!("expected a corpus artifact, got {:?}", first.artifact);
    };
    assert!(h.dir.path().join("corpus").join(file).is_file());

    let second = h.service.enroll("s1", &png(&face_image(FACE_A)), false).await.unwrap();
    assert!(!second.is_primary);
    assert_eq!(h.service.primary_enrollment("s1").await.unwrap().id, first.id);
}

#[tokio::test]
async fn requested_primary_demotes_the_previous_one() {
    let h = harness(BackendKind::Vector).await;
    person(&h.service, "s1").await;

    let first = h.service.enroll("s1", &png(&face_image(FACE_A)), false).await.unwrap();
    let second = h.service.enroll("s1", &png(&face_image(FACE_A)), true).await.unwrap();
    assert!(second.is_primary);

    let records = h.service.list_enrollments("s1").await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records.iter().filter(|r| r.is_primary).count(), 1);
    assert!(!records.iter().find(|r| r.id == first.id).unwrap().is_primary);
    assert!(matches!(second.artifact, Some(BackendArtifact::Embedding(ref v)) if v.len() == 16));
}

#[tokio::test]
async fn quality_gate_rejects_and_persists_nothing() {
    let h = harness(BackendKind::Corpus).await;
    person(&h.service, "s1").await;

    let cases = [
        (face_image_sized(FACE_A, 99, 100), "image too small"),
        (blank_image(), "no face detected"),
        (two_face_image(FACE_A), "multiple faces detected"),
        (blurry_image(), "image too blurry"),
    ];
    for (image, reason) in cases {
        let err = h.service.enroll("s1", &png(&image), false).await.unwrap_err();
        match err {
            EngineError::QualityRejected(issue) => assert_eq!(issue.to_string(), reason),
            other => panic!("expected a quality rejection ({reason}), got {other}"),
        }
    }
    assert!(h.service.list_enrollments("s1").await.unwrap().is_empty());
    assert!(h.service.corpus_inventory().await.unwrap().is_empty());
}

#[tokio::test]
async fn minimum_size_is_inclusive() {
    let h = harness(BackendKind::Corpus).await;
    person(&h.service, "s1").await;

    let verdict = h
        .service
        .validate_image(&png(&face_image_sized(FACE_A, 99, 100)))
        .await
        .unwrap();
    assert!(!verdict.accepted);
    assert_eq!(verdict.reason, "image too small");
    assert!(matches!(verdict.issue, Some(QualityIssue::TooSmall { width: 99, height: 100 })));

    let verdict = h
        .service
        .validate_image(&png(&face_image_sized(FACE_A, 100, 100)))
        .await
        .unwrap();
    assert!(verdict.accepted, "{}", verdict.reason);
    assert!(h
        .service
        .enroll("s1", &png(&face_image_sized(FACE_A, 100, 100)), false)
        .await
        .is_ok());
}

#[tokio::test]
async fn malformed_payloads_are_invalid_images() {
    let h = harness(BackendKind::Corpus).await;
    person(&h.service, "s1").await;

    for payload in [
        ImagePayload::Encoded("data:image/png;base64,".into()),
        ImagePayload::Encoded("not base64 at all!".into()),
        ImagePayload::Binary(vec![0x89, b'P', b'N', b'G']),
    ] {
        let err = h.service.enroll("s1", &payload, false).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidImage(_)), "got {err}");
    }
    assert!(h.service.list_enrollments("s1").await.unwrap().is_empty());
}

#[tokio::test]
async fn data_url_payload_enrolls() {
    let h = harness(BackendKind::Vector).await;
    person(&h.service, "s1").await;
    let record = h.service.enroll("s1", &data_url(&face_image(FACE_B)), false).await.unwrap();
    assert!(record.is_primary);
}

#[tokio::test]
async fn unknown_person_is_refused_before_any_work() {
    let h = harness(BackendKind::Corpus).await;
    let err = h.service.enroll("ghost", &png(&face_image(FACE_A)), false).await.unwrap_err();
    assert!(matches!(err, EngineError::PersonNotFound(ref id) if id == "ghost"));
    assert_eq!(h.analyzer.embed_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn backend_failure_is_recorded_on_the_pending_row() {
    let h = harness(BackendKind::Vector).await;
    person(&h.service, "s1").await;
    h.analyzer.fail_embed.store(true, Ordering::SeqCst);

    let err = h.service.enroll("s1", &png(&face_image(FACE_A)), false).await.unwrap_err();
    assert!(matches!(err, EngineError::Enrollment(EnrollmentFailure::Analysis(_))), "got {err}");

    let records = h.service.list_enrollments("s1").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].detection_status, DetectionStatus::Error);
    assert!(!records[0].is_primary);
    assert!(records[0].error_message.as_deref().unwrap().contains("model output malformed"));
    assert!(matches!(
        h.service.primary_enrollment("s1").await.unwrap_err(),
        EngineError::NotEnrolled(_)
    ));

    // A later success still becomes primary.
    h.analyzer.fail_embed.store(false, Ordering::SeqCst);
    let record = h.service.enroll("s1", &png(&face_image(FACE_A)), false).await.unwrap();
    assert!(record.is_primary);
}

#[tokio::test]
async fn batch_gives_requested_primary_to_first_success() {
    let h = harness(BackendKind::Corpus).await;
    person(&h.service, "s1").await;
    let earlier = h.service.enroll("s1", &png(&face_image(FACE_A)), false).await.unwrap();
    assert!(earlier.is_primary);

    let batch = h
        .service
        .enroll_batch(
            "s1",
            &[
                png(&blank_image()),
                png(&face_image(FACE_A)),
                png(&face_image(FACE_A)),
            ],
            true,
        )
        .await
        .unwrap();
    assert_eq!(batch.enrolled.len(), 2);
    assert_eq!(batch.failures.len(), 1);
    assert_eq!(batch.failures[0].index, 0);
    assert_eq!(batch.failures[0].reason, "image rejected: no face detected");

    let primary = h.service.primary_enrollment("s1").await.unwrap();
    assert_eq!(primary.id, batch.enrolled[0].id);
    let records = h.service.list_enrollments("s1").await.unwrap();
    assert_eq!(records.iter().filter(|r| r.is_primary).count(), 1);
}

#[tokio::test]
async fn batch_with_no_success_fails() {
    let h = harness(BackendKind::Corpus).await;
    person(&h.service, "s1").await;

    let err = h
        .service
        .enroll_batch(
            "s1",
            &[png(&blank_image()), png(&face_image_sized(FACE_A, 50, 50))],
            false,
        )
        .await
        .unwrap_err();
    match err {
        EngineError::NothingEnrolled { attempted, errors } => {
            assert_eq!(attempted, 2);
            assert_eq!(errors.len(), 2);
        }
        other => panic!("expected NothingEnrolled, got {other}"),
    }
}

#[tokio::test]
async fn deleting_the_primary_promotes_the_newest_success() {
    let h = harness(BackendKind::Corpus).await;
    person(&h.service, "s1").await;

    let first = h.service.enroll("s1", &png(&face_image(FACE_A)), false).await.unwrap();
    let _second = h.service.enroll("s1", &png(&face_image(FACE_A)), false).await.unwrap();
    let third = h.service.enroll("s1", &png(&face_image(FACE_A)), false).await.unwrap();
    assert_eq!(h.service.corpus_inventory().await.unwrap()["s1"], 3);

    let removed = h.service.delete_enrollment(&first.id).await.unwrap();
    assert_eq!(removed.promoted.as_deref(), Some(third.id.as_str()));
    assert_eq!(h.service.primary_enrollment("s1").await.unwrap().id, third.id);

    let image = first.image_path.as_deref().unwrap();
    assert!(!h.dir.path().join("media").join(image).exists());
    assert_eq!(h.service.corpus_inventory().await.unwrap()["s1"], 2);

    let err = h.service.delete_enrollment(&first.id).await.unwrap_err();
    assert!(matches!(err, EngineError::EnrollmentNotFound(_)));
}

#[tokio::test]
async fn deleting_the_last_enrollment_leaves_no_primary() {
    let h = harness(BackendKind::Vector).await;
    person(&h.service, "s1").await;
    let only = h.service.enroll("s1", &png(&face_image(FACE_A)), false).await.unwrap();

    let removed = h.service.delete_enrollment(&only.id).await.unwrap();
    assert_eq!(removed.promoted, None);
    assert!(matches!(
        h.service.primary_enrollment("s1").await.unwrap_err(),
        EngineError::NotEnrolled(_)
    ));
}

#[tokio::test]
async fn remote_tokens_follow_the_faceset() {
    let h = harness(BackendKind::Remote).await;
    person(&h.service, "s1").await;

    let record = h.service.enroll("s1", &png(&face_image(FACE_A)), false).await.unwrap();
    let Some(BackendArtifact::FaceToken(token)) = record.artifact.clone() else {
        panic!("expected a face token, got {:?}", record.artifact);
    };
    assert_eq!(h.provider.faceset_tokens("fs-main"), vec![token.clone()]);

    let detail = h.service.faceset_detail(None).await.unwrap();
    assert_eq!(detail.face_count, 1);

    h.service.delete_enrollment(&record.id).await.unwrap();
    assert!(h.provider.faceset_tokens("fs-main").is_empty());
}

#[tokio::test]
async fn unreachable_provider_fails_enrollment_without_rows() {
    let h = harness(BackendKind::Remote).await;
    person(&h.service, "s1").await;
    h.provider.offline.store(true, Ordering::SeqCst);

    let err = h.service.enroll("s1", &png(&face_image(FACE_A)), false).await.unwrap_err();
    assert!(matches!(err, EngineError::BackendUnavailable(_)), "got {err}");
    assert!(h.service.list_enrollments("s1").await.unwrap().is_empty());
}
