//! End-to-end chunked upload tests: submit → status → finalize, in every order
//! and under contention.

use sealdrop_crypto::{decrypt_file, DerivedKey};
use sealdrop_upload::{
    sha256_hex, RejectReason, SessionState, SubmitOutcome, UploadError, UploadPipeline,
};
use std::time::Duration;
use tempfile::TempDir;

fn pipeline(tmp: &TempDir) -> UploadPipeline {
    UploadPipeline::new(tmp.path().join("staging"), tmp.path().join("files"), 2).unwrap()
}

async fn submit(
    p: &UploadPipeline,
    id: &str,
    index: u32,
    total: u32,
    data: &[u8],
) -> SubmitOutcome {
    p.receiver()
        .submit_chunk(id, index, total, data.to_vec(), &sha256_hex(data))
        .await
        .unwrap()
}

fn staging_entries(tmp: &TempDir, id: &str) -> usize {
    std::fs::read_dir(tmp.path().join("staging").join(id))
        .map(|rd| rd.count())
        .unwrap_or(0)
}

#[tokio::test]
async fn duplicate_submission_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let p = pipeline(&tmp);

    assert!(submit(&p, "dup", 0, 2, b"same").await.is_accepted());
    assert!(submit(&p, "dup", 0, 2, b"same").await.is_accepted());

    assert_eq!(p.receiver().status("dup").await.unwrap(), vec![0]);
    assert_eq!(staging_entries(&tmp, "dup"), 1);
}

#[tokio::test]
async fn finalize_waits_for_every_chunk() {
    let tmp = TempDir::new().unwrap();
    let p = pipeline(&tmp);

    submit(&p, "gate", 0, 3, b"aa").await;
    submit(&p, "gate", 2, 3, b"cc").await;

    match p.assembler().finalize("gate", 3).await {
        Err(UploadError::IncompleteUpload { total, missing }) => {
            assert_eq!(total, 3);
            assert_eq!(missing, vec![1]);
        }
        other => panic!("expected IncompleteUpload, got {other:?}"),
    }
    assert_eq!(p.receiver().status("gate").await.unwrap(), vec![0, 2]);
    assert_eq!(staging_entries(&tmp, "gate"), 2);

    submit(&p, "gate", 1, 3, b"bb").await;
    let merged = p.assembler().finalize("gate", 3).await.unwrap();
    assert_eq!(std::fs::read(&merged.path).unwrap(), b"aabbcc");
}

#[tokio::test]
async fn finalize_with_short_total_keeps_every_chunk() {
    let tmp = TempDir::new().unwrap();
    let p = pipeline(&tmp);
    for (i, chunk) in [b"aa", b"bb", b"cc"].iter().enumerate() {
        assert!(submit(&p, "short", i as u32, 3, *chunk).await.is_accepted());
    }

    match p.assembler().finalize("short", 2).await {
        Err(UploadError::TotalMismatch { declared, got }) => {
            assert_eq!(declared, 3);
            assert_eq!(got, 2);
        }
        other => panic!("expected TotalMismatch, got {other:?}"),
    }
    assert_eq!(staging_entries(&tmp, "short"), 3);
    assert!(!tmp.path().join("files").exists());
    assert_eq!(
        p.receiver().session_state("short").await.unwrap(),
        SessionState::Complete
    );

    let merged = p.assembler().finalize("short", 3).await.unwrap();
    assert_eq!(std::fs::read(&merged.path).unwrap(), b"aabbcc");
}

#[tokio::test]
async fn merge_follows_index_not_arrival_order() {
    let tmp = TempDir::new().unwrap();
    let p = pipeline(&tmp);
    let chunks: [&[u8]; 3] = [b"0123", b"4567", b"89"];

    for i in [2usize, 0, 1] {
        assert!(submit(&p, "order", i as u32, 3, chunks[i]).await.is_accepted());
    }

    let merged = p.assembler().finalize("order", 3).await.unwrap();
    assert_eq!(std::fs::read(&merged.path).unwrap(), b"0123456789");
    assert_eq!(merged.size, 10);
    assert_eq!(merged.sha256, sha256_hex(b"0123456789"));

    assert!(!tmp.path().join("staging").join("order").exists());
    assert_eq!(
        p.receiver().session_state("order").await.unwrap(),
        SessionState::Finalized
    );
}

#[tokio::test]
async fn corrupted_chunk_is_rejected_then_retried() {
    let tmp = TempDir::new().unwrap();
    let p = pipeline(&tmp);
    let good = b"intended bytes";

    let outcome = p
        .receiver()
        .submit_chunk("retry", 0, 1, b"intended bytez".to_vec(), &sha256_hex(good))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        SubmitOutcome::Rejected(RejectReason::HashMismatch { .. })
    ));
    assert!(p.receiver().status("retry").await.unwrap().is_empty());

    assert!(submit(&p, "retry", 0, 1, good).await.is_accepted());
    let merged = p.assembler().finalize("retry", 1).await.unwrap();
    assert_eq!(std::fs::read(&merged.path).unwrap(), good);
}

#[tokio::test]
async fn concurrent_submissions_all_land() {
    let tmp = TempDir::new().unwrap();
    let p = pipeline(&tmp);
    let total = 32u32;

    let handles: Vec<_> = (0..total)
        .map(|i| {
            let p = p.clone();
            tokio::spawn(async move {
                let data = vec![i as u8; 1000 + i as usize];
                submit(&p, "many", i, total, &data).await
            })
        })
        .collect();
    for h in handles {
        assert!(h.await.unwrap().is_accepted());
    }

    let status = p.receiver().status("many").await.unwrap();
    assert_eq!(status, (0..total).collect::<Vec<_>>());

    let merged = p.assembler().finalize("many", total).await.unwrap();
    let expected: Vec<u8> = (0..total)
        .flat_map(|i| vec![i as u8; 1000 + i as usize])
        .collect();
    assert_eq!(std::fs::read(&merged.path).unwrap(), expected);
}

#[tokio::test]
async fn concurrent_finalize_yields_one_merge() {
    let tmp = TempDir::new().unwrap();
    let p = pipeline(&tmp);
    submit(&p, "race", 0, 2, b"first ").await;
    submit(&p, "race", 1, 2, b"second").await;

    let (a, b) = tokio::join!(
        p.assembler().finalize("race", 2),
        p.assembler().finalize("race", 2)
    );
    let (ok, err) = match (a, b) {
        (Ok(m), Err(e)) | (Err(e), Ok(m)) => (m, e),
        other => panic!("expected exactly one success, got {other:?}"),
    };
    assert_eq!(std::fs::read(&ok.path).unwrap(), b"first second");
    assert!(matches!(err, UploadError::AlreadyFinalized(_)));

    let files = std::fs::read_dir(tmp.path().join("files")).unwrap().count();
    assert_eq!(files, 1);
}

#[tokio::test]
async fn submission_after_finalize_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let p = pipeline(&tmp);
    submit(&p, "closed", 0, 1, b"x").await;
    p.assembler().finalize("closed", 1).await.unwrap();

    assert_eq!(
        submit(&p, "closed", 0, 1, b"x").await,
        SubmitOutcome::Rejected(RejectReason::SessionClosed {
            state: SessionState::Finalized
        })
    );
    assert_eq!(staging_entries(&tmp, "closed"), 0);
}

#[tokio::test]
async fn finalize_encrypted_produces_container() {
    let tmp = TempDir::new().unwrap();
    let p = pipeline(&tmp);
    let key = DerivedKey::from_bytes([0x42; 32]);

    let chunk: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
    for i in 0..3 {
        submit(&p, "sealed", i, 3, &chunk).await;
    }
    let whole = chunk.repeat(3);

    let dest = tmp.path().join("out").join("upload.sdp");
    let merged = p
        .assembler()
        .finalize_encrypted("sealed", 3, &dest, &key, Some(&sha256_hex(&whole)))
        .await
        .unwrap();
    assert!(merged.sealed);
    assert_eq!(merged.size, whole.len() as u64);
    assert_eq!(merged.path, dest);

    let back = tmp.path().join("back.bin");
    assert_eq!(decrypt_file(&dest, &back, &key).unwrap(), whole.len() as u64);
    assert_eq!(std::fs::read(&back).unwrap(), whole);
}

#[tokio::test]
async fn content_hash_mismatch_persists_nothing() {
    let tmp = TempDir::new().unwrap();
    let p = pipeline(&tmp);
    let key = DerivedKey::from_bytes([0x42; 32]);
    submit(&p, "wrong", 0, 1, b"actual").await;

    let dest = tmp.path().join("never.sdp");
    let err = p
        .assembler()
        .finalize_encrypted("wrong", 1, &dest, &key, Some(&sha256_hex(b"claimed")))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::ContentHashMismatch { .. }));
    assert!(!dest.exists());
    assert_eq!(p.receiver().status("wrong").await.unwrap(), vec![0]);
}

#[tokio::test]
async fn sweep_reclaims_idle_sessions() {
    let tmp = TempDir::new().unwrap();
    let p = pipeline(&tmp);
    submit(&p, "idle", 0, 2, b"x").await;

    let reclaimed = p.receiver().sweep_expired(Duration::ZERO).await.unwrap();
    assert_eq!(reclaimed, vec!["idle".to_string()]);
    assert!(!tmp.path().join("staging").join("idle").exists());
    assert!(matches!(
        p.assembler().finalize("idle", 2).await,
        Err(UploadError::Expired(_))
    ));
}

#[tokio::test]
async fn invalid_session_ids_never_touch_disk() {
    let tmp = TempDir::new().unwrap();
    let p = pipeline(&tmp);

    for id in ["", "..", "../outside", "a/b", "has space"] {
        let err = p
            .receiver()
            .submit_chunk(id, 0, 1, b"x".to_vec(), &sha256_hex(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidSessionId(_)), "{id:?}");
        assert!(matches!(
            p.assembler().finalize(id, 1).await,
            Err(UploadError::InvalidSessionId(_))
        ));
    }
    assert!(!tmp.path().join("outside").exists());
    assert!(!tmp.path().join("staging").exists());
}
