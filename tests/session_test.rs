//! Resumable session scenarios: chunked resume, offset rejection, TTL.

mod common;

use bytes::Bytes;
use common::generate_binary;
use std::collections::HashMap;
use tempfile::TempDir;
use wavevault::error::IngestError;
use wavevault::hashing::digest_of;
use wavevault::session::{SessionStatus, SessionStore};

const MIB: u64 = 1024 * 1024;

fn store(max: u64) -> (SessionStore, TempDir) {
    let tmp = TempDir::new().unwrap();
    let store = SessionStore::new(tmp.path().join("scratch"), max).unwrap();
    (store, tmp)
}

#[tokio::test]
async fn test_chunked_resume_ten_mib() {
    let (store, _tmp) = store(64 * MIB);
    let payload = generate_binary(10 * MIB as usize, 1);
    let digest = digest_of(&payload);

    let id = store
        .create(10 * MIB, "long-recording.wav", HashMap::new())
        .unwrap();

    // First chunk: bytes [0, 4 MiB) at offset 0
    let info = store
        .append(&id, 0, Bytes::copy_from_slice(&payload[..4 * MIB as usize]), None)
        .await
        .unwrap();
    assert_eq!(info.offset, 4_194_304);
    assert_eq!(info.status, SessionStatus::Receiving);

    // Second chunk: bytes [4 MiB, 10 MiB) at the reported offset
    let info = store
        .append(
            &id,
            4_194_304,
            Bytes::copy_from_slice(&payload[4 * MIB as usize..]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(info.offset, 10_485_760);
    assert_eq!(info.status, SessionStatus::Completed);

    let info = store.verify(&id, digest.as_str()).unwrap();
    assert_eq!(info.status, SessionStatus::Verified);

    // A parallel fresh session with the same bytes but an all-zero declared
    // digest fails verification.
    let other = store.create(4, "other.wav", HashMap::new()).unwrap();
    store
        .append(&other, 0, Bytes::from_static(b"abcd"), None)
        .await
        .unwrap();
    let info = store.verify(&other, &"0".repeat(64)).unwrap();
    assert_eq!(info.status, SessionStatus::FailedVerification);
}

#[tokio::test]
async fn test_offset_rejection_preserves_session() {
    let (store, _tmp) = store(MIB);
    let id = store.create(MIB, "take.wav", HashMap::new()).unwrap();

    let chunk = generate_binary(64 * 1024, 2);
    let info = store
        .append(&id, 0, Bytes::from(chunk.clone()), None)
        .await
        .unwrap();
    let offset_after_first = info.offset;
    assert_eq!(offset_after_first, 64 * 1024);

    // Replaying the first chunk at offset 0 is rejected with the server's
    // committed offset; nothing about the session moves.
    let err = store
        .append(&id, 0, Bytes::from(chunk), None)
        .await
        .unwrap_err();
    match err {
        IngestError::OffsetMismatch { client, server } => {
            assert_eq!(client, 0);
            assert_eq!(server, offset_after_first);
        }
        other => panic!("expected OffsetMismatch, got {other}"),
    }

    let info = store.info(&id).unwrap();
    assert_eq!(info.status, SessionStatus::Receiving);
    assert_eq!(info.offset, offset_after_first);
    assert_eq!(info.chunks_received, 1);
}

#[tokio::test]
async fn test_offset_monotonically_nondecreasing() {
    let (store, _tmp) = store(MIB);
    let id = store.create(256 * 1024, "mono.wav", HashMap::new()).unwrap();

    let mut last_offset = 0;
    for i in 0..4 {
        let chunk = generate_binary(64 * 1024, i);
        let info = store
            .append(&id, last_offset, Bytes::from(chunk), None)
            .await
            .unwrap();
        assert!(info.offset >= last_offset);
        assert!(info.offset <= info.declared_size);
        last_offset = info.offset;
    }
    assert_eq!(last_offset, 256 * 1024);
}

#[tokio::test]
async fn test_session_digest_matches_streamed_bytes() {
    let (store, _tmp) = store(MIB);
    let payload = generate_binary(300_000, 5);
    let id = store
        .create(payload.len() as u64, "x.wav", HashMap::new())
        .unwrap();

    // Uneven chunking must not change the digest
    let mut offset = 0usize;
    for chunk_len in [100_000usize, 50_000, 150_000] {
        store
            .append(
                &id,
                offset as u64,
                Bytes::copy_from_slice(&payload[offset..offset + chunk_len]),
                None,
            )
            .await
            .unwrap();
        offset += chunk_len;
    }

    let info = store.info(&id).unwrap();
    assert_eq!(info.final_digest.unwrap(), digest_of(&payload));
}

#[tokio::test]
async fn test_ttl_sweep_removes_stale_scratch() {
    let (store, _tmp) = store(MIB);

    let stale = store.create(100, "stale.wav", HashMap::new()).unwrap();
    store
        .append(&stale, 0, Bytes::from(generate_binary(50, 3)), None)
        .await
        .unwrap();

    let removed = store.cleanup_expired(std::time::Duration::ZERO);
    assert_eq!(removed, 1);
    assert!(matches!(store.info(&stale), Err(IngestError::NotFound(_))));
    assert_eq!(store.active_count(), 0);
}
