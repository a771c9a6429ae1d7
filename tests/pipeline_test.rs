//! End-to-end pipeline scenarios against the in-memory store.

mod common;

use common::{make_wav, one_second_wav, test_pipeline, test_pipeline_with, TEST_BUCKET};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wavevault::hashing::digest_of;
use wavevault::pipeline::{BytesSource, OutcomeStatus, PayloadSource};
use wavevault::storage::plan::{UploadPlan, GIB, MIB};
use wavevault::storage::ObjectStore;
use wavevault::types::meta_keys;

fn sources(specs: Vec<(&str, Vec<u8>)>) -> Vec<Arc<dyn PayloadSource>> {
    specs
        .into_iter()
        .map(|(name, data)| Arc::new(BytesSource::new(name, data)) as Arc<dyn PayloadSource>)
        .collect()
}

#[tokio::test]
async fn test_identical_payload_dedup() {
    let harness = test_pipeline();
    let wav = one_second_wav(42);
    let digest = digest_of(&wav);

    // First upload: stored under the canonical renamed key
    let report = harness
        .pipeline
        .ingest_batch(
            sources(vec![("a.wav", wav.clone())]),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.successful, 1);
    assert_eq!(report.results[0].status, OutcomeStatus::Success);
    assert_eq!(report.results[0].key.as_deref(), Some("a_raw.wav"));

    // Second upload of the same bytes under a different name: duplicate
    let report = harness
        .pipeline
        .ingest_batch(sources(vec![("b.wav", wav)]), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.results[0].status, OutcomeStatus::Duplicate);

    // Exactly one object, carrying the payload digest
    assert_eq!(harness.store.object_count(TEST_BUCKET), 1);
    let head = harness
        .store
        .head_object(TEST_BUCKET, "a_raw.wav")
        .await
        .unwrap();
    assert_eq!(head.file_hash().unwrap(), digest);
}

#[tokio::test]
async fn test_bit_perfect_roundtrip() {
    let harness = test_pipeline();
    let wav = make_wav(200_000, 44_100, 2, 7);

    harness
        .pipeline
        .ingest_batch(
            sources(vec![("session.wav", wav.clone())]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let stored = harness
        .store
        .object_bytes(TEST_BUCKET, "session_raw.wav")
        .expect("object stored");

    // Stored size equals input size, digests match, and the 44-byte WAV
    // header survives untouched.
    assert_eq!(stored.len(), wav.len());
    assert_eq!(digest_of(&stored), digest_of(&wav));
    assert_eq!(&stored[..common::WAV_HEADER_LEN], &wav[..common::WAV_HEADER_LEN]);

    let head = harness
        .store
        .head_object(TEST_BUCKET, "session_raw.wav")
        .await
        .unwrap();
    assert_eq!(head.size, wav.len() as u64);
    assert_eq!(head.content_type, "audio/wav");
    assert_eq!(
        head.user_metadata.get(meta_keys::ORIGINAL_NAME).unwrap(),
        "session.wav"
    );
}

#[tokio::test]
async fn test_adaptive_multipart_selection() {
    // The strategy table, as the pipeline will apply it
    assert_eq!(UploadPlan::for_size(50 * MIB).part_size(), None);
    assert_eq!(UploadPlan::for_size(200 * MIB).part_size(), Some(8 * MIB));
    assert_eq!(UploadPlan::for_size(800 * MIB).part_size(), Some(16 * MIB));
    assert_eq!(UploadPlan::for_size(2 * GIB).part_size(), Some(32 * MIB));

    // Spy on the store adapter: a real ingest below the threshold is
    // observed as a single PUT.
    let harness = test_pipeline();
    harness
        .pipeline
        .ingest_batch(
            sources(vec![("small.wav", one_second_wav(3))]),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(harness.store.observed_part_sizes(), vec![None]);
}

#[tokio::test]
async fn test_mixed_batch_counts_and_order() {
    let harness = test_pipeline();
    let shared = one_second_wav(11);

    let report = harness
        .pipeline
        .ingest_batch(
            sources(vec![
                ("first.wav", shared.clone()),
                ("second.wav", shared),
                ("third.wav", one_second_wav(12)),
            ]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.successful + report.duplicates + report.failed, 3);
    assert_eq!(report.successful, 2);
    assert_eq!(report.duplicates, 1);

    // Outcome list preserves input order
    assert_eq!(report.results[0].filename, "first.wav");
    assert_eq!(report.results[1].filename, "second.wav");
    assert_eq!(report.results[2].filename, "third.wav");
    assert_eq!(report.results[1].status, OutcomeStatus::Duplicate);
}

#[tokio::test]
async fn test_pooled_batch_path() {
    let pool = common::test_pool(2);
    let harness = test_pipeline_with(Some(pool));

    // Five distinct files exceed the batch threshold (2) and run pooled
    let specs: Vec<(String, Vec<u8>)> = (0..5)
        .map(|i| (format!("take-{i}.wav"), one_second_wav(100 + i)))
        .collect();
    let sources: Vec<Arc<dyn PayloadSource>> = specs
        .iter()
        .map(|(name, data)| {
            Arc::new(BytesSource::new(name.clone(), data.clone())) as Arc<dyn PayloadSource>
        })
        .collect();

    let report = harness
        .pipeline
        .ingest_batch(sources, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.successful, 5);
    assert_eq!(harness.store.object_count(TEST_BUCKET), 5);
    // Order preserved despite concurrent execution
    for (i, result) in report.results.iter().enumerate() {
        assert_eq!(result.filename, format!("take-{i}.wav"));
    }
}

#[tokio::test]
async fn test_concurrent_identical_payloads_one_success() {
    // In-batch coherence: both files hash to the same digest and race
    // through the pool; exactly one stores, the other reports duplicate.
    let pool = common::test_pool(4);
    let harness = test_pipeline_with(Some(pool));
    let shared = one_second_wav(55);

    let report = harness
        .pipeline
        .ingest_batch(
            sources(vec![
                ("left.wav", shared.clone()),
                ("right.wav", shared.clone()),
                ("third.wav", shared),
            ]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.successful, 1);
    assert_eq!(report.duplicates, 2);
    assert_eq!(harness.store.object_count(TEST_BUCKET), 1);
}

#[tokio::test]
async fn test_progress_events_ordered_per_file() {
    let mut harness = test_pipeline();
    harness
        .pipeline
        .ingest_batch(
            sources(vec![("ordered.wav", make_wav(500_000, 44_100, 2, 9))]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut percents = Vec::new();
    let mut saw_batch_start = false;
    let mut saw_batch_complete = false;
    while let Ok(event) = harness.events.try_recv() {
        match event.event_type.as_str() {
            "batch-start" => saw_batch_start = true,
            "batch-complete" => saw_batch_complete = true,
            "file-progress" | "file-complete" => {
                if let Some(p) = event.payload["percent"].as_u64() {
                    percents.push(p);
                }
            }
            _ => {}
        }
    }

    assert!(saw_batch_start);
    assert!(saw_batch_complete);
    // Monotonically non-decreasing progress for a single file
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
    assert_eq!(percents.last().copied(), Some(100));
}

#[tokio::test]
async fn test_extensionless_name_stored_unchanged() {
    let harness = test_pipeline();
    let report = harness
        .pipeline
        .ingest_batch(
            sources(vec![("rawdump", vec![9u8; 1000])]),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.results[0].key.as_deref(), Some("rawdump"));

    let head = harness.store.head_object(TEST_BUCKET, "rawdump").await.unwrap();
    assert_eq!(head.content_type, "application/octet-stream");
}
