//! Shared test infrastructure for integration tests
//!
//! Provides data generators (WAV payloads, seeded binary), a pipeline
//! harness over the in-memory store, and a full router for protocol-level
//! tests.

#![allow(dead_code)]

use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wavevault::api::AppState;
use wavevault::breaker::{BreakerConfig, BreakerManager};
use wavevault::events::{ChannelBroadcaster, Event, ProgressSink};
use wavevault::metrics::Metrics;
use wavevault::monitor::{FixedProbe, PressureLatch};
use wavevault::notify::LogNotifier;
use wavevault::pipeline::{IngestPipeline, PipelineConfig};
use wavevault::ratelimit::{RateLimiter, RateLimits};
use wavevault::session::SessionStore;
use wavevault::storage::MemoryStore;
use wavevault::workers::{PoolConfig, WorkerPool};

pub const TEST_BUCKET: &str = "vault";

/// WAV header length; byte-for-byte preservation of it is asserted in the
/// round-trip tests.
pub const WAV_HEADER_LEN: usize = 44;

// === Data generators ===

/// Generate deterministic binary data
pub fn generate_binary(size: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; size];
    rng.fill(&mut data[..]);
    data
}

/// Build a canonical 44-byte PCM WAV header followed by `data_len` bytes of
/// seeded sample data.
pub fn make_wav(data_len: usize, sample_rate: u32, channels: u16, seed: u64) -> Vec<u8> {
    let bits_per_sample: u16 = 16;
    let byte_rate = sample_rate * channels as u32 * (bits_per_sample as u32 / 8);
    let block_align = channels * (bits_per_sample / 8);

    let mut wav = Vec::with_capacity(WAV_HEADER_LEN + data_len);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes()); // PCM chunk size
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&(data_len as u32).to_le_bytes());
    assert_eq!(wav.len(), WAV_HEADER_LEN);

    wav.extend_from_slice(&generate_binary(data_len, seed));
    wav
}

/// One second of 44.1 kHz 16-bit mono audio: 88,244 bytes with header.
pub fn one_second_wav(seed: u64) -> Vec<u8> {
    make_wav(88_200, 44_100, 1, seed)
}

// === Pipeline harness ===

pub struct TestPipeline {
    pub store: Arc<MemoryStore>,
    pub pipeline: Arc<IngestPipeline>,
    pub events: tokio::sync::mpsc::Receiver<Event>,
}

/// Pipeline over a fresh in-memory store; no pool, no metrics.
pub fn test_pipeline() -> TestPipeline {
    test_pipeline_with(None)
}

pub fn test_pipeline_with(pool: Option<Arc<WorkerPool>>) -> TestPipeline {
    let store = Arc::new(MemoryStore::new());
    let (broadcaster, events) = ChannelBroadcaster::new(1024);
    let pipeline = Arc::new(IngestPipeline::new(
        store.clone(),
        Arc::new(BreakerManager::new(BreakerConfig::default())),
        Arc::new(ProgressSink::new(Arc::new(broadcaster), None)),
        Arc::new(LogNotifier),
        None,
        pool,
        None,
        PipelineConfig {
            bucket: TEST_BUCKET.to_string(),
            suffix: "_raw".to_string(),
            io_buffer_size: 64 * 1024,
            progress_interval_bytes: 64 * 1024,
            batch_threshold: 2,
        },
    ));
    TestPipeline {
        store,
        pipeline,
        events,
    }
}

/// A worker pool that never throttles, for batch-path tests.
pub fn test_pool(max_workers: usize) -> Arc<WorkerPool> {
    WorkerPool::start(
        PoolConfig {
            max_workers,
            item_timeout: std::time::Duration::from_secs(30),
            soft_cap_bytes: u64::MAX,
            throttle_enabled: false,
        },
        Arc::new(FixedProbe::new(0, u64::MAX)),
        Arc::new(PressureLatch::default()),
    )
}

// === Full application harness ===

pub struct TestApp {
    pub router: axum::Router,
    pub store: Arc<MemoryStore>,
    pub sessions: Arc<SessionStore>,
    pub state: Arc<AppState>,
    _scratch: TempDir,
}

impl TestApp {
    /// App with generous rate limits; admission never interferes unless a
    /// test opts into real limits.
    pub fn new() -> Self {
        Self::with_limits(RateLimits {
            upload_rate: 1000.0,
            upload_burst: 1000.0,
            hash_rate: 1000.0,
            hash_burst: 1000.0,
            api_rate: 1000.0,
            api_burst: 1000.0,
        })
    }

    pub fn with_limits(limits: RateLimits) -> Self {
        let scratch = TempDir::new().expect("scratch dir");
        let store = Arc::new(MemoryStore::new());
        let sessions = Arc::new(
            SessionStore::new(scratch.path().join("sessions"), 64 * 1024 * 1024).unwrap(),
        );
        let metrics = Arc::new(Metrics::new());
        let (broadcaster, mut event_rx) = ChannelBroadcaster::new(1024);
        tokio::spawn(async move { while event_rx.recv().await.is_some() {} });

        let progress = Arc::new(ProgressSink::new(Arc::new(broadcaster), None));
        let breakers = Arc::new(BreakerManager::new(BreakerConfig::default()));
        let pool = test_pool(2);

        let pipeline = Arc::new(IngestPipeline::new(
            store.clone(),
            breakers.clone(),
            progress.clone(),
            Arc::new(LogNotifier),
            None,
            Some(pool.clone()),
            Some(metrics.clone()),
            PipelineConfig {
                bucket: TEST_BUCKET.to_string(),
                suffix: "_raw".to_string(),
                io_buffer_size: 64 * 1024,
                progress_interval_bytes: 64 * 1024,
                batch_threshold: 2,
            },
        ));

        let state = Arc::new(AppState {
            pipeline,
            sessions: sessions.clone(),
            limiter: Arc::new(RateLimiter::new(limits)),
            breakers,
            pool,
            progress,
            metrics,
            max_upload_size: 64 * 1024 * 1024,
            shutdown: CancellationToken::new(),
        });

        TestApp {
            router: wavevault::api::router(state.clone()),
            store,
            sessions,
            state,
            _scratch: scratch,
        }
    }
}
