//! Streaming ingest pipeline.
//!
//! Two passes over every payload: a hash pass that folds pooled-buffer
//! reads into a streaming digest, and an upload pass that streams the same
//! bytes to the object store behind the store circuit breaker. Between the
//! passes sits the dedup gate — a payload whose digest is already in the
//! batch view short-circuits as a duplicate. Nothing ever buffers a whole
//! payload in memory.

use crate::breaker::BreakerManager;
use crate::dedup::DedupIndex;
use crate::error::IngestError;
use crate::events::{Phase, ProgressSink};
use crate::hashing::{BufferPool, StreamingHasher};
use crate::metrics::Metrics;
use crate::notify::OneshotNotifier;
use crate::session::{SessionStatus, SessionStore};
use crate::storage::{ObjectStore, PayloadReader};
use crate::types::{canonical_key, content_type_for_key, meta_keys, ContentDigest};
use crate::workers::{ThrottleGate, WorkItem, WorkerPool};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Breaker guarding every outbound store call.
pub const STORE_DEPENDENCY: &str = "object-store";

/// A payload the pipeline can read twice (hash pass, then upload pass).
#[async_trait]
pub trait PayloadSource: Send + Sync {
    /// Original client-supplied filename.
    fn name(&self) -> &str;

    /// Payload length in bytes.
    fn size(&self) -> u64;

    /// Open a fresh sequential reader over the payload.
    async fn open(&self) -> Result<PayloadReader, IngestError>;
}

/// Payload spooled to a local file (multipart ingest lands here).
pub struct FileSource {
    name: String,
    path: PathBuf,
    size: u64,
    /// Owns the spool file's lifetime when backed by a tempfile.
    _guard: Option<tempfile::TempPath>,
}

impl FileSource {
    pub fn new(name: impl Into<String>, path: PathBuf, size: u64) -> Self {
        Self {
            name: name.into(),
            path,
            size,
            _guard: None,
        }
    }

    /// A source over a temp file that is deleted when the source drops.
    pub fn from_temp(name: impl Into<String>, temp: tempfile::TempPath, size: u64) -> Self {
        Self {
            name: name.into(),
            path: temp.to_path_buf(),
            size,
            _guard: Some(temp),
        }
    }
}

#[async_trait]
impl PayloadSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn open(&self) -> Result<PayloadReader, IngestError> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| IngestError::Internal(format!("open payload: {e}")))?;
        Ok(Box::new(file))
    }
}

/// Small in-memory payload; tests and header-only cases.
pub struct BytesSource {
    name: String,
    data: bytes::Bytes,
}

impl BytesSource {
    pub fn new(name: impl Into<String>, data: impl Into<bytes::Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

#[async_trait]
impl PayloadSource for BytesSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn open(&self) -> Result<PayloadReader, IngestError> {
        Ok(Box::new(std::io::Cursor::new(self.data.clone())))
    }
}

/// A verified resumable session's scratch bytes.
pub struct SessionSource {
    sessions: Arc<SessionStore>,
    id: String,
    name: String,
    size: u64,
}

#[async_trait]
impl PayloadSource for SessionSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn open(&self) -> Result<PayloadReader, IngestError> {
        let file = self.sessions.open_reader(&self.id).await?;
        Ok(Box::new(file))
    }
}

/// Best-effort audio metadata extraction; external collaborator.
#[async_trait]
pub trait SidecarProbe: Send + Sync {
    /// Describe a payload (duration, codec, sample rate, ...). `None` when
    /// the probe cannot tell; the pipeline stores nothing extra then.
    async fn probe(&self, source: &dyn PayloadSource) -> Option<HashMap<String, String>>;
}

/// Outcome status of one file in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Duplicate,
    Error,
}

/// Per-file outcome record. Order in the report matches input order.
#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub filename: String,
    pub status: OutcomeStatus,
    /// Canonical stored key; present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<ContentDigest>,
    pub size: u64,
    pub message: String,
}

/// Batch response: four counts plus per-item detail.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub successful: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub total: usize,
    pub results: Vec<ItemReport>,
}

impl BatchReport {
    fn from_results(results: Vec<ItemReport>) -> Self {
        let successful = results
            .iter()
            .filter(|r| r.status == OutcomeStatus::Success)
            .count();
        let duplicates = results
            .iter()
            .filter(|r| r.status == OutcomeStatus::Duplicate)
            .count();
        let failed = results
            .iter()
            .filter(|r| r.status == OutcomeStatus::Error)
            .count();
        Self {
            successful,
            duplicates,
            failed,
            total: results.len(),
            results,
        }
    }
}

/// Pipeline knobs, extracted from `config.ingest`.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub bucket: String,
    pub suffix: String,
    pub io_buffer_size: usize,
    pub progress_interval_bytes: u64,
    pub batch_threshold: usize,
}

impl PipelineConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            bucket: config.store.bucket.clone(),
            suffix: config.ingest.suffix.clone(),
            io_buffer_size: config.ingest.io_buffer_size,
            progress_interval_bytes: config.ingest.progress_interval_bytes,
            batch_threshold: config.ingest.batch_threshold,
        }
    }
}

/// The ingest pipeline. Cheap to clone through its inner Arc; worker-pool
/// jobs hold clones of the inner state.
pub struct IngestPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    store: Arc<dyn ObjectStore>,
    breakers: Arc<BreakerManager>,
    sink: Arc<ProgressSink>,
    notifier: Arc<dyn OneshotNotifier>,
    sidecar: Option<Arc<dyn SidecarProbe>>,
    pool: Option<Arc<WorkerPool>>,
    throttle: Option<Arc<ThrottleGate>>,
    metrics: Option<Arc<Metrics>>,
    config: PipelineConfig,
}

impl IngestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        breakers: Arc<BreakerManager>,
        sink: Arc<ProgressSink>,
        notifier: Arc<dyn OneshotNotifier>,
        sidecar: Option<Arc<dyn SidecarProbe>>,
        pool: Option<Arc<WorkerPool>>,
        metrics: Option<Arc<Metrics>>,
        config: PipelineConfig,
    ) -> Self {
        let throttle = pool.as_ref().map(|p| p.throttle());
        Self {
            inner: Arc::new(PipelineInner {
                store,
                breakers,
                sink,
                notifier,
                sidecar,
                pool,
                throttle,
                metrics,
                config,
            }),
        }
    }

    /// Ingest a batch. Setup failures (bucket, dedup snapshot) fail the
    /// whole batch; per-file failures are contained in the report.
    pub async fn ingest_batch(
        &self,
        sources: Vec<Arc<dyn PayloadSource>>,
        cancel: CancellationToken,
    ) -> Result<BatchReport, IngestError> {
        PipelineInner::ingest_batch(self.inner.clone(), sources, cancel).await
    }

    /// Ingest the scratch bytes of a verified session, then release the
    /// session.
    pub async fn ingest_session(
        &self,
        sessions: Arc<SessionStore>,
        session_id: &str,
        cancel: CancellationToken,
    ) -> Result<BatchReport, IngestError> {
        let info = sessions.info(session_id)?;
        if info.status != SessionStatus::Verified {
            return Err(IngestError::IntegrityFailed(session_id.to_string()));
        }

        let source: Arc<dyn PayloadSource> = Arc::new(SessionSource {
            sessions: sessions.clone(),
            id: session_id.to_string(),
            name: info.filename.clone(),
            size: info.declared_size,
        });

        let report = self.ingest_batch(vec![source], cancel).await?;
        if report.failed == 0 {
            sessions.delete(session_id);
        }
        Ok(report)
    }
}

impl PipelineInner {
    #[instrument(skip_all, fields(files = sources.len()))]
    async fn ingest_batch(
        inner: Arc<Self>,
        sources: Vec<Arc<dyn PayloadSource>>,
        cancel: CancellationToken,
    ) -> Result<BatchReport, IngestError> {
        let bucket = inner.config.bucket.clone();

        let breaker = inner.breakers.get(STORE_DEPENDENCY);
        breaker
            .call(inner.store.ensure_bucket(&bucket))
            .await
            .map_err(|e| inner.count_breaker_reject(e))??;

        let dedup = Arc::new(
            breaker
                .call(DedupIndex::snapshot(inner.store.as_ref(), &bucket))
                .await
                .map_err(|e| inner.count_breaker_reject(e))??,
        );

        inner.sink.batch_start(sources.len()).await;
        info!(
            "Batch start: {} file(s), {} known digests",
            sources.len(),
            dedup.len()
        );

        let use_pool = inner.pool.is_some() && sources.len() > inner.config.batch_threshold;
        let results = if use_pool {
            Self::run_batch_pooled(inner.clone(), sources, dedup.clone(), cancel).await
        } else {
            let mut results = Vec::with_capacity(sources.len());
            for source in sources {
                if cancel.is_cancelled() {
                    results.push(inner.cancelled_report(source.as_ref()));
                    continue;
                }
                results.push(inner.process_file(source, dedup.clone(), cancel.clone()).await);
            }
            results
        };

        let report = BatchReport::from_results(results);
        inner
            .sink
            .batch_complete(
                report.successful,
                report.duplicates,
                report.failed,
                serde_json::to_value(&report.results).unwrap_or_default(),
            )
            .await;

        if report.failed > 0 {
            inner
                .notifier
                .send(&format!(
                    "Ingest batch finished with {} failure(s) out of {}",
                    report.failed, report.total
                ))
                .await;
        }

        info!(
            "Batch complete: {} ok, {} duplicate, {} failed",
            report.successful, report.duplicates, report.failed
        );
        Ok(report)
    }

    async fn run_batch_pooled(
        inner: Arc<Self>,
        sources: Vec<Arc<dyn PayloadSource>>,
        dedup: Arc<DedupIndex>,
        cancel: CancellationToken,
    ) -> Vec<ItemReport> {
        let pool = inner.pool.clone().expect("pooled path requires a pool");
        let slots: Arc<Mutex<Vec<Option<ItemReport>>>> =
            Arc::new(Mutex::new(vec![None; sources.len()]));

        let mut items = Vec::with_capacity(sources.len());
        let mut receivers = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            let inner = inner.clone();
            let source = source.clone();
            let dedup = dedup.clone();
            let cancel = cancel.clone();
            let slots = slots.clone();
            let (item, rx) = WorkItem::new(
                source.name().to_string(),
                Box::new(move |_ctx| {
                    Box::pin(async move {
                        let report = inner.process_file(source, dedup, cancel).await;
                        let failed = report.status == OutcomeStatus::Error;
                        slots.lock()[index] = Some(report);
                        if failed {
                            Err(IngestError::Internal("file failed".to_string()))
                        } else {
                            Ok(())
                        }
                    })
                }),
            );
            items.push(item);
            receivers.push(rx);
        }

        if let Err(e) = pool.submit_batch(items).await {
            warn!("Batch submission stopped early: {e}");
        }
        for rx in receivers {
            let _ = rx.await;
        }

        // Any slot a job never reached reports as failed submission.
        let mut slots = slots.lock();
        slots
            .drain(..)
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| ItemReport {
                    filename: sources[index].name().to_string(),
                    status: OutcomeStatus::Error,
                    key: None,
                    digest: None,
                    size: sources[index].size(),
                    message: "not scheduled".to_string(),
                })
            })
            .collect()
    }

    fn cancelled_report(&self, source: &dyn PayloadSource) -> ItemReport {
        ItemReport {
            filename: source.name().to_string(),
            status: OutcomeStatus::Error,
            key: None,
            digest: None,
            size: source.size(),
            message: IngestError::Cancelled.to_string(),
        }
    }

    /// Hash, dedup-gate, upload, record. Every failure is contained here.
    async fn process_file(
        &self,
        source: Arc<dyn PayloadSource>,
        dedup: Arc<DedupIndex>,
        cancel: CancellationToken,
    ) -> ItemReport {
        let filename = source.name().to_string();
        let size = source.size();

        match self.try_process_file(&source, &dedup, &cancel).await {
            Ok((key, digest)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.ingest_files_total.with_label_values(&["success"]).inc();
                    metrics.ingest_bytes_total.inc_by(size);
                }
                self.sink
                    .file_complete(&filename, Phase::Success, &format!("stored as {key}"))
                    .await;
                ItemReport {
                    filename,
                    status: OutcomeStatus::Success,
                    key: Some(key),
                    digest: Some(digest),
                    size,
                    message: "stored".to_string(),
                }
            }
            Err(IngestError::Duplicate(digest_hex)) => {
                if let Some(metrics) = &self.metrics {
                    metrics
                        .ingest_files_total
                        .with_label_values(&["duplicate"])
                        .inc();
                    metrics.dedup_hits_total.inc();
                }
                self.sink
                    .file_complete(&filename, Phase::Duplicate, "already stored")
                    .await;
                ItemReport {
                    filename,
                    status: OutcomeStatus::Duplicate,
                    key: None,
                    digest: ContentDigest::from_hex(&digest_hex),
                    size,
                    message: "duplicate payload".to_string(),
                }
            }
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.ingest_files_total.with_label_values(&["error"]).inc();
                }
                warn!("Ingest of {} failed: {}", filename, err);
                self.sink.error(&filename, &err.to_string()).await;
                ItemReport {
                    filename,
                    status: OutcomeStatus::Error,
                    key: None,
                    digest: None,
                    size,
                    message: err.to_string(),
                }
            }
        }
    }

    async fn try_process_file(
        &self,
        source: &Arc<dyn PayloadSource>,
        dedup: &DedupIndex,
        cancel: &CancellationToken,
    ) -> Result<(String, ContentDigest), IngestError> {
        let filename = source.name();
        let size = source.size();
        if size == 0 {
            return Err(IngestError::InvalidArgument("empty payload".to_string()));
        }

        // --- Hash pass: 0..30% ---
        let digest = self.hash_pass(source, cancel).await?;
        debug!("{} hashed: {}", filename, digest);

        // Claim the digest; the loser of a same-batch race becomes the
        // duplicate. A claim is released again if the upload fails so a
        // later file (or retry) can take it.
        if !dedup.claim(&digest) {
            return Err(IngestError::Duplicate(digest.to_string()));
        }

        let key = canonical_key(filename, &self.config.suffix);
        if let Err(err) = self.upload_pass(source, &key, &digest, cancel).await {
            dedup.release(&digest);
            return Err(err);
        }

        // Best-effort sidecar metadata; never blocks the outcome.
        if let Some(probe) = &self.sidecar {
            if let Some(extra) = probe.probe(source.as_ref()).await {
                let mut merged = self.canonical_metadata(filename, &digest);
                merged.extend(extra);
                let result = self
                    .store
                    .copy_object_replace_metadata(&self.config.bucket, &key, merged)
                    .await;
                if let Err(e) = result {
                    warn!("Sidecar metadata for {} not stored: {}", key, e);
                }
            }
        }

        Ok((key, digest))
    }

    async fn hash_pass(
        &self,
        source: &Arc<dyn PayloadSource>,
        cancel: &CancellationToken,
    ) -> Result<ContentDigest, IngestError> {
        let filename = source.name();
        let size = source.size();
        let mut reader = source.open().await?;
        let mut hasher = StreamingHasher::new();
        let mut buf = BufferPool::global().checkout(self.config.io_buffer_size);
        let mut hashed: u64 = 0;
        let mut since_progress: u64 = 0;

        self.sink.file_progress(filename, Phase::Hashing, 0, "hashing");

        loop {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            if let Some(gate) = &self.throttle {
                gate.yield_if_throttled().await;
            }

            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| IngestError::Internal(format!("read payload: {e}")))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            hashed += n as u64;
            since_progress += n as u64;

            if since_progress >= self.config.progress_interval_bytes {
                since_progress = 0;
                let percent = ((hashed.min(size)) * 30 / size.max(1)) as u8;
                self.sink
                    .file_progress(filename, Phase::Hashing, percent, "hashing");
            }
        }

        if hashed != size {
            return Err(IngestError::InvalidArgument(format!(
                "payload size changed during hashing: declared {size}, read {hashed}"
            )));
        }

        Ok(hasher.finalize())
    }

    async fn upload_pass(
        &self,
        source: &Arc<dyn PayloadSource>,
        key: &str,
        digest: &ContentDigest,
        cancel: &CancellationToken,
    ) -> Result<(), IngestError> {
        let filename = source.name().to_string();
        let size = source.size();

        self.sink
            .file_progress(&filename, Phase::Uploading, 30, "uploading");

        let inner = source.open().await?;
        let reader: PayloadReader = Box::new(ProgressReader::new(
            inner,
            self.sink.clone(),
            self.throttle.clone(),
            cancel.clone(),
            filename.clone(),
            size,
            self.config.progress_interval_bytes,
        ));

        let metadata = self.canonical_metadata(&filename, digest);
        let content_type = content_type_for_key(key);

        let breaker = self.breakers.get(STORE_DEPENDENCY);
        let outcome = breaker
            .call(self.store.put_stream(
                &self.config.bucket,
                key,
                reader,
                size,
                content_type,
                metadata,
            ))
            .await
            .map_err(|e| self.count_breaker_reject(e))??;

        if outcome.stored_size != size {
            return Err(IngestError::Internal(format!(
                "stored size {} differs from payload size {}",
                outcome.stored_size, size
            )));
        }

        Ok(())
    }

    /// The canonical user metadata every stored object carries.
    fn canonical_metadata(
        &self,
        original_name: &str,
        digest: &ContentDigest,
    ) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(meta_keys::FILE_HASH.to_string(), digest.to_string());
        map.insert(
            meta_keys::UPLOAD_DATE.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        map.insert(
            meta_keys::ORIGINAL_NAME.to_string(),
            original_name.to_string(),
        );
        map
    }

    fn count_breaker_reject(&self, err: IngestError) -> IngestError {
        if let (IngestError::CircuitOpen(dep), Some(metrics)) = (&err, &self.metrics) {
            metrics.breaker_open_total.with_label_values(&[dep.as_str()]).inc();
        }
        err
    }
}

/// AsyncRead wrapper that reports upload progress (30..100%) and observes
/// throttle and cancellation between reads.
struct ProgressReader {
    inner: PayloadReader,
    sink: Arc<ProgressSink>,
    throttle: Option<Arc<ThrottleGate>>,
    cancel: CancellationToken,
    filename: String,
    size: u64,
    sent: u64,
    since_progress: u64,
    progress_interval: u64,
    pause: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl ProgressReader {
    #[allow(clippy::too_many_arguments)]
    fn new(
        inner: PayloadReader,
        sink: Arc<ProgressSink>,
        throttle: Option<Arc<ThrottleGate>>,
        cancel: CancellationToken,
        filename: String,
        size: u64,
        progress_interval: u64,
    ) -> Self {
        Self {
            inner,
            sink,
            throttle,
            cancel,
            filename,
            size,
            sent: 0,
            since_progress: 0,
            progress_interval,
            pause: None,
        }
    }
}

impl AsyncRead for ProgressReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        use std::future::Future;

        let this = self.get_mut();

        if this.cancel.is_cancelled() {
            return Poll::Ready(Err(std::io::Error::other("upload cancelled")));
        }

        // An engaged throttle inserts a sleep before the next read.
        if let Some(pause) = this.pause.as_mut() {
            match pause.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => {
                    this.pause = None;
                }
            }
        }
        if let Some(gate) = &this.throttle {
            if gate.should_throttle() {
                let mut sleep = Box::pin(tokio::time::sleep(std::time::Duration::from_millis(50)));
                // Register the timer before parking.
                if sleep.as_mut().poll(cx).is_pending() {
                    this.pause = Some(sleep);
                    return Poll::Pending;
                }
            }
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - before) as u64;
                this.sent += n;
                this.since_progress += n;
                if this.since_progress >= this.progress_interval || this.sent == this.size {
                    this.since_progress = 0;
                    let percent = 30 + (this.sent.min(this.size) * 70 / this.size.max(1)) as u8;
                    this.sink
                        .file_progress(&this.filename, Phase::Uploading, percent, "uploading");
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
