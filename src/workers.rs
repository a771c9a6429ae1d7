//! Bounded worker pool with backpressure and adaptive throttling.
//!
//! N workers drain a queue of depth 2×N. Submission never blocks: a full
//! queue answers `Overloaded` immediately. Batch submission is gated by an
//! inner semaphore sized to the worker count, so one large batch can only
//! ever hold that many queue slots. Every job receives a context whose
//! throttle it is expected to poll between reads of its input stream.

use crate::monitor::{MemoryProbe, PressureLatch};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors from pool submission and shutdown.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Worker queue is full")]
    Overloaded,

    #[error("Worker pool is shutting down")]
    ShuttingDown,

    #[error("Shutdown deadline exceeded with work still active")]
    Timeout,

    #[error("Submission cancelled")]
    Cancelled,
}

/// Pick the worker count for a host: one core keeps one worker, four cores
/// reserve one for the system, larger hosts get three quarters.
pub fn worker_count(configured_max: usize, cores: usize) -> usize {
    let heuristic = match cores {
        0 | 1 => 1,
        2 => 2,
        3 => 2,
        4 => 3,
        n => ((n as f64) * 0.75).round() as usize,
    };
    heuristic.min(configured_max.max(1)).max(1)
}

/// The job body: an async closure taking the pool-provided context.
pub type Job = Box<dyn FnOnce(JobContext) -> BoxFuture<'static, Result<(), crate::error::IngestError>> + Send>;

/// One unit of work.
pub struct WorkItem {
    pub id: String,
    pub label: String,
    job: Job,
    result_tx: oneshot::Sender<Result<(), crate::error::IngestError>>,
    /// Held for the item's lifetime when it entered through `submit_batch`.
    _batch_permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl WorkItem {
    pub fn new(
        label: impl Into<String>,
        job: Job,
    ) -> (Self, oneshot::Receiver<Result<(), crate::error::IngestError>>) {
        let (result_tx, result_rx) = oneshot::channel();
        (
            Self {
                id: uuid::Uuid::new_v4().to_string(),
                label: label.into(),
                job,
                result_tx,
                _batch_permit: None,
            },
            result_rx,
        )
    }
}

/// Handed to every job; the throttle must be polled between stream reads.
#[derive(Clone)]
pub struct JobContext {
    pub throttle: Arc<ThrottleGate>,
    pub cancel: CancellationToken,
}

/// Throttle predicate shared by the pool and the pipeline.
///
/// True when resident memory is over the soft cap, when the watchdog latch
/// is engaged, or when more items are active than workers.
pub struct ThrottleGate {
    probe: Arc<dyn MemoryProbe>,
    latch: Arc<PressureLatch>,
    soft_cap_bytes: u64,
    enabled: bool,
    active: Arc<AtomicUsize>,
    workers: usize,
}

/// Minimum pause when throttled.
const THROTTLE_PAUSE: Duration = Duration::from_millis(50);

impl ThrottleGate {
    pub fn should_throttle(&self) -> bool {
        if !self.enabled {
            return false;
        }
        if self.latch.engaged() {
            return true;
        }
        if self.active.load(Ordering::Relaxed) > self.workers {
            return true;
        }
        self.probe.resident_bytes() > self.soft_cap_bytes
    }

    /// Yield for at least 50 ms when the predicate holds.
    pub async fn yield_if_throttled(&self) {
        while self.should_throttle() {
            tokio::time::sleep(THROTTLE_PAUSE).await;
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub active: usize,
    pub processed: u64,
    pub failed: u64,
    pub total_submitted: u64,
}

struct Counters {
    active: Arc<AtomicUsize>,
    processed: AtomicU64,
    failed: AtomicU64,
    total_submitted: AtomicU64,
}

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub item_timeout: Duration,
    pub soft_cap_bytes: u64,
    pub throttle_enabled: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            item_timeout: Duration::from_secs(120),
            soft_cap_bytes: 800 * 1024 * 1024,
            throttle_enabled: true,
        }
    }
}

pub struct WorkerPool {
    tx: Mutex<Option<mpsc::Sender<WorkItem>>>,
    workers: usize,
    queue_capacity: usize,
    counters: Arc<Counters>,
    batch_gate: Arc<Semaphore>,
    throttle: Arc<ThrottleGate>,
    cancel: CancellationToken,
    accepting: AtomicBool,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start the pool: `worker_count(config.max_workers, cores)` workers
    /// over a queue of twice that depth.
    pub fn start(
        config: PoolConfig,
        probe: Arc<dyn MemoryProbe>,
        latch: Arc<PressureLatch>,
    ) -> Arc<Self> {
        let workers = worker_count(config.max_workers, num_cpus::get());
        let queue_capacity = workers * 2;
        let (tx, rx) = mpsc::channel::<WorkItem>(queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let active = Arc::new(AtomicUsize::new(0));
        let counters = Arc::new(Counters {
            active: active.clone(),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_submitted: AtomicU64::new(0),
        });

        let throttle = Arc::new(ThrottleGate {
            probe,
            latch,
            soft_cap_bytes: config.soft_cap_bytes,
            enabled: config.throttle_enabled,
            active: active.clone(),
            workers,
        });

        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            handles.push(tokio::spawn(Self::worker_loop(
                worker_id,
                rx.clone(),
                counters.clone(),
                throttle.clone(),
                cancel.clone(),
                config.item_timeout,
            )));
        }

        info!(
            "Worker pool started: {} workers, queue depth {}",
            workers, queue_capacity
        );

        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            workers,
            queue_capacity,
            counters,
            batch_gate: Arc::new(Semaphore::new(workers)),
            throttle,
            cancel,
            accepting: AtomicBool::new(true),
            handles: Mutex::new(handles),
        })
    }

    async fn worker_loop(
        worker_id: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
        counters: Arc<Counters>,
        throttle: Arc<ThrottleGate>,
        cancel: CancellationToken,
        item_timeout: Duration,
    ) {
        loop {
            let item = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(item) = item else {
                debug!("Worker {} draining: queue closed", worker_id);
                return;
            };

            counters.active.fetch_add(1, Ordering::SeqCst);
            let ctx = JobContext {
                throttle: throttle.clone(),
                cancel: cancel.clone(),
            };

            let outcome = match tokio::time::timeout(item_timeout, (item.job)(ctx)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Work item {} ({}) timed out", item.id, item.label);
                    Err(crate::error::IngestError::Timeout)
                }
            };

            counters.active.fetch_sub(1, Ordering::SeqCst);
            match &outcome {
                Ok(()) => counters.processed.fetch_add(1, Ordering::Relaxed),
                Err(_) => counters.failed.fetch_add(1, Ordering::Relaxed),
            };
            // Receiver may have gone away; that is the submitter's choice.
            let _ = item.result_tx.send(outcome);
        }
    }

    /// Queue one item. Returns immediately; `Overloaded` when the queue is
    /// full, `ShuttingDown` after `shutdown`.
    pub fn submit(&self, item: WorkItem) -> Result<(), PoolError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(PoolError::ShuttingDown);
        }
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(PoolError::ShuttingDown);
        };
        self.counters.total_submitted.fetch_add(1, Ordering::Relaxed);
        match tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(PoolError::Overloaded),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PoolError::ShuttingDown),
        }
    }

    /// Queue a batch. Each item first takes a slot on the inner semaphore
    /// (sized to the worker count) and holds it until the item finishes, so
    /// a batch can never occupy the whole queue.
    pub async fn submit_batch(
        &self,
        items: Vec<WorkItem>,
    ) -> Result<(), PoolError> {
        for mut item in items {
            if !self.accepting.load(Ordering::Acquire) {
                return Err(PoolError::ShuttingDown);
            }
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => return Err(PoolError::Cancelled),
                permit = self.batch_gate.clone().acquire_owned() => {
                    permit.map_err(|_| PoolError::ShuttingDown)?
                }
            };
            item._batch_permit = Some(permit);

            let tx = {
                let tx = self.tx.lock();
                tx.as_ref().cloned().ok_or(PoolError::ShuttingDown)?
            };
            self.counters.total_submitted.fetch_add(1, Ordering::Relaxed);
            tx.send(item).await.map_err(|_| PoolError::ShuttingDown)?;
        }
        Ok(())
    }

    /// Stop intake, then wait up to `timeout` for active work to finish.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), PoolError> {
        self.accepting.store(false, Ordering::Release);
        // Closing the channel lets workers drain and exit.
        self.tx.lock().take();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => {
                info!("Worker pool drained");
                Ok(())
            }
            Err(_) => {
                self.cancel.cancel();
                warn!("Worker pool shutdown timed out with work active");
                Err(PoolError::Timeout)
            }
        }
    }

    pub fn throttle(&self) -> Arc<ThrottleGate> {
        self.throttle.clone()
    }

    pub fn stats(&self) -> PoolStats {
        let queued = self
            .tx
            .lock()
            .as_ref()
            .map(|tx| self.queue_capacity - tx.capacity())
            .unwrap_or(0);
        PoolStats {
            workers: self.workers,
            queue_size: queued,
            queue_capacity: self.queue_capacity,
            active: self.counters.active.load(Ordering::SeqCst),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            total_submitted: self.counters.total_submitted.load(Ordering::Relaxed),
        }
    }
}
