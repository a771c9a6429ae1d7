//! Progress/event sink adapter.
//!
//! The pipeline reports through this adapter only; the transport behind it
//! is a `Broadcaster` (WebSocket fan-out in production, a channel in
//! tests). Delivery is best-effort and never blocks ingest: transient
//! per-chunk progress is dropped on a full sink, terminal outcomes get a
//! short bounded retry before they too are dropped and counted.

use crate::metrics::Metrics;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Progress phases carried on file events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Hashing,
    Uploading,
    Duplicate,
    Success,
    Error,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Hashing => "hashing",
            Phase::Uploading => "uploading",
            Phase::Duplicate => "duplicate",
            Phase::Success => "success",
            Phase::Error => "error",
        }
    }
}

/// Event type names on the wire.
pub mod event_types {
    pub const BATCH_START: &str = "batch-start";
    pub const FILE_PROGRESS: &str = "file-progress";
    pub const FILE_COMPLETE: &str = "file-complete";
    pub const BATCH_COMPLETE: &str = "batch-complete";
    pub const ERROR: &str = "error";
}

/// Non-blocking event transport. Returns whether the event was accepted;
/// a rejected event is the caller's to retry or drop.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, event_type: &str, payload: Value) -> bool;
}

/// A broadcast event, as seen by the transport's consumer.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: String,
    pub payload: Value,
}

/// Broadcaster over a bounded channel. The receiving half belongs to the
/// HTTP layer (or a test).
pub struct ChannelBroadcaster {
    tx: mpsc::Sender<Event>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast(&self, event_type: &str, payload: Value) -> bool {
        self.tx
            .try_send(Event {
                event_type: event_type.to_string(),
                payload,
            })
            .is_ok()
    }
}

/// Swallows everything. Default when no consumer is attached.
pub struct NullBroadcaster;

impl Broadcaster for NullBroadcaster {
    fn broadcast(&self, _event_type: &str, _payload: Value) -> bool {
        true
    }
}

/// Retry budget for terminal events.
const TERMINAL_RETRIES: u32 = 3;
const TERMINAL_RETRY_PAUSE: Duration = Duration::from_millis(50);

/// The adapter the pipeline emits through.
pub struct ProgressSink {
    broadcaster: Arc<dyn Broadcaster>,
    metrics: Option<Arc<Metrics>>,
    dropped: AtomicU64,
}

impl ProgressSink {
    pub fn new(broadcaster: Arc<dyn Broadcaster>, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            broadcaster,
            metrics,
            dropped: AtomicU64::new(0),
        }
    }

    /// Events dropped since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn count_drop(&self, event_type: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.events_dropped_total.inc();
        }
        debug!("Dropped {} event (sink full)", event_type);
    }

    /// Lossy transient emit: one attempt, drop on a full sink.
    fn emit_transient(&self, event_type: &str, payload: Value) {
        if !self.broadcaster.broadcast(event_type, payload) {
            self.count_drop(event_type);
        }
    }

    /// At-least-once-within-budget terminal emit.
    async fn emit_terminal(&self, event_type: &str, payload: Value) {
        for attempt in 0..TERMINAL_RETRIES {
            if self.broadcaster.broadcast(event_type, payload.clone()) {
                return;
            }
            if attempt + 1 < TERMINAL_RETRIES {
                tokio::time::sleep(TERMINAL_RETRY_PAUSE).await;
            }
        }
        self.count_drop(event_type);
    }

    pub async fn batch_start(&self, total_files: usize) {
        self.emit_terminal(
            event_types::BATCH_START,
            json!({ "total": total_files }),
        )
        .await;
    }

    /// Per-chunk progress; a full sink drops it.
    pub fn file_progress(&self, filename: &str, phase: Phase, percent: u8, message: &str) {
        self.emit_transient(
            event_types::FILE_PROGRESS,
            json!({
                "filename": filename,
                "phase": phase.as_str(),
                "percent": percent.min(100),
                "message": message,
            }),
        );
    }

    pub async fn file_complete(&self, filename: &str, phase: Phase, message: &str) {
        self.emit_terminal(
            event_types::FILE_COMPLETE,
            json!({
                "filename": filename,
                "phase": phase.as_str(),
                "percent": 100,
                "message": message,
            }),
        )
        .await;
    }

    pub async fn batch_complete(
        &self,
        successful: usize,
        duplicates: usize,
        failed: usize,
        outcomes: Value,
    ) {
        self.emit_terminal(
            event_types::BATCH_COMPLETE,
            json!({
                "successful": successful,
                "duplicates": duplicates,
                "failed": failed,
                "total": successful + duplicates + failed,
                "results": outcomes,
            }),
        )
        .await;
    }

    pub async fn error(&self, filename: &str, message: &str) {
        self.emit_terminal(
            event_types::ERROR,
            json!({
                "filename": filename,
                "phase": Phase::Error.as_str(),
                "message": message,
            }),
        )
        .await;
    }
}
