//! Token-bucket rate limiting.
//!
//! Three class buckets (upload, hash, api) plus an on-demand table of
//! per-client buckets. `allow` is the non-blocking form; `wait` suspends
//! until a token, the deadline, or cancellation. An adaptive controller
//! revisits the upload/hash rates on a fixed cadence using resident memory
//! and the observed denial ratio.

use crate::error::IngestError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Admission classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitClass {
    Upload,
    Hash,
    Api,
}

impl LimitClass {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitClass::Upload => "upload",
            LimitClass::Hash => "hash",
            LimitClass::Api => "api",
        }
    }
}

struct BucketInner {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket. The whole refill-and-take is one short critical
/// section, so concurrent callers always see consistent token math.
pub struct TokenBucket {
    inner: Mutex<BucketInner>,
    allowed: AtomicU64,
    denied: AtomicU64,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            inner: Mutex::new(BucketInner {
                rate,
                burst,
                tokens: burst,
                last_refill: Instant::now(),
            }),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    /// Take one token if available. Non-blocking.
    pub fn allow(&self) -> bool {
        let admitted = {
            let mut inner = self.inner.lock();
            let elapsed = inner.last_refill.elapsed().as_secs_f64();
            inner.tokens = (inner.tokens + elapsed * inner.rate).min(inner.burst);
            inner.last_refill = Instant::now();
            if inner.tokens >= 1.0 {
                inner.tokens -= 1.0;
                true
            } else {
                false
            }
        };
        if admitted {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    /// Suspend until a token is available, the deadline passes, or the
    /// caller cancels.
    pub async fn wait(
        &self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), IngestError> {
        let give_up = Instant::now() + deadline;
        loop {
            if self.allow() {
                return Ok(());
            }
            let nap = {
                let inner = self.inner.lock();
                // Time until one full token accrues, bounded below so a
                // mis-tuned rate cannot busy-spin.
                Duration::from_secs_f64(((1.0 - inner.tokens).max(0.0) / inner.rate).max(0.005))
            };
            let now = Instant::now();
            if now >= give_up {
                return Err(IngestError::Timeout);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                _ = tokio::time::sleep(nap.min(give_up - now)) => {}
            }
        }
    }

    pub fn rate(&self) -> f64 {
        self.inner.lock().rate
    }

    /// Scale the refill rate, clamped to `[floor, ceiling]`.
    pub fn scale_rate(&self, factor: f64, floor: f64, ceiling: f64) {
        let mut inner = self.inner.lock();
        inner.rate = (inner.rate * factor).clamp(floor, ceiling);
    }

    /// Drain the (allowed, denied) counters accumulated since the last
    /// call. Used by the adaptive controller's windowed denial ratio.
    pub fn take_window(&self) -> (u64, u64) {
        (
            self.allowed.swap(0, Ordering::Relaxed),
            self.denied.swap(0, Ordering::Relaxed),
        )
    }
}

struct ClientEntry {
    bucket: TokenBucket,
    last_touch: Instant,
}

/// Soft cap on tracked clients; crossing it reaps the LRU half.
const MAX_CLIENTS: usize = 100;
const REAP_COUNT: usize = 50;

/// Per-client bucket defaults: one request per two seconds, no burst
/// beyond the first.
const CLIENT_RATE: f64 = 0.5;
const CLIENT_BURST: f64 = 1.0;

/// Class limit tuning.
#[derive(Debug, Clone)]
pub struct RateLimits {
    pub upload_rate: f64,
    pub upload_burst: f64,
    pub hash_rate: f64,
    pub hash_burst: f64,
    pub api_rate: f64,
    pub api_burst: f64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            upload_rate: 2.0,
            upload_burst: 2.0,
            hash_rate: 10.0,
            hash_burst: 5.0,
            api_rate: 20.0,
            api_burst: 10.0,
        }
    }
}

/// Class buckets plus the per-client table.
pub struct RateLimiter {
    upload: TokenBucket,
    hash: TokenBucket,
    api: TokenBucket,
    clients: Mutex<HashMap<String, ClientEntry>>,
    base: RateLimits,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            upload: TokenBucket::new(limits.upload_rate, limits.upload_burst),
            hash: TokenBucket::new(limits.hash_rate, limits.hash_burst),
            api: TokenBucket::new(limits.api_rate, limits.api_burst),
            clients: Mutex::new(HashMap::new()),
            base: limits,
        }
    }

    fn bucket(&self, class: LimitClass) -> &TokenBucket {
        match class {
            LimitClass::Upload => &self.upload,
            LimitClass::Hash => &self.hash,
            LimitClass::Api => &self.api,
        }
    }

    /// Non-blocking admission for a class.
    pub fn allow(&self, class: LimitClass) -> bool {
        self.bucket(class).allow()
    }

    /// Blocking admission for a class.
    pub async fn wait(
        &self,
        class: LimitClass,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), IngestError> {
        self.bucket(class).wait(deadline, cancel).await
    }

    /// Non-blocking admission for one client key. Buckets are created on
    /// demand and reaped LRU past the soft cap.
    pub fn allow_client(&self, client_key: &str) -> bool {
        let mut clients = self.clients.lock();

        if !clients.contains_key(client_key) && clients.len() >= MAX_CLIENTS {
            Self::reap_lru(&mut clients);
        }

        let entry = clients
            .entry(client_key.to_string())
            .or_insert_with(|| ClientEntry {
                bucket: TokenBucket::new(CLIENT_RATE, CLIENT_BURST),
                last_touch: Instant::now(),
            });
        entry.last_touch = Instant::now();
        entry.bucket.allow()
    }

    fn reap_lru(clients: &mut HashMap<String, ClientEntry>) {
        let mut by_age: Vec<(String, Instant)> = clients
            .iter()
            .map(|(k, v)| (k.clone(), v.last_touch))
            .collect();
        by_age.sort_by_key(|(_, touched)| *touched);
        for (key, _) in by_age.into_iter().take(REAP_COUNT) {
            clients.remove(&key);
        }
        debug!("Reaped rate-limiter client table to {} entries", clients.len());
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().len()
    }

    /// Current rates, for the status endpoint.
    pub fn current_rates(&self) -> [(&'static str, f64); 3] {
        [
            ("upload", self.upload.rate()),
            ("hash", self.hash.rate()),
            ("api", self.api.rate()),
        ]
    }

    /// One adaptive step. Memory pressure halves the upload and hash rates;
    /// otherwise the upload rate trails the denial ratio — grow 10% when
    /// more than a fifth of callers are being denied, decay 10% when almost
    /// none are.
    pub fn adjust(&self, memory_pressure: bool) {
        let (allowed_u, denied_u) = self.upload.take_window();
        let (allowed_h, denied_h) = self.hash.take_window();
        let (allowed_a, denied_a) = self.api.take_window();
        let allowed = allowed_u + allowed_h + allowed_a;
        let denied = denied_u + denied_h + denied_a;

        let floor = self.base.upload_rate * 0.25;
        let ceiling = self.base.upload_rate * 5.0;

        if memory_pressure {
            self.upload
                .scale_rate(0.5, floor, ceiling.max(self.base.upload_rate));
            self.hash.scale_rate(
                0.5,
                self.base.hash_rate * 0.25,
                self.base.hash_rate * 5.0,
            );
            info!(
                "Memory pressure: upload rate now {:.2}/s, hash rate {:.2}/s",
                self.upload.rate(),
                self.hash.rate()
            );
            return;
        }

        let total = allowed + denied;
        if total == 0 {
            return;
        }
        let denial_ratio = denied as f64 / total as f64;
        if denial_ratio > 0.2 {
            self.upload.scale_rate(1.1, floor, ceiling);
        } else if denial_ratio < 0.05 {
            self.upload.scale_rate(0.9, floor, ceiling);
        }
    }
}

/// Spawn the adaptive controller. `interval` is clamped to at least 30 s so
/// rate decisions never flap.
pub fn spawn_adaptive_controller(
    limiter: std::sync::Arc<RateLimiter>,
    probe: std::sync::Arc<dyn crate::monitor::MemoryProbe>,
    high_watermark_bytes: u64,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    let interval = interval.max(Duration::from_secs(30));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.tick().await; // first tick is immediate; skip it
        loop {
            tick.tick().await;
            let pressure = probe.resident_bytes() > high_watermark_bytes;
            limiter.adjust(pressure);
        }
    })
}
