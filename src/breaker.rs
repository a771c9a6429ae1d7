//! Circuit breakers for outbound dependencies.
//!
//! Three states per named dependency: Closed (counting consecutive
//! failures), Open (failing fast until the reset timeout), HalfOpen (a
//! bounded number of concurrent probes decide recovery). Counters are
//! atomics; every state transition is a compare-and-swap, so parallel
//! callers can never observe a torn transition.

use crate::error::IngestError;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub max_failures: u32,
    /// How long the breaker stays open before probing.
    pub reset_timeout: Duration,
    /// Concurrent probes admitted while half-open.
    pub half_open_max: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max: 3,
        }
    }
}

/// Current state, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// One breaker guarding one named dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Milliseconds since `epoch` of the last failure that opened the
    /// breaker. u64 millis instead of an Instant so it stays atomic.
    last_fail_millis: AtomicU64,
    half_open_probes: AtomicU32,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(CLOSED),
            consecutive_failures: AtomicU32::new(0),
            last_fail_millis: AtomicU64::new(0),
            half_open_probes: AtomicU32::new(0),
            epoch: Instant::now(),
        }
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            OPEN => CircuitState::Open,
            HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Whether a request may proceed. Open→HalfOpen promotion happens here,
    /// atomically, when the reset timeout has elapsed; a half-open probe
    /// slot is claimed by CAS so the cap is strict under contention.
    pub fn can_attempt(&self) -> bool {
        loop {
            match self.state.load(Ordering::Acquire) {
                CLOSED => return true,
                OPEN => {
                    let elapsed =
                        self.now_millis().saturating_sub(self.last_fail_millis.load(Ordering::Acquire));
                    if elapsed < self.config.reset_timeout.as_millis() as u64 {
                        return false;
                    }
                    // Promote; the winner resets the probe count and takes
                    // the first slot.
                    if self
                        .state
                        .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        debug!("Breaker {} half-open", self.name);
                        self.half_open_probes.store(1, Ordering::Release);
                        return true;
                    }
                    // Lost the race; re-read state.
                }
                HALF_OPEN => {
                    let probes = self.half_open_probes.load(Ordering::Acquire);
                    if probes >= self.config.half_open_max {
                        return false;
                    }
                    if self
                        .half_open_probes
                        .compare_exchange(probes, probes + 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                    // Slot contention; retry.
                }
                _ => return true,
            }
        }
    }

    /// Record a success. In half-open this closes the breaker and zeroes
    /// the failure counter.
    pub fn on_success(&self) {
        match self.state.load(Ordering::Acquire) {
            HALF_OPEN => {
                if self
                    .state
                    .compare_exchange(HALF_OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    debug!("Breaker {} closed after successful probe", self.name);
                    self.consecutive_failures.store(0, Ordering::Release);
                    self.half_open_probes.store(0, Ordering::Release);
                }
            }
            _ => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
        }
    }

    /// Record a failure. In closed this counts toward the trip threshold;
    /// in half-open any failure reopens immediately.
    pub fn on_failure(&self) {
        self.last_fail_millis.store(self.now_millis(), Ordering::Release);

        match self.state.load(Ordering::Acquire) {
            HALF_OPEN => {
                if self
                    .state
                    .compare_exchange(HALF_OPEN, OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    warn!("Breaker {} re-opened by failed probe", self.name);
                    self.half_open_probes.store(0, Ordering::Release);
                }
            }
            CLOSED => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.max_failures
                    && self
                        .state
                        .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    warn!(
                        "Breaker {} opened after {} consecutive failures",
                        self.name, failures
                    );
                }
            }
            _ => {}
        }
    }

    /// Run `op` under the breaker: fail fast with `CircuitOpen` when no
    /// attempt is admitted, otherwise record the outcome.
    pub async fn call<T, E, Fut>(&self, op: Fut) -> Result<Result<T, E>, IngestError>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.can_attempt() {
            return Err(IngestError::CircuitOpen(self.name.clone()));
        }
        let result = op.await;
        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        Ok(result)
    }
}

/// Keyed table of breakers, one per dependency, created lazily.
#[derive(Default)]
pub struct BreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
}

impl BreakerManager {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// (name, state, consecutive failures) for every known dependency.
    pub fn states(&self) -> Vec<(String, CircuitState, u32)> {
        self.breakers
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().state(),
                    entry.value().failure_count(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker(max_failures: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "dep",
            BreakerConfig {
                max_failures,
                reset_timeout: Duration::from_millis(50),
                half_open_max: 3,
            },
        )
    }

    #[test]
    fn test_trips_after_threshold() {
        let breaker = fast_breaker(3);
        for _ in 0..2 {
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_attempt());

        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_attempt());
    }

    #[test]
    fn test_success_resets_failure_run() {
        let breaker = fast_breaker(3);
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_success_closes() {
        let breaker = fast_breaker(1);
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.can_attempt());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.can_attempt());
    }

    #[tokio::test]
    async fn test_half_open_probe_failure_reopens() {
        let breaker = fast_breaker(1);
        breaker.on_failure();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.can_attempt());

        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_attempt());
    }

    #[tokio::test]
    async fn test_half_open_probe_cap_is_strict() {
        let breaker = fast_breaker(1);
        breaker.on_failure();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Promotion takes slot 1; two more slots remain.
        assert!(breaker.can_attempt());
        assert!(breaker.can_attempt());
        assert!(breaker.can_attempt());
        assert!(!breaker.can_attempt());
    }

    #[tokio::test]
    async fn test_call_fails_fast_when_open() {
        let breaker = fast_breaker(1);
        let _ = breaker
            .call::<(), _, _>(async { Err::<(), &str>("boom") })
            .await;
        let result = breaker.call(async { Ok::<_, &str>(1) }).await;
        assert!(matches!(result, Err(IngestError::CircuitOpen(_))));
    }

    #[test]
    fn test_manager_reuses_instances() {
        let manager = BreakerManager::new(BreakerConfig::default());
        let a = manager.get("store");
        let b = manager.get("store");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.states().len(), 1);
    }
}
