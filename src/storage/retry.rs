//! Retry policy for object-store calls.
//!
//! Transient failures (connection reset, timeout, 5xx except 501) are
//! retried with exponential backoff; anything else returns immediately.
//! Exhausted retries surface as `StoreError::Unavailable`.

use super::traits::StoreError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Whether a failed attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Transient,
    Permanent,
}

/// A store failure tagged with its retry class.
#[derive(Debug)]
pub struct ClassifiedError {
    pub class: RetryClass,
    pub error: StoreError,
}

impl ClassifiedError {
    pub fn transient(error: StoreError) -> Self {
        Self {
            class: RetryClass::Transient,
            error,
        }
    }

    pub fn permanent(error: StoreError) -> Self {
        Self {
            class: RetryClass::Permanent,
            error,
        }
    }

    /// Classify by HTTP status: 5xx is transient except 501 Not
    /// Implemented; 4xx is permanent.
    pub fn from_status(status: u16, error: StoreError) -> Self {
        if status >= 500 && status != 501 {
            Self::transient(error)
        } else {
            Self::permanent(error)
        }
    }
}

/// Exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `n` (attempts count from 1; no sleep before
    /// the first).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(exp));
        raw.min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or exhausts the
    /// attempt budget.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClassifiedError>>,
    {
        let mut last_err = None;
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.backoff_for(attempt)).await;
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(ClassifiedError {
                    class: RetryClass::Permanent,
                    error,
                }) => return Err(error),
                Err(ClassifiedError { error, .. }) => {
                    warn!(
                        "{} attempt {}/{} failed: {}",
                        op_name, attempt, self.max_attempts, error
                    );
                    last_err = Some(error);
                }
            }
        }
        Err(StoreError::Unavailable(format!(
            "{} failed after {} attempts: {}",
            op_name,
            self.max_attempts,
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(4));
        // Capped
        assert_eq!(policy.backoff_for(10), Duration::from_secs(30));
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            ClassifiedError::from_status(503, StoreError::Unavailable("x".into())).class,
            RetryClass::Transient
        );
        assert_eq!(
            ClassifiedError::from_status(501, StoreError::Unavailable("x".into())).class,
            RetryClass::Permanent
        );
        assert_eq!(
            ClassifiedError::from_status(404, StoreError::NotFound("x".into())).class,
            RetryClass::Permanent
        );
    }

    #[tokio::test]
    async fn test_transient_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = fast_policy()
            .run("op", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ClassifiedError::transient(StoreError::Unavailable(
                        "reset".into(),
                    )))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy()
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClassifiedError::permanent(StoreError::NotFound(
                    "missing".into(),
                )))
            })
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_unavailable() {
        let result: Result<(), _> = fast_policy()
            .run("op", || async {
                Err(ClassifiedError::transient(StoreError::Unavailable(
                    "timeout".into(),
                )))
            })
            .await;
        match result {
            Err(StoreError::Unavailable(msg)) => assert!(msg.contains("3 attempts")),
            other => panic!("expected Unavailable, got {:?}", other.err()),
        }
    }
}
