//! Admission-layer scenarios: circuit breaking, rate limiting, pool bounds.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};
use wavevault::breaker::{BreakerConfig, BreakerManager, CircuitBreaker, CircuitState};
use wavevault::error::IngestError;
use wavevault::ratelimit::{LimitClass, RateLimiter, RateLimits};

fn test_breaker(max_failures: u32, reset_timeout: Duration) -> CircuitBreaker {
    CircuitBreaker::new(
        "object-store",
        BreakerConfig {
            max_failures,
            reset_timeout,
            half_open_max: 3,
        },
    )
}

#[tokio::test]
async fn test_circuit_opens_then_recovers_via_probe() {
    let breaker = test_breaker(3, Duration::from_millis(80));

    // Three consecutive failures trip the breaker
    for _ in 0..3 {
        let _ = breaker
            .call(async { Err::<(), _>("store down") })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // While open, calls fail fast with CircuitOpen
    let result = breaker.call(async { Ok::<_, &str>(1) }).await;
    assert!(matches!(result, Err(IngestError::CircuitOpen(_))));

    // After the reset timeout a successful probe closes the breaker and
    // zeroes the failure counter
    tokio::time::sleep(Duration::from_millis(100)).await;
    let result = breaker.call(async { Ok::<_, &str>(1) }).await;
    assert!(matches!(result, Ok(Ok(1))));
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
    assert!(breaker.can_attempt());
}

#[tokio::test]
async fn test_circuit_reopens_on_failed_probe() {
    let breaker = test_breaker(3, Duration::from_millis(80));
    for _ in 0..3 {
        let _ = breaker.call(async { Err::<(), _>("down") }).await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let _ = breaker.call(async { Err::<(), _>("still down") }).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    let result = breaker.call(async { Ok::<_, &str>(1) }).await;
    assert!(matches!(result, Err(IngestError::CircuitOpen(_))));
}

#[tokio::test]
async fn test_breaker_manager_isolates_dependencies() {
    let manager = BreakerManager::new(BreakerConfig {
        max_failures: 1,
        reset_timeout: Duration::from_secs(30),
        half_open_max: 3,
    });

    manager.get("object-store").on_failure();
    assert_eq!(manager.get("object-store").state(), CircuitState::Open);
    assert_eq!(manager.get("notifier").state(), CircuitState::Closed);
}

#[test]
fn test_upload_rate_boundary() {
    // upload class: rate 2/s, burst 2. Ten immediate calls admit exactly
    // the burst; over a full 1 s window at most ceil(2*1 + 2) = 4 pass.
    let limiter = RateLimiter::new(RateLimits::default());

    let mut admitted_initially = 0;
    for _ in 0..10 {
        if limiter.allow(LimitClass::Upload) {
            admitted_initially += 1;
        }
    }
    assert_eq!(admitted_initially, 2);

    let start = Instant::now();
    let mut admitted_total = admitted_initially;
    while start.elapsed() < Duration::from_secs(1) {
        if limiter.allow(LimitClass::Upload) {
            admitted_total += 1;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(admitted_total <= 4, "admitted {admitted_total} > 4");
}

#[test]
fn test_class_buckets_are_independent() {
    let limiter = RateLimiter::new(RateLimits::default());

    // Drain upload entirely
    while limiter.allow(LimitClass::Upload) {}
    // Api burst (10) is untouched
    let mut api_admitted = 0;
    for _ in 0..10 {
        if limiter.allow(LimitClass::Api) {
            api_admitted += 1;
        }
    }
    assert_eq!(api_admitted, 10);
}

#[tokio::test]
async fn test_upload_class_limits_ingest_route() {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    // Rate limits at defaults: the api class admits, but a burst of
    // ingest posts exhausts the upload class (burst 2) and answers 429.
    let app = common::TestApp::with_limits(RateLimits::default());

    let mut denied = 0;
    for _ in 0..5 {
        let body = concat!(
            "--B\r\n",
            "Content-Disposition: form-data; name=\"file\"; filename=\"x.wav\"\r\n",
            "Content-Type: audio/wav\r\n\r\n",
            "1234\r\n",
            "--B--\r\n"
        );
        let request = Request::post("/api/ingest")
            .header("content-type", "multipart/form-data; boundary=B")
            .body(Body::from(body))
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            denied += 1;
        }
    }
    assert!(denied >= 3, "only {denied} of 5 were rate limited");
}

#[tokio::test]
async fn test_worker_pool_bounds_active_and_shutdown() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wavevault::workers::WorkItem;

    let pool = common::test_pool(2);
    let concurrent = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let mut receivers = Vec::new();
    let mut items = Vec::new();
    for _ in 0..6 {
        let concurrent = concurrent.clone();
        let max_seen = max_seen.clone();
        let (item, rx) = WorkItem::new(
            "bound-probe",
            Box::new(move |_ctx| {
                Box::pin(async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        items.push(item);
        receivers.push(rx);
    }
    pool.submit_batch(items).await.unwrap();
    for rx in receivers {
        rx.await.unwrap().unwrap();
    }
    assert!(max_seen.load(Ordering::SeqCst) <= pool.stats().workers);

    // After shutdown, nothing new transitions to active
    pool.shutdown(Duration::from_secs(2)).await.unwrap();
    let (item, _rx) = WorkItem::new("late", Box::new(|_ctx| Box::pin(async { Ok(()) })));
    assert!(pool.submit(item).is_err());
    assert_eq!(pool.stats().active, 0);
}
