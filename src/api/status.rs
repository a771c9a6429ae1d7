//! Health, status, and metrics handlers.

use super::AppState;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::Arc;

/// `GET /health`
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /status` — pool, breaker, limiter, and session snapshot.
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let pool = state.pool.stats();
    let breakers: Vec<_> = state
        .breakers
        .states()
        .into_iter()
        .map(|(name, circuit, failures)| {
            json!({
                "dependency": name,
                "state": circuit,
                "consecutive_failures": failures,
            })
        })
        .collect();
    let rates: Vec<_> = state
        .limiter
        .current_rates()
        .into_iter()
        .map(|(class, rate)| json!({ "class": class, "rate_per_sec": rate }))
        .collect();

    Json(json!({
        "pool": pool,
        "breakers": breakers,
        "rate_limits": rates,
        "tracked_clients": state.limiter.tracked_clients(),
        "sessions_active": state.sessions.active_count(),
        "events_dropped": state.progress.dropped(),
    }))
}

/// `GET /metrics` — Prometheus text exposition.
pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Response {
    // Gauges sampled on scrape
    let pool = state.pool.stats();
    state.metrics.worker_active.set(pool.active as i64);
    state.metrics.worker_queue_depth.set(pool.queue_size as i64);
    state
        .metrics
        .sessions_active
        .set(state.sessions.active_count() as i64);

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}
