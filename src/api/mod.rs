//! HTTP surface: multipart ingest, resumable upload protocol, status.

mod errors;
mod ingest;
mod status;
mod uploads;

pub use errors::ApiError;

use crate::breaker::BreakerManager;
use crate::error::IngestError;
use crate::events::ProgressSink;
use crate::metrics::Metrics;
use crate::pipeline::IngestPipeline;
use crate::ratelimit::{LimitClass, RateLimiter};
use crate::session::SessionStore;
use crate::workers::WorkerPool;
use axum::http::HeaderMap;
use axum::routing::{get, head, post};
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared handler state.
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    pub sessions: Arc<SessionStore>,
    pub limiter: Arc<RateLimiter>,
    pub breakers: Arc<BreakerManager>,
    pub pool: Arc<WorkerPool>,
    pub progress: Arc<ProgressSink>,
    pub metrics: Arc<Metrics>,
    pub max_upload_size: u64,
    /// Root token; request-scoped work runs on child tokens.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub(crate) fn count_rate_denial(&self, class: &str) {
        self.metrics.rate_limited_total.with_label_values(&[class]).inc();
    }
}

/// Identity used for per-client buckets: the nearest proxy-reported peer,
/// else a shared anonymous key.
pub(crate) fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "anonymous".to_string())
}

/// Api-class admission, applied by the ingest and upload handlers.
pub(crate) fn admit_api(state: &AppState) -> Result<(), ApiError> {
    if !state.limiter.allow(LimitClass::Api) {
        state.count_rate_denial("api");
        return Err(ApiError::Ingest(IngestError::RateLimited("api")));
    }
    Ok(())
}

/// Build the service router.
pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = axum::extract::DefaultBodyLimit::max(state.max_upload_size as usize);

    Router::new()
        .route("/health", get(status::health_check))
        .route("/status", get(status::get_status))
        .route("/metrics", get(status::get_metrics))
        .route("/api/ingest", post(ingest::ingest_batch))
        .route(
            "/uploads",
            post(uploads::create_session).options(uploads::options_uploads),
        )
        .route(
            "/uploads/:id",
            head(uploads::head_session)
                .patch(uploads::patch_session)
                .delete(uploads::delete_session),
        )
        .route("/uploads/:id/verify", post(uploads::verify_session))
        .layer(TraceLayer::new_for_http())
        .layer(body_limit)
        // CORS outermost so preflight clears before anything else
        .layer(CorsLayer::permissive())
        .with_state(state)
}
