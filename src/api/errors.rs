//! API error type and HTTP status mapping

use crate::error::IngestError;
use crate::workers::PoolError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Checksum failure status used by the resumable protocol.
pub const STATUS_CHECKSUM_MISMATCH: u16 = 460;

/// Errors surfaced by the HTTP layer.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    /// Short machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Ingest(e) => match e {
                IngestError::InvalidArgument(_) => "invalid-argument",
                IngestError::NotFound(_) => "not-found",
                IngestError::PayloadTooLarge { .. } => "payload-too-large",
                IngestError::OffsetMismatch { .. } => "offset-mismatch",
                IngestError::OverflowDeclaredSize { .. } => "overflow-declared-size",
                IngestError::ChecksumMismatch { .. } => "checksum-mismatch",
                IngestError::Duplicate(_) => "duplicate",
                IngestError::Overloaded => "overloaded",
                IngestError::RateLimited(_) => "rate-limited",
                IngestError::CircuitOpen(_) => "circuit-open",
                IngestError::StoreUnavailable(_) => "store-unavailable",
                IngestError::IntegrityFailed(_) => "integrity-failed",
                IngestError::Cancelled => "cancelled",
                IngestError::Timeout => "timeout",
                IngestError::Internal(_) => "internal",
            },
            ApiError::Pool(e) => match e {
                PoolError::Overloaded => "overloaded",
                PoolError::ShuttingDown => "shutting-down",
                PoolError::Timeout => "timeout",
                PoolError::Cancelled => "cancelled",
            },
            ApiError::BadRequest(_) => "bad-request",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Ingest(e) => match e {
                IngestError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                IngestError::NotFound(_) => StatusCode::NOT_FOUND,
                IngestError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                IngestError::OffsetMismatch { .. } => StatusCode::CONFLICT,
                IngestError::OverflowDeclaredSize { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                IngestError::ChecksumMismatch { .. } | IngestError::IntegrityFailed(_) => {
                    StatusCode::from_u16(STATUS_CHECKSUM_MISMATCH)
                        .unwrap_or(StatusCode::BAD_REQUEST)
                }
                // Recorded in batch outcomes; reaching here is a handler bug
                IngestError::Duplicate(_) => StatusCode::OK,
                IngestError::Overloaded
                | IngestError::CircuitOpen(_)
                | IngestError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                IngestError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
                IngestError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
                IngestError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                IngestError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Pool(e) => match e {
                PoolError::Overloaded | PoolError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                PoolError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                PoolError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
