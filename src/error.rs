//! Core error taxonomy for the ingestion service.
//!
//! Layer-local errors (`StoreError`, session errors) convert into
//! `IngestError`; the HTTP mapping lives in `api::errors`.

use thiserror::Error;

/// Errors surfaced by the ingestion core.
///
/// `Transient` store failures never appear here — the retry layer consumes
/// them and surfaces `StoreUnavailable` once attempts are exhausted.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Declared size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("Offset mismatch: client sent {client}, session is at {server}")]
    OffsetMismatch { client: u64, server: u64 },

    #[error("Chunk would exceed declared size: offset {offset} + {len} > {declared}")]
    OverflowDeclaredSize { offset: u64, len: u64, declared: u64 },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Non-fatal: the payload is already in the bucket. Recorded in the
    /// batch outcome, never propagated as a failure.
    #[error("Duplicate payload: {0}")]
    Duplicate(String),

    #[error("Queue full, try again later")]
    Overloaded,

    #[error("Rate limited: {0}")]
    RateLimited(&'static str),

    #[error("Circuit open for dependency: {0}")]
    CircuitOpen(String),

    #[error("Object store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Integrity verification failed for session {0}")]
    IntegrityFailed(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    Timeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// True for outcomes the batch report records without counting the file
    /// as failed.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, IngestError::Duplicate(_))
    }
}

impl From<crate::storage::StoreError> for IngestError {
    fn from(err: crate::storage::StoreError) -> Self {
        use crate::storage::StoreError;
        match err {
            StoreError::NotFound(key) => IngestError::NotFound(key),
            StoreError::InvalidArgument(msg) => IngestError::InvalidArgument(msg),
            StoreError::Unavailable(msg) => IngestError::StoreUnavailable(msg),
            StoreError::Io(e) => IngestError::StoreUnavailable(e.to_string()),
        }
    }
}
