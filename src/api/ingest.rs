//! Multipart-form batch ingest handler.
//!
//! Fields are spooled to owner-only temp files as they arrive so the
//! pipeline can make its two passes (hash, then upload) without the
//! request body ever being resident in memory.

use super::errors::ApiError;
use super::{admit_api, client_key, AppState};
use crate::error::IngestError;
use crate::pipeline::{BatchReport, FileSource, PayloadSource};
use crate::ratelimit::LimitClass;
use axum::extract::{Multipart, State};
use axum::http::HeaderMap;
use axum::Json;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// `POST /api/ingest` — multipart/form-data batch upload.
pub async fn ingest_batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<BatchReport>, ApiError> {
    admit_api(&state)?;
    if !state.limiter.allow_client(&client_key(&headers)) {
        state.count_rate_denial("client");
        return Err(IngestError::RateLimited("client").into());
    }
    if !state.limiter.allow(LimitClass::Upload) {
        state.count_rate_denial("upload");
        return Err(IngestError::RateLimited("upload").into());
    }

    let mut sources: Vec<Arc<dyn PayloadSource>> = Vec::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            // Non-file fields (form metadata) are not payloads.
            continue;
        };

        let spool = tempfile::NamedTempFile::new()
            .map_err(|e| ApiError::Ingest(IngestError::Internal(format!("spool: {e}"))))?;
        let temp_path = spool.into_temp_path();
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| ApiError::Ingest(IngestError::Internal(format!("spool open: {e}"))))?;

        let mut size: u64 = 0;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| ApiError::BadRequest(format!("truncated multipart field: {e}")))?
        {
            size += chunk.len() as u64;
            if size > state.max_upload_size {
                return Err(IngestError::PayloadTooLarge {
                    size,
                    max: state.max_upload_size,
                }
                .into());
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| ApiError::Ingest(IngestError::Internal(format!("spool write: {e}"))))?;
        }
        file.flush()
            .await
            .map_err(|e| ApiError::Ingest(IngestError::Internal(format!("spool flush: {e}"))))?;
        drop(file);

        debug!("Spooled {} ({} bytes)", filename, size);
        sources.push(Arc::new(FileSource::from_temp(filename, temp_path, size)));
    }

    if sources.is_empty() {
        return Err(ApiError::BadRequest(
            "no file fields in multipart body".to_string(),
        ));
    }

    info!("Ingest request: {} file(s)", sources.len());
    let report = state
        .pipeline
        .ingest_batch(sources, state.shutdown.child_token())
        .await?;

    Ok(Json(report))
}
