//! Resumable upload protocol handlers.
//!
//! TUS-style semantics over plain HTTP headers: a session is created with a
//! declared length, chunks land via PATCH at the server's offset, and a
//! final verify gates the session into the ingest pipeline. Offsets are
//! authoritative on the server; a mismatched PATCH answers 409 and the
//! client re-HEADs.

use super::errors::ApiError;
use super::{admit_api, AppState};
use crate::error::IngestError;
use crate::events::Phase;
use crate::ratelimit::LimitClass;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

// Lookup is case-insensitive; lowercase is the canonical insert form.
const H_UPLOAD_LENGTH: &str = "upload-length";
const H_UPLOAD_OFFSET: &str = "upload-offset";
const H_UPLOAD_METADATA: &str = "upload-metadata";
const H_UPLOAD_CHECKSUM: &str = "upload-checksum";
const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

/// `POST /uploads` — create a session.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    admit_api(&state)?;
    if !state.limiter.allow(LimitClass::Upload) {
        state.count_rate_denial("upload");
        return Err(IngestError::RateLimited("upload").into());
    }

    let declared_size: u64 = header_value(&headers, H_UPLOAD_LENGTH)?
        .ok_or_else(|| ApiError::BadRequest("Upload-Length header required".to_string()))?
        .parse()
        .map_err(|_| ApiError::BadRequest("Upload-Length must be an integer".to_string()))?;

    let metadata = match header_value(&headers, H_UPLOAD_METADATA)? {
        Some(raw) => decode_metadata(&raw)?,
        None => HashMap::new(),
    };
    let filename = metadata
        .get("filename")
        .cloned()
        .unwrap_or_else(|| "upload.bin".to_string());

    let id = state.sessions.create(declared_size, &filename, metadata)?;
    state.metrics.sessions_active.set(state.sessions.active_count() as i64);
    info!("Session {} created for {} ({} bytes)", id, filename, declared_size);

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/uploads/{id}")),
            (header::HeaderName::from_static("upload-offset"), "0".to_string()),
        ],
    )
        .into_response())
}

/// `OPTIONS /uploads` — capability discovery.
pub async fn options_uploads() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            ("Upload-Extensions", "creation,termination,checksum"),
            ("Upload-Checksum-Algorithms", "sha256"),
        ],
    )
        .into_response()
}

/// `HEAD /uploads/:id` — offset poll.
pub async fn head_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let info = state.sessions.info(&id)?;

    let mut headers = HeaderMap::new();
    headers.insert(H_UPLOAD_LENGTH, info.declared_size.into());
    headers.insert(H_UPLOAD_OFFSET, info.offset.into());
    headers.insert(header::CACHE_CONTROL, "no-store".parse().unwrap());
    if !info.metadata.is_empty() {
        if let Ok(value) = encode_metadata(&info.metadata).parse() {
            headers.insert(H_UPLOAD_METADATA, value);
        }
    }

    Ok((StatusCode::OK, headers).into_response())
}

/// `PATCH /uploads/:id` — append one chunk at the declared offset.
pub async fn patch_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    admit_api(&state)?;
    match headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        Some(ct) if ct == OFFSET_CONTENT_TYPE => {}
        _ => {
            return Err(ApiError::BadRequest(format!(
                "Content-Type must be {OFFSET_CONTENT_TYPE}"
            )))
        }
    }

    let client_offset: u64 = header_value(&headers, H_UPLOAD_OFFSET)?
        .ok_or_else(|| ApiError::BadRequest("Upload-Offset header required".to_string()))?
        .parse()
        .map_err(|_| ApiError::BadRequest("Upload-Offset must be an integer".to_string()))?;

    let checksum = match header_value(&headers, H_UPLOAD_CHECKSUM)? {
        Some(raw) => Some(parse_checksum_header(&raw)?),
        None => None,
    };

    let info = state
        .sessions
        .append(&id, client_offset, body, checksum.as_deref())
        .await?;

    state.progress.file_progress(
        &info.filename,
        Phase::Uploading,
        ((info.offset.min(info.declared_size)) * 100 / info.declared_size.max(1)) as u8,
        "receiving",
    );
    debug!("Session {} at offset {}/{}", id, info.offset, info.declared_size);

    let mut response_headers = HeaderMap::new();
    response_headers.insert(H_UPLOAD_OFFSET, info.offset.into());
    Ok((StatusCode::NO_CONTENT, response_headers).into_response())
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub digest: String,
}

/// `POST /uploads/:id/verify` — integrity gate. A verified session is
/// handed to the ingest pipeline in the background.
pub async fn verify_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<VerifyRequest>,
) -> Result<Response, ApiError> {
    let info = state.sessions.verify(&id, &request.digest)?;

    let verified = info.status == crate::session::SessionStatus::Verified;
    if verified {
        let pipeline = state.pipeline.clone();
        let sessions = state.sessions.clone();
        let cancel = state.shutdown.child_token();
        let id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline.ingest_session(sessions, &id, cancel).await {
                tracing::error!("Ingest of verified session {} failed: {}", id, e);
            }
        });
    }

    Ok(Json(json!({
        "id": id,
        "status": info.status,
        "digest": info.final_digest,
    }))
    .into_response())
}

/// `DELETE /uploads/:id` — terminate; idempotent.
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    state.sessions.delete(&id);
    state.metrics.sessions_active.set(state.sessions.active_count() as i64);
    StatusCode::NO_CONTENT.into_response()
}

// === Header plumbing ===

fn header_value(headers: &HeaderMap, name: &str) -> Result<Option<String>, ApiError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|s| Some(s.to_string()))
            .map_err(|_| ApiError::BadRequest(format!("{name} header is not valid ASCII"))),
    }
}

/// `Upload-Metadata`: comma-separated `key hex(value)` pairs. A key with
/// no value is allowed and decodes to the empty string.
fn decode_metadata(raw: &str) -> Result<HashMap<String, String>, ApiError> {
    let mut metadata = HashMap::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, ' ');
        let key = parts.next().unwrap_or_default().to_string();
        if key.is_empty() {
            return Err(ApiError::BadRequest("empty Upload-Metadata key".to_string()));
        }
        let value = match parts.next() {
            None | Some("") => String::new(),
            Some(hex_value) => {
                let bytes = hex::decode(hex_value).map_err(|_| {
                    ApiError::BadRequest(format!("Upload-Metadata value for {key} is not hex"))
                })?;
                String::from_utf8(bytes).map_err(|_| {
                    ApiError::BadRequest(format!("Upload-Metadata value for {key} is not UTF-8"))
                })?
            }
        };
        metadata.insert(key, value);
    }
    Ok(metadata)
}

fn encode_metadata(metadata: &HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = metadata
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{} {}", k, hex::encode(v.as_bytes()))
            }
        })
        .collect();
    pairs.sort();
    pairs.join(",")
}

/// `Upload-Checksum: sha256 <hex>`; sha256 is the only algorithm served.
fn parse_checksum_header(raw: &str) -> Result<String, ApiError> {
    let mut parts = raw.trim().splitn(2, ' ');
    let algorithm = parts.next().unwrap_or_default();
    if !algorithm.eq_ignore_ascii_case("sha256") {
        return Err(ApiError::BadRequest(format!(
            "unsupported checksum algorithm: {algorithm}"
        )));
    }
    let digest = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Upload-Checksum missing digest".to_string()))?;
    Ok(digest.to_string())
}
