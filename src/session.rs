//! Resumable upload sessions.
//!
//! A session owns an append-only scratch file and an incremental digest.
//! Chunks arrive with a client offset that must match the server's; the
//! digest is folded as bytes land, so completion needs no second read of
//! the scratch file. The final digest gates the session: only a verified
//! session may be ingested.

use crate::error::IngestError;
use crate::hashing::{digest_of, StreamingHasher};
use crate::types::ContentDigest;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Receiving,
    Completed,
    Verified,
    FailedVerification,
}

impl SessionStatus {
    fn accepts_chunks(self) -> bool {
        matches!(self, SessionStatus::Created | SessionStatus::Receiving)
    }

    fn readable(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Verified)
    }
}

struct UploadSession {
    declared_size: u64,
    offset: u64,
    filename: String,
    metadata: HashMap<String, String>,
    created_at: DateTime<Utc>,
    last_modified_at: DateTime<Utc>,
    status: SessionStatus,
    /// Incremental digest. Taken out while a chunk is being written and on
    /// completion; `None` once the final digest is recorded.
    hasher: Option<StreamingHasher>,
    final_digest: Option<ContentDigest>,
    scratch_path: PathBuf,
    chunks_received: u64,
    /// Single-writer latch: a concurrent append is rejected, not queued.
    writing: bool,
}

/// Point-in-time session view for HEAD responses and the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub declared_size: u64,
    pub offset: u64,
    pub filename: String,
    pub metadata: HashMap<String, String>,
    pub status: SessionStatus,
    pub final_digest: Option<ContentDigest>,
    pub chunks_received: u64,
}

/// Thread-safe store for resumable upload sessions.
///
/// The map is guarded by a single lock; scratch I/O happens on the blocking
/// pool with the lock released, the per-session `writing` latch providing
/// the single-writer guarantee in its place.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, UploadSession>>,
    scratch_dir: PathBuf,
    max_upload_size: u64,
}

impl SessionStore {
    /// Create a store rooted at `scratch_dir`. The directory is created
    /// owner-only; scratch bytes must never be world-readable.
    pub fn new(scratch_dir: impl Into<PathBuf>, max_upload_size: u64) -> std::io::Result<Self> {
        let scratch_dir = scratch_dir.into();
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&scratch_dir)?;

        Ok(Self {
            sessions: Mutex::new(HashMap::new()),
            scratch_dir,
            max_upload_size,
        })
    }

    /// Create a new session. Returns the opaque 128-bit hex id.
    pub fn create(
        &self,
        declared_size: u64,
        filename: &str,
        metadata: HashMap<String, String>,
    ) -> Result<String, IngestError> {
        if declared_size == 0 {
            return Err(IngestError::InvalidArgument(
                "declared size must be positive".to_string(),
            ));
        }
        if declared_size > self.max_upload_size {
            return Err(IngestError::PayloadTooLarge {
                size: declared_size,
                max: self.max_upload_size,
            });
        }

        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let id = hex::encode(bytes);

        let scratch_path = self.scratch_dir.join(format!("{id}.part"));
        let now = Utc::now();
        let session = UploadSession {
            declared_size,
            offset: 0,
            filename: filename.to_string(),
            metadata,
            created_at: now,
            last_modified_at: now,
            status: SessionStatus::Created,
            hasher: Some(StreamingHasher::new()),
            final_digest: None,
            scratch_path,
            chunks_received: 0,
            writing: false,
        };

        self.sessions.lock().insert(id.clone(), session);
        debug!("Created upload session {} ({} bytes)", id, declared_size);
        Ok(id)
    }

    /// Append a chunk at `client_offset`. With `chunk_checksum` given, the
    /// chunk's SHA-256 is recomputed and compared before anything mutates.
    pub async fn append(
        &self,
        id: &str,
        client_offset: u64,
        data: Bytes,
        chunk_checksum: Option<&str>,
    ) -> Result<SessionInfo, IngestError> {
        if let Some(expected) = chunk_checksum {
            let actual = digest_of(&data);
            if !digests_equal(expected, actual.as_str()) {
                return Err(IngestError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        // Admission under the lock: validate, then latch the session so the
        // scratch write can happen with the lock released.
        let (mut hasher, scratch_path) = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| IngestError::NotFound(id.to_string()))?;

            if !session.status.accepts_chunks() {
                return Err(IngestError::InvalidArgument(format!(
                    "session {id} no longer accepts chunks"
                )));
            }
            // A racing PATCH loses: the committed offset is moving, so the
            // second writer can never match it. It must re-HEAD and resume.
            if session.writing {
                return Err(IngestError::OffsetMismatch {
                    client: client_offset,
                    server: session.offset,
                });
            }
            if client_offset != session.offset {
                return Err(IngestError::OffsetMismatch {
                    client: client_offset,
                    server: session.offset,
                });
            }
            if client_offset + data.len() as u64 > session.declared_size {
                return Err(IngestError::OverflowDeclaredSize {
                    offset: client_offset,
                    len: data.len() as u64,
                    declared: session.declared_size,
                });
            }

            session.writing = true;
            (
                session.hasher.take().expect("hasher present while receiving"),
                session.scratch_path.clone(),
            )
        };

        hasher.update(&data);

        let write_result = {
            let data = data.clone();
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&scratch_path)?;
                file.write_all(&data)?;
                Ok(())
            })
            .await
            .map_err(|e| IngestError::Internal(format!("scratch write task: {e}")))
        };

        let mut sessions = self.sessions.lock();
        let session = match sessions.get_mut(id) {
            Some(s) => s,
            // Deleted underneath us (DELETE or TTL sweep); the scratch file
            // is already gone or about to be.
            None => return Err(IngestError::NotFound(id.to_string())),
        };
        session.writing = false;

        let failure = match write_result {
            Ok(Ok(())) => None,
            Ok(Err(io_err)) => Some(IngestError::Internal(format!("scratch write: {io_err}"))),
            Err(task_err) => Some(task_err),
        };
        if let Some(failure) = failure {
            // The scratch file length is now unknown; the session cannot be
            // trusted and is torn down.
            let path = session.scratch_path.clone();
            sessions.remove(id);
            drop(sessions);
            let _ = std::fs::remove_file(path);
            return Err(failure);
        }

        session.offset += data.len() as u64;
        session.chunks_received += 1;
        session.last_modified_at = Utc::now();

        if session.offset == session.declared_size {
            session.status = SessionStatus::Completed;
            session.final_digest = Some(hasher.finalize());
            debug!("Session {} completed ({} chunks)", id, session.chunks_received);
        } else {
            session.status = SessionStatus::Receiving;
            session.hasher = Some(hasher);
        }

        Ok(info_of(id, session))
    }

    /// Gate a completed session on its declared digest. Constant-time
    /// comparison; the verdict is latched into the session status.
    pub fn verify(&self, id: &str, expected_digest: &str) -> Result<SessionInfo, IngestError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| IngestError::NotFound(id.to_string()))?;

        match session.status {
            SessionStatus::Completed => {}
            SessionStatus::Verified | SessionStatus::FailedVerification => {
                // Idempotent: re-verification reports the latched verdict.
                return Ok(info_of(id, session));
            }
            _ => {
                return Err(IngestError::InvalidArgument(format!(
                    "session {id} is not completed (offset {}/{})",
                    session.offset, session.declared_size
                )))
            }
        }

        let final_digest = session
            .final_digest
            .as_ref()
            .expect("completed session has a final digest");

        if digests_equal(expected_digest, final_digest.as_str()) {
            session.status = SessionStatus::Verified;
        } else {
            warn!(
                "Session {} failed integrity verification (declared {})",
                id, expected_digest
            );
            session.status = SessionStatus::FailedVerification;
            // Terminal state: the bytes are wrong, keep nothing.
            let path = session.scratch_path.clone();
            let _ = std::fs::remove_file(path);
        }

        Ok(info_of(id, session))
    }

    /// Open the scratch bytes as a sequential reader. Completed or verified
    /// sessions only.
    pub async fn open_reader(&self, id: &str) -> Result<tokio::fs::File, IngestError> {
        let path = {
            let sessions = self.sessions.lock();
            let session = sessions
                .get(id)
                .ok_or_else(|| IngestError::NotFound(id.to_string()))?;
            if !session.status.readable() {
                return Err(IngestError::InvalidArgument(format!(
                    "session {id} is not readable in state {:?}",
                    session.status
                )));
            }
            session.scratch_path.clone()
        };

        tokio::fs::File::open(&path)
            .await
            .map_err(|e| IngestError::Internal(format!("open scratch: {e}")))
    }

    /// Session snapshot for HEAD and the pipeline.
    pub fn info(&self, id: &str) -> Result<SessionInfo, IngestError> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(id)
            .ok_or_else(|| IngestError::NotFound(id.to_string()))?;
        Ok(info_of(id, session))
    }

    /// Remove a session and its scratch bytes. Idempotent.
    pub fn delete(&self, id: &str) {
        let removed = self.sessions.lock().remove(id);
        if let Some(session) = removed {
            let _ = std::fs::remove_file(&session.scratch_path);
            debug!("Deleted session {}", id);
        }
    }

    /// Remove all non-verified sessions older than `max_age`, with their
    /// scratch bytes. Returns the number removed.
    pub fn cleanup_expired(&self, max_age: std::time::Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(1));

        let mut removed_paths = Vec::new();
        {
            let mut sessions = self.sessions.lock();
            sessions.retain(|_, s| {
                let keep = s.status == SessionStatus::Verified || s.created_at > cutoff;
                if !keep {
                    removed_paths.push(s.scratch_path.clone());
                }
                keep
            });
        }

        for path in &removed_paths {
            let _ = std::fs::remove_file(path);
        }
        removed_paths.len()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }
}

fn info_of(id: &str, session: &UploadSession) -> SessionInfo {
    SessionInfo {
        id: id.to_string(),
        declared_size: session.declared_size,
        offset: session.offset,
        filename: session.filename.clone(),
        metadata: session.metadata.clone(),
        status: session.status,
        final_digest: session.final_digest.clone(),
        chunks_received: session.chunks_received,
    }
}

/// Constant-time digest comparison. Length differences short-circuit, which
/// leaks nothing: digest lengths are public.
fn digests_equal(a: &str, b: &str) -> bool {
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}
