//! Core types for WaveVault bit-perfect audio ingestion

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Tool version identifier — uses crate name and version from Cargo.toml
pub const WAVEVAULT_TOOL: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// S3 user-metadata key names (stored as `x-amz-meta-{KEY}` on the wire).
/// Used by storage/s3.rs when writing objects and by the pipeline when
/// building canonical metadata.
///
/// The `H_*` constants are the full HTTP header names, derived from the bare
/// keys via `concat!` so they can never desync.
pub mod meta_keys {
    /// SHA-256 of the payload, 64-char lower-hex. The dedup identity.
    pub const FILE_HASH: &str = "file-hash";
    pub const UPLOAD_DATE: &str = "upload-date";
    pub const ORIGINAL_NAME: &str = "original-name";

    // Best-effort sidecar keys filled in by the external audio probe.
    pub const DURATION: &str = "duration";
    pub const CODEC: &str = "codec";
    pub const SAMPLE_RATE: &str = "sample-rate";
    pub const CHANNELS: &str = "channels";
    pub const BIT_RATE: &str = "bit-rate";
    pub const BITS_PER_SAMPLE: &str = "bits-per-sample";
    pub const IS_LOSSLESS: &str = "is-lossless";
    pub const QUALITY: &str = "quality";

    /// S3 header prefix for user-defined metadata.
    pub const AMZ_META_PREFIX: &str = "x-amz-meta-";

    pub const H_FILE_HASH: &str = concat!("x-amz-meta-", "file-hash");
    pub const H_UPLOAD_DATE: &str = concat!("x-amz-meta-", "upload-date");
    pub const H_ORIGINAL_NAME: &str = concat!("x-amz-meta-", "original-name");
}

/// Content types the vault will ever write. Audio bytes are never inspected
/// beyond the filename extension; the payload itself is opaque.
pub const CONTENT_TYPE_WAV: &str = "audio/wav";
pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";

/// Pick the stored content type from the object key.
pub fn content_type_for_key(key: &str) -> &'static str {
    let lower = key.to_ascii_lowercase();
    if lower.ends_with(".wav") {
        CONTENT_TYPE_WAV
    } else {
        CONTENT_TYPE_BINARY
    }
}

/// A 32-byte SHA-256 payload digest, held as its 64-char lower-hex form.
/// The unique identity of a payload; immutable once computed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Wrap an already-hex 64-char string. Returns `None` for anything that
    /// is not a well-formed SHA-256 hex digest.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(hex.to_ascii_lowercase()))
        } else {
            None
        }
    }

    /// Construct from raw digest bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata view of one stored object, as read back from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredObject {
    pub key: String,
    pub size: u64,
    pub content_type: String,
    pub user_metadata: HashMap<String, String>,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

impl StoredObject {
    /// The content digest recorded in user metadata, if present and valid.
    pub fn file_hash(&self) -> Option<ContentDigest> {
        self.user_metadata
            .get(meta_keys::FILE_HASH)
            .and_then(|v| ContentDigest::from_hex(v))
    }
}

/// Derive the canonical stored key for an ingested filename:
/// `<stem><suffix>.<ext>`. Filenames without an extension are stored
/// unchanged — the suffix is only spliced in front of a real extension.
pub fn canonical_key(original: &str, suffix: &str) -> String {
    match original.rfind('.') {
        // A leading dot (".hidden") is not an extension separator.
        Some(idx) if idx > 0 => {
            let (stem, ext) = original.split_at(idx);
            format!("{stem}{suffix}{ext}")
        }
        _ => original.to_string(),
    }
}

/// Result of storing one payload.
#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub etag: String,
    /// Bytes written to storage. Must equal the input size (bit-perfect).
    pub stored_size: u64,
}
