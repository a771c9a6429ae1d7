//! Object-store trait definitions

use crate::types::{ContentDigest, PutOutcome, StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during store operations.
///
/// Transient network failures are classified and retried inside the backend;
/// what escapes here is either permanent or already retry-exhausted.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Sequential payload reader handed to `put_stream`.
pub type PayloadReader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Streaming object body.
pub type ObjectBody = BoxStream<'static, Result<Bytes, StoreError>>;

/// Abstract S3-compatible object store.
///
/// This trait is object-safe and used as `Arc<dyn ObjectStore>`. All
/// methods take a `bucket` parameter; the backend owns connection state
/// only.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    // === Bucket operations ===

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError>;

    /// Create the bucket if missing. Idempotent.
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StoreError>;

    // === Object operations ===

    /// Stream `reader` into `bucket/key` without buffering the whole
    /// payload. The strategy (single PUT vs multipart, part size) is chosen
    /// from `size`; partially-uploaded multipart state is aborted on error.
    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        reader: PayloadReader,
        size: u64,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<PutOutcome, StoreError>;

    /// Stream an object's bytes back.
    async fn get_stream(&self, bucket: &str, key: &str) -> Result<ObjectBody, StoreError>;

    /// Read object metadata without the body.
    async fn head_object(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError>;

    /// Replace an object's user metadata via self-copy. Bytes are untouched.
    async fn copy_object_replace_metadata(
        &self,
        bucket: &str,
        key: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<(), StoreError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError>;

    /// All object keys in the bucket.
    async fn list_keys(&self, bucket: &str) -> Result<Vec<String>, StoreError>;

    /// Aggregate the `file-hash` user metadata of every object in the
    /// bucket. Objects lacking the metadata are skipped silently.
    async fn list_hashes(&self, bucket: &str) -> Result<HashSet<ContentDigest>, StoreError>;

    // === Presigned URLs ===

    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StoreError>;

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StoreError>;

    /// Size-routed presign: payloads at or under the large-file threshold
    /// go to the public endpoint (CDN benefits); larger payloads go direct
    /// (bypasses CDN upload caps).
    async fn presign_put_for_size(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        payload_size: u64,
    ) -> Result<String, StoreError>;

    // === Bucket policy / CORS (best-effort) ===

    /// Apply upload CORS rules. Callers log failures and continue.
    async fn set_bucket_cors(&self, bucket: &str, origins: &[String]) -> Result<(), StoreError>;

    /// Apply the authenticated-upload bucket policy. Callers log failures
    /// and continue.
    async fn set_bucket_policy(&self, bucket: &str) -> Result<(), StoreError>;
}
