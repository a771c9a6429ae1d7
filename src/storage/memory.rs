//! In-memory object store.
//!
//! Backs the integration tests and local development. Mirrors the S3
//! adapter's observable behavior — including which upload plan a payload
//! of a given size selects, recorded per PUT so tests can assert on it.

use super::plan::UploadPlan;
use super::traits::{ObjectBody, ObjectStore, PayloadReader, StoreError};
use crate::hashing::digest_of;
use crate::types::{ContentDigest, PutOutcome, StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;

struct ObjectRecord {
    data: Bytes,
    content_type: String,
    user_metadata: HashMap<String, String>,
    etag: String,
    last_modified: DateTime<Utc>,
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    buckets: Mutex<HashSet<String>>,
    objects: Mutex<HashMap<(String, String), ObjectRecord>>,
    /// Part size observed for each `put_stream` call (`None` = single PUT),
    /// in call order.
    observed_part_sizes: Mutex<Vec<Option<u64>>>,
    /// When non-zero, the next N `put_stream` calls fail with
    /// `Unavailable`. Lets tests exercise retry and breaker paths.
    fail_puts: AtomicU32,
    /// Presign routing threshold (bytes), mirroring the S3 adapter.
    large_file_threshold: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            large_file_threshold: 100 * 1024 * 1024,
            ..Default::default()
        }
    }

    /// Make the next `n` puts fail.
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    /// Upload plans observed so far, as part sizes (`None` = single PUT).
    pub fn observed_part_sizes(&self) -> Vec<Option<u64>> {
        self.observed_part_sizes.lock().clone()
    }

    /// Raw object bytes, for round-trip assertions.
    pub fn object_bytes(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|r| r.data.clone())
    }

    pub fn object_count(&self, bucket: &str) -> usize {
        self.objects
            .lock()
            .keys()
            .filter(|(b, _)| b == bucket)
            .count()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError> {
        Ok(self.buckets.lock().contains(bucket))
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        self.buckets.lock().insert(bucket.to_string());
        Ok(())
    }

    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        mut reader: PayloadReader,
        size: u64,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<PutOutcome, StoreError> {
        if self
            .fail_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        self.observed_part_sizes
            .lock()
            .push(UploadPlan::for_size(size).part_size());

        let mut data = Vec::with_capacity(size.min(1 << 20) as usize);
        reader.read_to_end(&mut data).await?;
        if data.len() as u64 != size {
            return Err(StoreError::InvalidArgument(format!(
                "payload ended early: declared {size}, read {}",
                data.len()
            )));
        }

        let etag = format!("\"{}\"", &digest_of(&data).as_str()[..32]);
        let record = ObjectRecord {
            data: Bytes::from(data),
            content_type: content_type.to_string(),
            user_metadata,
            etag: etag.clone(),
            last_modified: Utc::now(),
        };

        self.objects
            .lock()
            .insert((bucket.to_string(), key.to_string()), record);

        Ok(PutOutcome {
            etag,
            stored_size: size,
        })
    }

    async fn get_stream(&self, bucket: &str, key: &str) -> Result<ObjectBody, StoreError> {
        let data = self
            .object_bytes(bucket, key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        // Chunked, so consumers exercise their streaming path.
        let chunks: Vec<Result<Bytes, StoreError>> = data
            .chunks(64 * 1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError> {
        let objects = self.objects.lock();
        let record = objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(StoredObject {
            key: key.to_string(),
            size: record.data.len() as u64,
            content_type: record.content_type.clone(),
            user_metadata: record.user_metadata.clone(),
            etag: record.etag.clone(),
            last_modified: record.last_modified,
        })
    }

    async fn copy_object_replace_metadata(
        &self,
        bucket: &str,
        key: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut objects = self.objects.lock();
        let record = objects
            .get_mut(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        record.user_metadata = user_metadata;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.objects
            .lock()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn list_keys(&self, bucket: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn list_hashes(&self, bucket: &str) -> Result<HashSet<ContentDigest>, StoreError> {
        Ok(self
            .objects
            .lock()
            .iter()
            .filter(|((b, _), _)| b == bucket)
            .filter_map(|(_, record)| {
                record
                    .user_metadata
                    .get(crate::types::meta_keys::FILE_HASH)
                    .and_then(|v| ContentDigest::from_hex(v))
            })
            .collect())
    }

    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StoreError> {
        Ok(format!(
            "memory://direct/{bucket}/{key}?method=PUT&ttl={}",
            ttl.as_secs()
        ))
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StoreError> {
        Ok(format!(
            "memory://direct/{bucket}/{key}?method=GET&ttl={}",
            ttl.as_secs()
        ))
    }

    async fn presign_put_for_size(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        payload_size: u64,
    ) -> Result<String, StoreError> {
        let host = if payload_size > self.large_file_threshold {
            "direct"
        } else {
            "public"
        };
        Ok(format!(
            "memory://{host}/{bucket}/{key}?method=PUT&ttl={}",
            ttl.as_secs()
        ))
    }

    async fn set_bucket_cors(&self, _bucket: &str, _origins: &[String]) -> Result<(), StoreError> {
        Ok(())
    }

    async fn set_bucket_policy(&self, _bucket: &str) -> Result<(), StoreError> {
        Ok(())
    }
}
