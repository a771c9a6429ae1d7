//! Content-hash deduplication index.
//!
//! One index instance is materialized per ingest batch by listing the
//! bucket's object metadata. Successful uploads are `observe`d into the
//! in-memory view, so two identical payloads inside one batch resolve to
//! exactly one success and one duplicate without re-listing the bucket.
//! The view is never shared across batches — each batch snapshots afresh,
//! which is also how writes from other processes get reconciled.

use crate::storage::{ObjectStore, StoreError};
use crate::types::ContentDigest;
use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::debug;

/// Per-batch view of the digests present in the bucket.
pub struct DedupIndex {
    hashes: RwLock<HashSet<ContentDigest>>,
}

impl DedupIndex {
    /// An empty view. Useful when the caller knows the bucket is fresh.
    pub fn empty() -> Self {
        Self {
            hashes: RwLock::new(HashSet::new()),
        }
    }

    /// Materialize a fresh view from the bucket's object metadata.
    pub async fn snapshot(store: &dyn ObjectStore, bucket: &str) -> Result<Self, StoreError> {
        let hashes = store.list_hashes(bucket).await?;
        debug!("Dedup snapshot of {}: {} digests", bucket, hashes.len());
        Ok(Self {
            hashes: RwLock::new(hashes),
        })
    }

    /// Whether a payload with this digest is already present, either from
    /// the snapshot or observed earlier in this batch.
    pub fn contains(&self, digest: &ContentDigest) -> bool {
        self.hashes.read().contains(digest)
    }

    /// Record a digest as present for the remainder of the batch.
    pub fn observe(&self, digest: ContentDigest) {
        self.hashes.write().insert(digest);
    }

    /// Atomic check-and-claim: returns true if the digest was absent and is
    /// now observed. Exactly one of N concurrent claimants for the same
    /// digest wins.
    pub fn claim(&self, digest: &ContentDigest) -> bool {
        self.hashes.write().insert(digest.clone())
    }

    /// Withdraw a claim whose upload did not land, so a later payload with
    /// the same digest is not misreported as a duplicate.
    pub fn release(&self, digest: &ContentDigest) {
        self.hashes.write().remove(digest);
    }

    pub fn len(&self) -> usize {
        self.hashes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.read().is_empty()
    }
}
