//! Streaming SHA-256 hasher and the shared buffer pool.
//!
//! The hasher folds borrowed slices into digest state without allocating;
//! the pool hands out reusable buffers in power-of-two classes so the hash
//! and upload passes never allocate per read in steady state.

use crate::types::ContentDigest;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::ops::{Deref, DerefMut};
use std::sync::OnceLock;

/// Incremental SHA-256 over a payload stream.
///
/// `finalize` consumes the hasher, so a digest can only be taken once and
/// the state can never be written after it.
pub struct StreamingHasher {
    inner: Sha256,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    /// Fold bytes into the digest state.
    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    /// Consume the hasher and return the 64-char lower-hex digest.
    pub fn finalize(self) -> ContentDigest {
        let raw: [u8; 32] = self.inner.finalize().into();
        ContentDigest::from_bytes(&raw)
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot digest of an in-memory slice.
pub fn digest_of(bytes: &[u8]) -> ContentDigest {
    let raw: [u8; 32] = Sha256::digest(bytes).into();
    ContentDigest::from_bytes(&raw)
}

/// Smallest buffer class: 16 KiB.
pub const MIN_BUFFER: usize = 16 * 1024;
/// Largest buffer class: 1 MiB.
pub const MAX_BUFFER: usize = 1024 * 1024;
/// Number of power-of-two classes between 16 KiB and 1 MiB inclusive.
const CLASSES: usize = 7;
/// At most this many idle buffers are retained per class; surplus returns
/// to the allocator on drop.
const MAX_IDLE_PER_CLASS: usize = 8;

/// Pool of reusable byte buffers in power-of-two size classes.
///
/// Buffers are NOT zeroed between borrowers — callers must write before
/// they read.
pub struct BufferPool {
    classes: [Mutex<Vec<Vec<u8>>>; CLASSES],
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            classes: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }

    /// The process-wide pool. The only process-wide state in the crate;
    /// lifecycle equals the process.
    pub fn global() -> &'static BufferPool {
        static POOL: OnceLock<BufferPool> = OnceLock::new();
        POOL.get_or_init(BufferPool::new)
    }

    /// Borrow a buffer of at least `min_len` bytes (clamped to the class
    /// range). The buffer returns to the pool when the guard drops.
    pub fn checkout(&self, min_len: usize) -> PooledBuf<'_> {
        let class = Self::class_for(min_len);
        let size = MIN_BUFFER << class;
        let buf = self.classes[class]
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; size]);
        PooledBuf {
            pool: self,
            class,
            buf: Some(buf),
        }
    }

    /// Index of the smallest class that can hold `len` bytes.
    fn class_for(len: usize) -> usize {
        let mut class = 0;
        while class + 1 < CLASSES && (MIN_BUFFER << class) < len {
            class += 1;
        }
        class
    }

    fn put_back(&self, class: usize, buf: Vec<u8>) {
        let mut idle = self.classes[class].lock();
        if idle.len() < MAX_IDLE_PER_CLASS {
            idle.push(buf);
        }
    }

    #[cfg(test)]
    fn idle_count(&self, class: usize) -> usize {
        self.classes[class].lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard over a pooled buffer. Dropping on any exit path returns the
/// storage to the pool.
pub struct PooledBuf<'a> {
    pool: &'a BufferPool,
    class: usize,
    buf: Option<Vec<u8>>,
}

impl Deref for PooledBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put_back(self.class, buf);
        }
    }
}
