//! Property-based checks for the clean acceptance rules.

mod common;

use proptest::prelude::*;
use wavevault::hashing::{digest_of, StreamingHasher};
use wavevault::ratelimit::TokenBucket;
use wavevault::storage::plan::{UploadPlan, MIB};
use wavevault::types::canonical_key;

proptest! {
    /// Splitting the payload at any point never changes the digest.
    #[test]
    fn prop_streaming_hash_is_split_invariant(
        data in proptest::collection::vec(any::<u8>(), 0..4096),
        split in 0usize..4096,
    ) {
        let split = split.min(data.len());
        let mut hasher = StreamingHasher::new();
        hasher.update(&data[..split]);
        hasher.update(&data[split..]);
        prop_assert_eq!(hasher.finalize(), digest_of(&data));
    }

    /// Canonical renaming preserves the extension and never loses the
    /// suffix when an extension exists.
    #[test]
    fn prop_canonical_key_preserves_extension(
        stem in "[a-zA-Z0-9_-]{1,20}",
        ext in "[a-z]{1,5}",
    ) {
        let original = format!("{stem}.{ext}");
        let key = canonical_key(&original, "_raw");
        prop_assert_eq!(&key, &format!("{stem}_raw.{ext}"));
        let expected_suffix = format!(".{}", ext);
        prop_assert!(key.ends_with(&expected_suffix));
    }

    /// Names without an extension separator are stored unchanged.
    #[test]
    fn prop_canonical_key_extensionless_unchanged(stem in "[a-zA-Z0-9_-]{1,20}") {
        prop_assert_eq!(canonical_key(&stem, "_raw"), stem);
    }

    /// The upload plan always covers the payload: parts * part_size >= size,
    /// and a plan is multipart exactly at and above 64 MiB.
    #[test]
    fn prop_upload_plan_covers_payload(size in 1u64..(4 * 1024 * MIB)) {
        let plan = UploadPlan::for_size(size);
        match plan.part_size() {
            None => prop_assert!(size < 64 * MIB),
            Some(part_size) => {
                prop_assert!(size >= 64 * MIB);
                prop_assert!(plan.part_count(size) * part_size >= size);
                prop_assert!((plan.part_count(size) - 1) * part_size < size);
            }
        }
    }

    /// A burst of immediate calls admits exactly min(calls, burst).
    #[test]
    fn prop_token_bucket_burst_bound(
        burst in 1u32..20,
        calls in 1usize..40,
    ) {
        let bucket = TokenBucket::new(0.001, burst as f64);
        let admitted = (0..calls).filter(|_| bucket.allow()).count();
        prop_assert_eq!(admitted, calls.min(burst as usize));
    }
}
