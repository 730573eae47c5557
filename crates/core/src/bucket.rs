//! Bucket routing and bucket-to-shard mapping.
//!
//! Writers and dispatchers must agree on where a partition key lands, so the
//! router is a pure function of the key bytes:
//!
//! ```text
//! bucket = murmur3_x86_32(utf8(key), seed = 0) & (BUCKET_COUNT - 1)
//! ```
//!
//! Masking keeps the result in range for every hash value. Taking the absolute
//! value of a signed hash breaks at `i32::MIN` and must not be used.
//!
//! Buckets are virtual and fixed for the lifetime of a dataset. Physical
//! placement goes through [`ShardMap`], which can be changed without
//! re-hashing any stored key.

use std::collections::BTreeMap;
use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::error::{OutboxError, OutboxResult};

/// Number of virtual buckets. Power of two, never changed for a live dataset.
pub const BUCKET_COUNT: u32 = 1024;

const HASH_SEED: u32 = 0;

/// Virtual partition in `[0, BUCKET_COUNT)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketId(u32);

impl BucketId {
    pub fn new(value: u32) -> OutboxResult<Self> {
        if value >= BUCKET_COUNT {
            return Err(OutboxError::validation(format!(
                "bucket {value} out of range [0, {BUCKET_COUNT})"
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Iterate every bucket in ascending order.
    pub fn all() -> impl Iterator<Item = BucketId> {
        (0..BUCKET_COUNT).map(BucketId)
    }
}

impl core::fmt::Display for BucketId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Route a partition key to its bucket.
pub fn route(key: &str) -> BucketId {
    let hash = murmur3::murmur3_32(&mut Cursor::new(key.as_bytes()), HASH_SEED)
        .unwrap_or_else(|_| unreachable!("reading an in-memory slice cannot fail"));
    BucketId(hash & (BUCKET_COUNT - 1))
}

/// Physical shard (one task table).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(u32);

impl ShardId {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Table suffix, zero-padded to two digits (`outbox_07`).
    pub fn table_suffix(self) -> String {
        format!("{:02}", self.0)
    }
}

impl core::fmt::Display for ShardId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Bucket to physical shard indirection.
///
/// Defaults to `bucket % shard_count`; individual buckets can be pinned to a
/// different shard while data is being moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMap {
    shard_count: u32,
    overrides: BTreeMap<BucketId, ShardId>,
}

impl ShardMap {
    pub fn new(shard_count: u32) -> OutboxResult<Self> {
        if shard_count == 0 || shard_count > BUCKET_COUNT {
            return Err(OutboxError::validation(format!(
                "shard_count must be in [1, {BUCKET_COUNT}], got {shard_count}"
            )));
        }
        Ok(Self {
            shard_count,
            overrides: BTreeMap::new(),
        })
    }

    /// Pin a bucket to an explicit shard.
    pub fn with_override(mut self, bucket: BucketId, shard: ShardId) -> OutboxResult<Self> {
        if shard.get() >= self.shard_count {
            return Err(OutboxError::validation(format!(
                "shard {shard} out of range for {} shards",
                self.shard_count
            )));
        }
        self.overrides.insert(bucket, shard);
        Ok(self)
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn shard_for(&self, bucket: BucketId) -> ShardId {
        self.overrides
            .get(&bucket)
            .copied()
            .unwrap_or(ShardId(bucket.get() % self.shard_count))
    }

    pub fn shards(&self) -> impl Iterator<Item = ShardId> {
        (0..self.shard_count).map(ShardId)
    }

    /// Group buckets by the shard that stores them, preserving bucket order.
    pub fn group_by_shard(&self, buckets: &[BucketId]) -> BTreeMap<ShardId, Vec<BucketId>> {
        let mut grouped: BTreeMap<ShardId, Vec<BucketId>> = BTreeMap::new();
        for bucket in buckets {
            grouped.entry(self.shard_for(*bucket)).or_default().push(*bucket);
        }
        grouped
    }
}

impl Default for ShardMap {
    fn default() -> Self {
        Self {
            shard_count: 1,
            overrides: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_matches_reference_vectors() {
        // murmur3_x86_32 seed 0: "" -> 0x00000000, "hello" -> 0x248bfa47,
        // "The quick brown fox jumps over the lazy dog" -> 0x2e4ff723
        assert_eq!(route("").get(), 0);
        assert_eq!(route("hello").get(), 0x248b_fa47 & 0x3ff);
        assert_eq!(
            route("The quick brown fox jumps over the lazy dog").get(),
            0x2e4f_f723 & 0x3ff
        );
    }

    #[test]
    fn route_handles_non_ascii_keys() {
        let bucket = route("门店-42");
        assert!(bucket.get() < BUCKET_COUNT);
        assert_eq!(bucket, route("门店-42"));
    }

    #[test]
    fn bucket_rejects_out_of_range() {
        assert!(BucketId::new(BUCKET_COUNT).is_err());
        assert!(BucketId::new(BUCKET_COUNT - 1).is_ok());
    }

    #[test]
    fn shard_map_defaults_to_modulo_and_honours_overrides() {
        let map = ShardMap::new(32)
            .unwrap()
            .with_override(BucketId::new(5).unwrap(), ShardId::new(31))
            .unwrap();

        assert_eq!(map.shard_for(BucketId::new(33).unwrap()), ShardId::new(1));
        assert_eq!(map.shard_for(BucketId::new(5).unwrap()), ShardId::new(31));
        assert_eq!(ShardId::new(7).table_suffix(), "07");
    }

    #[test]
    fn shard_map_rejects_bad_counts() {
        assert!(ShardMap::new(0).is_err());
        assert!(ShardMap::new(BUCKET_COUNT + 1).is_err());
        assert!(
            ShardMap::new(4)
                .unwrap()
                .with_override(BucketId::new(1).unwrap(), ShardId::new(4))
                .is_err()
        );
    }

    #[test]
    fn group_by_shard_partitions_every_bucket_once() {
        let map = ShardMap::new(3).unwrap();
        let buckets: Vec<BucketId> = BucketId::all().take(10).collect();
        let grouped = map.group_by_shard(&buckets);

        let total: usize = grouped.values().map(Vec::len).sum();
        assert_eq!(total, 10);
        for (shard, members) in &grouped {
            assert!(members.iter().all(|b| map.shard_for(*b) == *shard));
        }
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 512,
                ..ProptestConfig::default()
            })]

            /// Routing is pure and always in range.
            #[test]
            fn route_is_deterministic_and_in_range(key in ".{0,64}") {
                let first = route(&key);
                prop_assert!(first.get() < BUCKET_COUNT);
                prop_assert_eq!(first, route(&key.clone()));
            }
        }
    }
}
