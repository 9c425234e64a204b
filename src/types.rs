use std::fmt;
use std::sync::Arc;

use ahash::RandomState;

// Fixed seeds so that key routing is identical across process restarts.
// Recovery replays the EuIdentifier table and log index against hashes
// computed by a previous incarnation of the engine.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x9e37_79b9_7f4a_7c15,
    0xc2b2_ae3d_27d4_eb4f,
    0x1656_67b1_9e37_79f9,
    0x27d4_eb2f_1656_67c5,
);

/// A key paired with its 64-bit digest. The digest routes the key to a
/// set bucket and a log partition; the key bytes settle equality.
#[derive(Clone, PartialEq, Eq)]
pub struct HashedKey {
    key: Vec<u8>,
    hash: u64,
}

impl HashedKey {
    /// Hash `key` with the engine's fixed-seed hasher.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        let state = RandomState::with_seeds(HASH_SEEDS.0, HASH_SEEDS.1, HASH_SEEDS.2, HASH_SEEDS.3);
        let hash = state.hash_one(key.as_slice());
        Self { key, hash }
    }

    /// Pair `key` with a caller-computed 64-bit digest. The digest must be
    /// uniformly distributed and stable across restarts.
    pub fn with_hash(key: impl Into<Vec<u8>>, hash: u64) -> Self {
        Self { key: key.into(), hash }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

impl fmt::Debug for HashedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashedKey")
            .field("len", &self.key.len())
            .field("hash", &self.hash)
            .finish()
    }
}

/// Identifier of a logical set bucket, in `[0, num_buckets)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BucketId(u32);

impl BucketId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

/// Why an entry left the cache.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DestructorReason {
    /// Pushed out by the eviction policy.
    Evicted,
    /// Explicitly removed by the caller.
    Removed,
    /// Superseded by a newer insert of the same key.
    Replaced,
}

/// Notification invoked exactly once per entry that leaves the cache for
/// any reason other than orderly shutdown. Invoked with no engine lock
/// held; the callback must not call back into the engine.
pub type DestructorCallback = Arc<dyn Fn(&HashedKey, &[u8], DestructorReason) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashed_key_stable_across_instances() {
        let a = HashedKey::new(b"stable-key".to_vec());
        let b = HashedKey::new(b"stable-key".to_vec());
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a, b);
    }

    #[test]
    fn test_hashed_key_with_explicit_hash() {
        let hk = HashedKey::with_hash(b"k".to_vec(), 42);
        assert_eq!(hk.hash(), 42);
        assert_eq!(hk.key(), b"k");
    }

    #[test]
    fn test_distinct_keys_hash_differently() {
        let a = HashedKey::new(b"key-a".to_vec());
        let b = HashedKey::new(b"key-b".to_vec());
        assert_ne!(a.hash(), b.hash());
    }
}
