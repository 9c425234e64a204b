use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::BucketId;

/// Number of trackable slots per bucket. Sub-kilobyte entries in 4 KiB
/// buckets stay well below this.
pub const SLOTS_PER_BUCKET: u32 = 64;

/// One hit bit per `(bucket, slot)` pair.
///
/// A bit records that the entry occupying that slot was read since the
/// bucket's last rewrite; the rewrite consults the bits to decide which
/// entries deserve the hot set, then clears the bucket's word. Slots past
/// [`SLOTS_PER_BUCKET`] are untracked: sets are dropped and reads report
/// cold.
pub struct HitBitVector {
    words: Vec<AtomicU64>,
}

impl HitBitVector {
    pub fn new(num_buckets: u64) -> Self {
        let words = (0..num_buckets).map(|_| AtomicU64::new(0)).collect();
        Self { words }
    }

    pub fn num_buckets(&self) -> u64 {
        self.words.len() as u64
    }

    pub fn set(&self, bid: BucketId, slot: u32) {
        if slot >= SLOTS_PER_BUCKET {
            return;
        }
        self.words[bid.index() as usize].fetch_or(1 << slot, Ordering::Relaxed);
    }

    pub fn get(&self, bid: BucketId, slot: u32) -> bool {
        if slot >= SLOTS_PER_BUCKET {
            return false;
        }
        self.words[bid.index() as usize].load(Ordering::Relaxed) & (1 << slot) != 0
    }

    /// Drop every hit bit of the bucket. Runs under the bucket's write
    /// lock as part of a rewrite.
    pub fn clear_bucket(&self, bid: BucketId) {
        self.words[bid.index() as usize].store(0, Ordering::Relaxed);
    }

    pub fn clear_all(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<u64> {
        self.words.iter().map(|w| w.load(Ordering::Relaxed)).collect()
    }

    pub(crate) fn restore(&self, words: &[u64]) -> bool {
        if words.len() != self.words.len() {
            return false;
        }
        for (dst, src) in self.words.iter().zip(words) {
            dst.store(*src, Ordering::Relaxed);
        }
        true
    }
}
