use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::BucketId;

// 10 bits per expected entry at 7 probes gives roughly a 1% false
// positive rate.
const BITS_PER_ENTRY: u64 = 10;
const NUM_HASHES: u32 = 7;

/// One small Bloom filter per set bucket.
///
/// Filters are packed into a single bank of `AtomicU64` words, each
/// filter padded to a word boundary: concurrent rewrites of different
/// buckets touch disjoint words. Probe positions derive from the 64-bit
/// key hash by double hashing.
pub struct BloomFilterBank {
    num_filters: u64,
    words_per_filter: usize,
    bits_per_filter: u64,
    num_hashes: u32,
    words: Vec<AtomicU64>,
}

impl BloomFilterBank {
    /// A bank sized for `expected_entries` per filter.
    pub fn sized_for(num_filters: u64, expected_entries: u64) -> Self {
        let bits = (expected_entries.max(1) * BITS_PER_ENTRY).max(64);
        Self::new(num_filters, bits, NUM_HASHES)
    }

    pub fn new(num_filters: u64, bits_per_filter: u64, num_hashes: u32) -> Self {
        let words_per_filter = bits_per_filter.div_ceil(64) as usize;
        let bits_per_filter = words_per_filter as u64 * 64;
        let total_words = num_filters as usize * words_per_filter;
        let words = (0..total_words).map(|_| AtomicU64::new(0)).collect();
        Self {
            num_filters,
            words_per_filter,
            bits_per_filter,
            num_hashes,
            words,
        }
    }

    pub fn num_filters(&self) -> u64 {
        self.num_filters
    }

    fn word_range(&self, bid: BucketId) -> std::ops::Range<usize> {
        let start = bid.index() as usize * self.words_per_filter;
        start..start + self.words_per_filter
    }

    fn positions(&self, key_hash: u64) -> impl Iterator<Item = u64> + '_ {
        // Double hashing: derive the second stream from the first without
        // recomputing a full digest.
        let h1 = key_hash;
        let h2 = (key_hash >> 17) | (key_hash << 47) | 1;
        let bits = self.bits_per_filter;
        (0..self.num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % bits)
    }

    pub fn insert(&self, bid: BucketId, key_hash: u64) {
        let range = self.word_range(bid);
        for pos in self.positions(key_hash) {
            let word = range.start + (pos / 64) as usize;
            self.words[word].fetch_or(1 << (pos % 64), Ordering::Relaxed);
        }
    }

    pub fn may_contain(&self, bid: BucketId, key_hash: u64) -> bool {
        let range = self.word_range(bid);
        self.positions(key_hash).all(|pos| {
            let word = range.start + (pos / 64) as usize;
            self.words[word].load(Ordering::Relaxed) & (1 << (pos % 64)) != 0
        })
    }

    pub fn clear(&self, bid: BucketId) {
        for word in self.word_range(bid) {
            self.words[word].store(0, Ordering::Relaxed);
        }
    }

    /// Clear the filter and repopulate it from the surviving hashes of a
    /// bucket rewrite. Must run under the bucket's write lock, before the
    /// lock is released.
    pub fn rebuild_from(&self, bid: BucketId, hashes: impl Iterator<Item = u64>) {
        self.clear(bid);
        for hash in hashes {
            self.insert(bid, hash);
        }
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
