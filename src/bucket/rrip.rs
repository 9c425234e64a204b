//! Fixed-size set bucket with RRIP replacement.
//!
//! Layout:
//!
//! ```text
//! +-------------+----------------+----------------+--------------+---------+------+
//! | checksum:u32| generation:u64 | entry_count:u32| data_len:u32 | entries | zero |
//! +-------------+----------------+----------------+--------------+---------+------+
//! ```
//!
//! The checksum (CRC-32/ISCSI) covers every byte after the checksum field,
//! including the zeroed tail, so encoding is deterministic. A decoded
//! bucket whose generation differs from the engine's is stale (written by
//! an earlier incarnation) and comes back empty without raising an error.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use super::{Entry, MAX_RRIP};
use crate::corrupt;
use crate::error::Result;

pub const BUCKET_HEADER_SIZE: usize = 4 + 8 + 4 + 4;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Outcome of inserting into a bucket.
#[derive(Debug, Default)]
pub struct Insertion {
    /// Same-key entry superseded by the insert.
    pub replaced: Option<Entry>,
    /// Entries pushed out to make room, oldest victims first.
    pub evicted: Vec<Entry>,
}

/// A decoded set bucket. Mutated in memory and re-encoded on rewrite;
/// RRIP counters are rebuilt at rewrite time, never persisted per read.
pub struct RripBucket {
    capacity: usize,
    generation: u64,
    entries: Vec<Entry>,
}

impl RripBucket {
    pub fn empty(capacity: usize, generation: u64) -> Self {
        debug_assert!(capacity > BUCKET_HEADER_SIZE);
        Self {
            capacity,
            generation,
            entries: Vec::new(),
        }
    }

    /// Decode a bucket buffer. `expected_generation` gates staleness: a
    /// mismatching generation yields an empty bucket, while a checksum or
    /// framing failure is an error the caller counts.
    pub fn decode(buf: &[u8], expected_generation: u64) -> Result<Self> {
        if buf.len() <= BUCKET_HEADER_SIZE {
            return Err(corrupt!("bucket buffer too short: {}", buf.len()));
        }
        let mut cursor = Cursor::new(buf);
        let checksum = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| corrupt!("decode checksum: {e}"))?;
        let actual = CRC32.checksum(&buf[4..]);
        if checksum != actual {
            return Err(corrupt!(
                "bucket checksum mismatch: stored {checksum:#010x}, computed {actual:#010x}"
            ));
        }
        let generation = cursor
            .read_u64::<BigEndian>()
            .map_err(|e| corrupt!("decode generation: {e}"))?;
        if generation != expected_generation {
            tracing::debug!(
                stored = generation,
                expected = expected_generation,
                "stale bucket generation, treating as empty"
            );
            return Ok(Self::empty(buf.len(), expected_generation));
        }
        let entry_count = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| corrupt!("decode entry_count: {e}"))? as usize;
        let data_len = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| corrupt!("decode data_len: {e}"))? as usize;
        if BUCKET_HEADER_SIZE + data_len > buf.len() {
            return Err(corrupt!(
                "bucket data_len {} exceeds capacity {}",
                data_len,
                buf.len()
            ));
        }
        let mut data = &buf[BUCKET_HEADER_SIZE..BUCKET_HEADER_SIZE + data_len];
        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            entries.push(Entry::decode_from(&mut data)?);
        }
        if !data.is_empty() {
            return Err(corrupt!("{} trailing bytes after last entry", data.len()));
        }
        Ok(Self {
            capacity: buf.len(),
            generation,
            entries,
        })
    }

    /// Encode into a zero-padded buffer of exactly `capacity` bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.capacity];
        let data_len: usize = self.entries.iter().map(Entry::wire_size).sum();
        debug_assert!(BUCKET_HEADER_SIZE + data_len <= self.capacity);
        {
            let mut cursor = Cursor::new(&mut buf[4..]);
            cursor
                .write_u64::<BigEndian>(self.generation)
                .map_err(|e| corrupt!("encode generation: {e}"))?;
            cursor
                .write_u32::<BigEndian>(self.entries.len() as u32)
                .map_err(|e| corrupt!("encode entry_count: {e}"))?;
            cursor
                .write_u32::<BigEndian>(data_len as u32)
                .map_err(|e| corrupt!("encode data_len: {e}"))?;
            for entry in &self.entries {
                entry.encode_into(&mut cursor)?;
            }
        }
        let checksum = CRC32.checksum(&buf[4..]);
        buf[0..4].copy_from_slice(&checksum.to_be_bytes());
        Ok(buf)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn used_bytes(&self) -> usize {
        BUCKET_HEADER_SIZE + self.entries.iter().map(Entry::wire_size).sum::<usize>()
    }

    /// Slots, in stored (insertion) order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<Entry> {
        self.entries
    }

    /// Find an entry by hash and key, returning its slot index.
    pub fn find(&self, hash: u64, key: &[u8]) -> Option<(usize, &Entry)> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.matches(hash, key))
    }

    /// Remove an entry by hash and key.
    pub fn remove(&mut self, hash: u64, key: &[u8]) -> Option<Entry> {
        let idx = self.entries.iter().position(|e| e.matches(hash, key))?;
        Some(self.entries.remove(idx))
    }

    /// Whether `entry` could ever fit, ignoring current occupancy.
    pub fn fits_when_empty(&self, entry: &Entry) -> bool {
        BUCKET_HEADER_SIZE + entry.wire_size() <= self.capacity
    }

    /// Insert an entry, replacing any same-key occupant and evicting by
    /// RRIP aging until it fits. Victims are returned so the caller can
    /// fire the destructor callback exactly once per entry.
    pub fn insert(&mut self, entry: Entry) -> Result<Insertion> {
        if !self.fits_when_empty(&entry) {
            return Err(crate::error::Error::Rejected);
        }
        let mut outcome = Insertion {
            replaced: self.remove(entry.hash, &entry.key),
            evicted: Vec::new(),
        };
        while self.used_bytes() + entry.wire_size() > self.capacity {
            match self.evict_one() {
                Some(victim) => outcome.evicted.push(victim),
                None => return Err(crate::error::Error::Rejected),
            }
        }
        self.entries.push(entry);
        Ok(outcome)
    }

    /// RRIP aging: evict the first entry at the maximum counter value,
    /// incrementing every counter until one reaches it. Ties break toward
    /// the lowest slot index, which is the oldest position.
    fn evict_one(&mut self) -> Option<Entry> {
        if self.entries.is_empty() {
            return None;
        }
        loop {
            if let Some(idx) = self.entries.iter().position(|e| e.rrip() == MAX_RRIP) {
                return Some(self.entries.remove(idx));
            }
            for entry in &mut self.entries {
                let aged = entry.rrip() + 1;
                entry.set_rrip(aged.min(MAX_RRIP));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::DEFAULT_RRIP;

    fn entry(hash: u64, key: &str, value: &str) -> Entry {
        Entry::new(hash, key.as_bytes().to_vec(), value.as_bytes().to_vec())
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut bucket = RripBucket::empty(4096, 5);
        bucket.insert(entry(1, "alpha", "one")).unwrap();
        bucket.insert(entry(2, "beta", "two")).unwrap();
        let buf = bucket.encode().unwrap();
        assert_eq!(buf.len(), 4096);

        let decoded = RripBucket::decode(&buf, 5).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.find(1, b"alpha").unwrap().1.value, b"one");
        assert_eq!(decoded.find(2, b"beta").unwrap().1.value, b"two");
    }

    #[test]
    fn test_stale_generation_decodes_empty() {
        let mut bucket = RripBucket::empty(4096, 5);
        bucket.insert(entry(1, "k", "v")).unwrap();
        let buf = bucket.encode().unwrap();
        let decoded = RripBucket::decode(&buf, 6).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_corrupt_byte_fails_checksum() {
        let mut bucket = RripBucket::empty(4096, 1);
        bucket.insert(entry(1, "k", "v")).unwrap();
        let mut buf = bucket.encode().unwrap();
        buf[100] ^= 0xFF;
        assert!(RripBucket::decode(&buf, 1).is_err());
    }

    #[test]
    fn test_insert_replaces_same_key() {
        let mut bucket = RripBucket::empty(4096, 1);
        bucket.insert(entry(9, "k", "old")).unwrap();
        let outcome = bucket.insert(entry(9, "k", "new")).unwrap();
        assert_eq!(outcome.replaced.unwrap().value, b"old");
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket.find(9, b"k").unwrap().1.value, b"new");
    }

    #[test]
    fn test_eviction_order_prefers_oldest_at_max_rrip() {
        // Capacity fits exactly two entries of this size.
        let one = entry(1, "aaaa", "1111");
        let cap = BUCKET_HEADER_SIZE + 2 * one.wire_size();
        let mut bucket = RripBucket::empty(cap, 1);
        bucket.insert(entry(1, "aaaa", "1111")).unwrap();
        bucket.insert(entry(2, "bbbb", "2222")).unwrap();

        // Both counters start at DEFAULT_RRIP; aging raises both to max
        // and the oldest slot is the victim.
        let outcome = bucket.insert(entry(3, "cccc", "3333")).unwrap();
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].hash, 1);
        assert!(bucket.find(2, b"bbbb").is_some());
        assert!(bucket.find(3, b"cccc").is_some());
    }

    #[test]
    fn test_hot_entry_survives_eviction() {
        let one = entry(1, "aaaa", "1111");
        let cap = BUCKET_HEADER_SIZE + 2 * one.wire_size();
        let mut bucket = RripBucket::empty(cap, 1);
        let mut hot = entry(1, "aaaa", "1111");
        hot.set_rrip(0);
        bucket.insert(hot).unwrap();
        bucket.insert(entry(2, "bbbb", "2222")).unwrap();

        // The second entry sits at DEFAULT_RRIP and reaches the maximum
        // counter first.
        let outcome = bucket.insert(entry(3, "cccc", "3333")).unwrap();
        assert_eq!(outcome.evicted[0].hash, 2);
        assert!(bucket.find(1, b"aaaa").is_some());
    }

    #[test]
    fn test_counters_saturate_at_max() {
        let one = entry(1, "aaaa", "1111");
        let cap = BUCKET_HEADER_SIZE + 2 * one.wire_size();
        let mut bucket = RripBucket::empty(cap, 1);
        bucket.insert(entry(1, "aaaa", "1111")).unwrap();
        bucket.insert(entry(2, "bbbb", "2222")).unwrap();
        bucket.insert(entry(3, "cccc", "3333")).unwrap();
        for entry in bucket.entries() {
            assert!(entry.rrip() <= MAX_RRIP);
        }
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let mut bucket = RripBucket::empty(64, 1);
        let big = entry(1, "key", &"x".repeat(128));
        assert!(bucket.insert(big).is_err());
        assert!(bucket.is_empty());
    }

    #[test]
    fn test_new_entries_start_at_default_rrip() {
        let mut bucket = RripBucket::empty(4096, 1);
        bucket.insert(entry(1, "k", "v")).unwrap();
        assert_eq!(bucket.entries()[0].rrip(), DEFAULT_RRIP);
    }
}
