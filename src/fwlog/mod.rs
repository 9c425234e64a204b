//! Front-of-house write log.
//!
//! Inserts land here first and are consolidated into set buckets by the
//! flush path, which turns many random single-entry set writes into one
//! read-modify-write per bucket. The log is memory-resident with a fixed
//! byte capacity, split into partitions keyed by set bucket id: all
//! pending entries for one bucket live in exactly one partition, so
//! collecting them for a rewrite locks a single partition while appends
//! to the others continue.
//!
//! Within a partition, the latest append per key wins the index slot;
//! superseded bytes stay dead in the buffer until the partition fully
//! drains and resets. Tombstones ride the same path as values.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::bucket::{Entry, LogBucket};
use crate::corrupt;
use crate::error::Result;
use crate::types::{BucketId, HashedKey};

/// Index value: where the latest entry for a key sits, and whether it
/// was hit since it was appended.
#[derive(Clone, Copy)]
struct IndexSlot {
    offset: u32,
    hit: bool,
}

/// Outcome of a log probe.
pub(crate) enum LogLookup {
    Hit(Vec<u8>),
    /// The latest log record for the key is a removal marker; the key
    /// definitely does not exist, whatever the sets hold.
    Tombstone,
    Miss,
    /// The index pointed at bytes that no longer decode to this key.
    IndexMismatch,
}

/// Outcome of a log append.
pub(crate) enum LogAppend {
    Stored {
        /// Entry whose index slot this append took over. Usually the
        /// same key (an overwrite); on a full 64-bit hash collision it
        /// can be an unrelated entry.
        superseded: Option<Entry>,
    },
    /// The partition's byte capacity is exhausted.
    Full,
}

struct Partition {
    bucket: LogBucket,
    index: HashMap<(u32, u64), IndexSlot, ahash::RandomState>,
    live_bytes: u64,
}

impl Partition {
    fn take_slot(&mut self, bid: u32, hash: u64) -> Option<Entry> {
        let slot = self.index.get(&(bid, hash)).copied()?;
        let old = self.bucket.read(slot.offset).ok();
        if let Some(old) = &old {
            self.live_bytes -= old.wire_size() as u64;
        }
        self.index.remove(&(bid, hash));
        old
    }
}

#[derive(Serialize, Deserialize)]
pub(crate) struct PartitionSnapshot {
    data: Vec<u8>,
    index: Vec<SnapshotIndexEntry>,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct SnapshotIndexEntry {
    bucket: u32,
    hash: u64,
    offset: u32,
    hit: bool,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct LogSnapshot {
    partitions: Vec<PartitionSnapshot>,
}

pub struct FwLog {
    partitions: Vec<Mutex<Partition>>,
    partition_capacity: usize,
    capacity: u64,
    live_bytes: AtomicU64,
}

impl FwLog {
    /// `avg_object_size` pre-sizes the per-partition index; the factor of
    /// two covers open-addressing style occupancy headroom.
    pub fn new(log_size: u64, num_partitions: usize, avg_object_size: u32) -> Self {
        let num_partitions = num_partitions.max(1);
        let partition_capacity = (log_size as usize / num_partitions).max(1);
        let index_capacity =
            (partition_capacity / avg_object_size.max(1) as usize).max(16) * 2;
        let partitions = (0..num_partitions)
            .map(|_| {
                Mutex::new(Partition {
                    bucket: LogBucket::new(partition_capacity),
                    index: HashMap::with_capacity_and_hasher(
                        index_capacity,
                        ahash::RandomState::new(),
                    ),
                    live_bytes: 0,
                })
            })
            .collect();
        tracing::info!(
            log_size,
            num_partitions,
            partition_capacity,
            "write log initialized"
        );
        Self {
            partitions,
            partition_capacity,
            capacity: log_size,
            live_bytes: AtomicU64::new(0),
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition_of(&self, bid: BucketId) -> usize {
        bid.index() as usize % self.partitions.len()
    }

    /// Probe the log under the partition lock. A hit marks the entry so
    /// the flush path can route it to the hot set.
    pub(crate) fn lookup(&self, bid: BucketId, hk: &HashedKey) -> LogLookup {
        let mut partition = self.partitions[self.partition_of(bid)].lock().unwrap();
        let key = (bid.index(), hk.hash());
        let Some(slot) = partition.index.get(&key).copied() else {
            return LogLookup::Miss;
        };
        let entry = match partition.bucket.read(slot.offset) {
            Ok(entry) => entry,
            Err(_) => return LogLookup::IndexMismatch,
        };
        if !entry.matches(hk.hash(), hk.key()) {
            return LogLookup::IndexMismatch;
        }
        if entry.is_tombstone() {
            return LogLookup::Tombstone;
        }
        if let Some(slot) = partition.index.get_mut(&key) {
            slot.hit = true;
        }
        LogLookup::Hit(entry.value)
    }

    /// Non-mutating probe for `could_exist`: `Some(true)` for a live
    /// entry, `Some(false)` for a tombstone, `None` when the log does not
    /// know the key.
    pub(crate) fn probe(&self, bid: BucketId, hk: &HashedKey) -> Option<bool> {
        let partition = self.partitions[self.partition_of(bid)].lock().unwrap();
        let slot = partition.index.get(&(bid.index(), hk.hash()))?;
        let entry = partition.bucket.read(slot.offset).ok()?;
        if !entry.matches(hk.hash(), hk.key()) {
            return None;
        }
        Some(!entry.is_tombstone())
    }

    pub(crate) fn insert(&self, bid: BucketId, hk: &HashedKey, value: &[u8]) -> LogAppend {
        let entry = Entry::new(hk.hash(), hk.key().to_vec(), value.to_vec());
        self.append(bid, entry)
    }

    /// Append a removal marker for the key.
    pub(crate) fn remove(&self, bid: BucketId, hk: &HashedKey) -> LogAppend {
        let entry = Entry::tombstone(hk.hash(), hk.key().to_vec());
        self.append(bid, entry)
    }

    fn append(&self, bid: BucketId, entry: Entry) -> LogAppend {
        let size = entry.wire_size() as u64;
        let mut partition = self.partitions[self.partition_of(bid)].lock().unwrap();
        let Some(offset) = partition.bucket.append(&entry) else {
            return LogAppend::Full;
        };
        let superseded = partition.take_slot(bid.index(), entry.hash);
        partition
            .index
            .insert((bid.index(), entry.hash), IndexSlot { offset, hit: false });
        partition.live_bytes += size;
        if let Some(old) = &superseded {
            self.live_bytes
                .fetch_sub(old.wire_size() as u64, Ordering::Relaxed);
        }
        self.live_bytes.fetch_add(size, Ordering::Relaxed);
        LogAppend::Stored { superseded }
    }

    /// Pull every pending entry for one set bucket out of the log, in
    /// arrival order, with hit marks folded into the entry flags. The
    /// partition buffer resets once its index drains.
    pub(crate) fn collect_for_bucket(&self, bid: BucketId) -> Vec<Entry> {
        let mut partition = self.partitions[self.partition_of(bid)].lock().unwrap();
        let mut slots: Vec<(u64, IndexSlot)> = partition
            .index
            .iter()
            .filter(|((b, _), _)| *b == bid.index())
            .map(|((_, hash), slot)| (*hash, *slot))
            .collect();
        slots.sort_by_key(|(_, slot)| slot.offset);

        let mut out = Vec::with_capacity(slots.len());
        for (hash, slot) in slots {
            partition.index.remove(&(bid.index(), hash));
            match partition.bucket.read(slot.offset) {
                Ok(mut entry) => {
                    let size = entry.wire_size() as u64;
                    partition.live_bytes -= size;
                    self.live_bytes.fetch_sub(size, Ordering::Relaxed);
                    entry.set_hit(slot.hit);
                    out.push(entry);
                }
                Err(e) => {
                    tracing::warn!(bucket = bid.index(), error = %e, "dropping undecodable log slot");
                }
            }
        }
        if partition.index.is_empty() {
            partition.bucket.reset();
        }
        out
    }

    /// Whether any entry for the bucket is pending.
    pub(crate) fn has_pending(&self, bid: BucketId) -> bool {
        let partition = self.partitions[self.partition_of(bid)].lock().unwrap();
        partition.index.keys().any(|(b, _)| *b == bid.index())
    }

    /// Distinct set buckets with pending entries in one partition.
    pub(crate) fn pending_buckets(&self, partition_idx: usize) -> Vec<BucketId> {
        let partition = self.partitions[partition_idx].lock().unwrap();
        partition
            .index
            .keys()
            .map(|(bid, _)| BucketId::new(*bid))
            .unique()
            .collect()
    }

    /// The partition holding the most live bytes, for the flush pass.
    pub(crate) fn most_loaded_partition(&self) -> usize {
        let mut best = 0;
        let mut best_bytes = 0;
        for (i, partition) in self.partitions.iter().enumerate() {
            let bytes = partition.lock().unwrap().live_bytes;
            if bytes > best_bytes {
                best = i;
                best_bytes = bytes;
            }
        }
        best
    }

    pub fn should_flush(&self, threshold: f64) -> bool {
        self.live_bytes.load(Ordering::Relaxed) as f64 > threshold * self.capacity as f64
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Drop all content without callbacks.
    pub(crate) fn clear(&self) {
        for partition in &self.partitions {
            let mut partition = partition.lock().unwrap();
            partition.index.clear();
            partition.bucket.reset();
            partition.live_bytes = 0;
        }
        self.live_bytes.store(0, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> LogSnapshot {
        let partitions = self
            .partitions
            .iter()
            .map(|p| {
                let partition = p.lock().unwrap();
                PartitionSnapshot {
                    data: partition.bucket.data().to_vec(),
                    index: partition
                        .index
                        .iter()
                        .map(|((bucket, hash), slot)| SnapshotIndexEntry {
                            bucket: *bucket,
                            hash: *hash,
                            offset: slot.offset,
                            hit: slot.hit,
                        })
                        .collect(),
                }
            })
            .collect();
        LogSnapshot { partitions }
    }

    pub(crate) fn restore(&self, snap: &LogSnapshot) -> Result<()> {
        if snap.partitions.len() != self.partitions.len() {
            return Err(corrupt!(
                "log snapshot has {} partitions, expected {}",
                snap.partitions.len(),
                self.partitions.len()
            ));
        }
        let mut total = 0u64;
        for (slot, part_snap) in self.partitions.iter().zip(&snap.partitions) {
            let bucket = LogBucket::restore(self.partition_capacity, &part_snap.data)?;
            let mut index = HashMap::with_capacity_and_hasher(
                part_snap.index.len() * 2,
                ahash::RandomState::new(),
            );
            let mut live_bytes = 0u64;
            for e in &part_snap.index {
                let entry = bucket.read(e.offset)?;
                if entry.hash != e.hash {
                    return Err(corrupt!(
                        "log snapshot index entry does not match buffer content"
                    ));
                }
                live_bytes += entry.wire_size() as u64;
                index.insert(
                    (e.bucket, e.hash),
                    IndexSlot {
                        offset: e.offset,
                        hit: e.hit,
                    },
                );
            }
            let mut partition = slot.lock().unwrap();
            partition.bucket = bucket;
            partition.index = index;
            partition.live_bytes = live_bytes;
            total += live_bytes;
        }
        self.live_bytes.store(total, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hk(key: &str, hash: u64) -> HashedKey {
        HashedKey::with_hash(key.as_bytes().to_vec(), hash)
    }

    #[test]
    fn test_insert_then_lookup() {
        let log = FwLog::new(4096, 2, 100);
        let key = hk("k1", 7);
        let bid = BucketId::new(3);
        assert!(matches!(
            log.insert(bid, &key, b"v1"),
            LogAppend::Stored { superseded: None }
        ));
        match log.lookup(bid, &key) {
            LogLookup::Hit(value) => assert_eq!(value, b"v1"),
            _ => panic!("expected hit"),
        }
    }

    #[test]
    fn test_miss_and_wrong_key() {
        let log = FwLog::new(4096, 2, 100);
        let bid = BucketId::new(0);
        assert!(matches!(log.lookup(bid, &hk("nope", 1)), LogLookup::Miss));

        // Same (bucket, hash) but different key bytes: a full collision
        // reads back as a mismatch, not a hit.
        log.insert(bid, &hk("aaa", 9), b"v");
        assert!(matches!(
            log.lookup(bid, &hk("bbb", 9)),
            LogLookup::IndexMismatch
        ));
    }

    #[test]
    fn test_overwrite_supersedes() {
        let log = FwLog::new(4096, 1, 100);
        let key = hk("k", 5);
        let bid = BucketId::new(1);
        log.insert(bid, &key, b"old");
        match log.insert(bid, &key, b"new") {
            LogAppend::Stored { superseded } => {
                assert_eq!(superseded.unwrap().value, b"old");
            }
            LogAppend::Full => panic!("unexpected full"),
        }
        match log.lookup(bid, &key) {
            LogLookup::Hit(value) => assert_eq!(value, b"new"),
            _ => panic!("expected hit"),
        }
    }

    #[test]
    fn test_tombstone_shadows_value() {
        let log = FwLog::new(4096, 1, 100);
        let key = hk("k", 5);
        let bid = BucketId::new(1);
        log.insert(bid, &key, b"v");
        log.remove(bid, &key);
        assert!(matches!(log.lookup(bid, &key), LogLookup::Tombstone));
        assert_eq!(log.probe(bid, &key), Some(false));
    }

    #[test]
    fn test_full_partition_rejects() {
        let log = FwLog::new(64, 1, 100);
        let bid = BucketId::new(0);
        let mut stored = 0;
        for i in 0..100u64 {
            match log.insert(bid, &hk(&format!("key-{i}"), i), b"value") {
                LogAppend::Stored { .. } => stored += 1,
                LogAppend::Full => break,
            }
        }
        assert!(stored > 0);
        assert!(matches!(
            log.insert(bid, &hk("one-more", 999), b"value"),
            LogAppend::Full
        ));
    }

    #[test]
    fn test_collect_returns_arrival_order_and_drains() {
        let log = FwLog::new(4096, 2, 100);
        let bid = BucketId::new(4);
        let other = BucketId::new(5);
        log.insert(bid, &hk("first", 1), b"1");
        log.insert(other, &hk("elsewhere", 2), b"x");
        log.insert(bid, &hk("second", 3), b"2");

        let collected = log.collect_for_bucket(bid);
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0].key, b"first");
        assert_eq!(collected[1].key, b"second");
        assert!(matches!(log.lookup(bid, &hk("first", 1)), LogLookup::Miss));
        // The other bucket's entry is untouched.
        assert!(matches!(
            log.lookup(other, &hk("elsewhere", 2)),
            LogLookup::Hit(_)
        ));
    }

    #[test]
    fn test_collect_folds_hit_marks() {
        let log = FwLog::new(4096, 1, 100);
        let bid = BucketId::new(0);
        log.insert(bid, &hk("warm", 1), b"1");
        log.insert(bid, &hk("cold", 2), b"2");
        let _ = log.lookup(bid, &hk("warm", 1));

        let collected = log.collect_for_bucket(bid);
        let warm = collected.iter().find(|e| e.key == b"warm").unwrap();
        let cold = collected.iter().find(|e| e.key == b"cold").unwrap();
        assert!(warm.hit());
        assert!(!cold.hit());
    }

    #[test]
    fn test_partition_resets_after_drain() {
        let small = FwLog::new(128, 1, 100);
        let bid = BucketId::new(0);
        loop {
            let i = small.live_bytes();
            match small.insert(bid, &hk(&format!("k{i}"), i), b"v") {
                LogAppend::Stored { .. } => {}
                LogAppend::Full => break,
            }
        }
        small.collect_for_bucket(bid);
        assert_eq!(small.live_bytes(), 0);
        // Space is reusable again.
        assert!(matches!(
            small.insert(bid, &hk("again", 1), b"v"),
            LogAppend::Stored { .. }
        ));
    }

    #[test]
    fn test_partition_routing_is_per_bucket() {
        let log = FwLog::new(4096, 4, 100);
        assert_eq!(log.partition_of(BucketId::new(0)), 0);
        assert_eq!(log.partition_of(BucketId::new(5)), 1);
        assert_eq!(log.partition_of(BucketId::new(7)), 3);
    }

    #[test]
    fn test_should_flush_threshold() {
        let log = FwLog::new(1000, 1, 100);
        assert!(!log.should_flush(0.15));
        let bid = BucketId::new(0);
        for i in 0..10u64 {
            log.insert(bid, &hk(&format!("key-{i:04}"), i), &[0u8; 20]);
        }
        assert!(log.should_flush(0.15));
    }

    #[test]
    fn test_most_loaded_partition() {
        let log = FwLog::new(4096, 2, 100);
        log.insert(BucketId::new(1), &hk("a", 1), b"aaaaaaaaaaaaaaaa");
        log.insert(BucketId::new(1), &hk("b", 2), b"bbbbbbbbbbbbbbbb");
        log.insert(BucketId::new(0), &hk("c", 3), b"c");
        assert_eq!(log.most_loaded_partition(), 1);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let log = FwLog::new(2048, 2, 100);
        let key = hk("persisted", 11);
        let bid = BucketId::new(2);
        log.insert(bid, &key, b"value");
        let _ = log.lookup(bid, &key);
        let snap = log.snapshot();

        let other = FwLog::new(2048, 2, 100);
        other.restore(&snap).unwrap();
        match other.lookup(bid, &key) {
            LogLookup::Hit(value) => assert_eq!(value, b"value"),
            _ => panic!("expected hit after restore"),
        }
        assert_eq!(other.live_bytes(), log.live_bytes());
    }
}
