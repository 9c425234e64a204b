//! The cache engine.
//!
//! Kangaroo is a flash cache for small objects, laid out as an on-device
//! hash table: every key routes to one logical set bucket, read and
//! written in whole-bucket units through the zone writers. There is no
//! in-memory key index; lookups of absent keys are absorbed by the
//! per-bucket Bloom bank, and inserts are batched through the write log
//! so that each set bucket is rewritten once per flush instead of once
//! per insert. The background cleaner keeps the zone rings reclaimable
//! and drains the log.
//!
//! Per-bucket reader/writer locks carry the whole concurrency contract:
//! any operation touching a bucket holds its lock for the full duration,
//! including device I/O. Operations on one bucket are linearizable;
//! across buckets there is no ordering.

mod cleaner;

use std::cmp::Ordering as CmpOrdering;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::bucket::{Entry, RripBucket, ENTRY_HEADER_SIZE};
use crate::config::Config;
use crate::corrupt;
use crate::error::{Error, Result};
use crate::fwlog::{FwLog, LogAppend, LogLookup};
use crate::index::{BloomFilterBank, HitBitVector};
use crate::metrics::{Counter, Metrics};
use crate::persist::{read_snapshot, write_snapshot, Snapshot, FORMAT_VERSION};
use crate::types::{BucketId, DestructorCallback, DestructorReason, HashedKey};
use crate::wren::Wren;

use cleaner::Cleaner;

// Sized by birthday paradox against the expected number of parallel
// queries; collisions only cost contention, never correctness.
const NUM_LOCKS: usize = 16 * 1024;
const _: () = assert!(NUM_LOCKS.is_power_of_two());

/// Hit bits for cold slots start here when a hot region exists, so one
/// word tracks both buckets of a logical id.
const COLD_SLOT_BASE: u32 = 32;

/// Why a bucket is being rewritten.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum MoveMode {
    LogFlush,
    ColdGc,
    HotGc,
}

/// Cleaner state machine, one global state at a time.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub(crate) enum CleaningState {
    Idle = 0,
    LogFlush = 1,
    ColdGc = 2,
    HotGc = 3,
}

type PendingCallback = (HashedKey, Vec<u8>, DestructorReason);

struct Candidate {
    entry: Entry,
    hit: bool,
}

/// Everything the engine owns except the cleaner threads. The cleaner
/// receives an `Arc` of this and only its `pub(crate)` surface: the
/// rewrite operation and the threshold predicates. Nothing here points
/// back at the cleaner.
pub(crate) struct Core {
    bucket_size: u32,
    hot_bucket_size: u32,
    num_buckets: u64,
    flushing_threshold: f64,
    gc_upper_threshold: f64,
    gc_lower_threshold: f64,
    merge_threads: usize,
    cleaner_poll_interval: Duration,

    generation: AtomicU64,
    locks: Vec<RwLock<()>>,
    bloom: Option<BloomFilterBank>,
    bitvec: HitBitVector,
    log: FwLog,
    cold: Wren,
    hot: Option<Wren>,
    metrics: Metrics,
    destructor: Option<DestructorCallback>,
    cleaning: AtomicU8,
}

impl Core {
    fn from_config(mut config: Config) -> Result<Self> {
        let num_buckets = config.num_buckets();
        let cold = Wren::new(
            config.device.clone(),
            num_buckets,
            config.bucket_size as u64,
            config.total_set_size,
            config.cache_base_offset,
        )?;
        let hot = if config.hot_enabled() {
            Some(Wren::new(
                config.device.clone(),
                num_buckets,
                config.hot_bucket_size as u64,
                config.hot_set_size,
                config.hot_base_offset(),
            )?)
        } else {
            None
        };
        let log = FwLog::new(
            config.effective_log_size(),
            config.log_index_partitions,
            config.avg_small_object_size,
        );
        let bitvec = config
            .rrip_bit_vector
            .take()
            .unwrap_or_else(|| HitBitVector::new(num_buckets));
        let locks = (0..NUM_LOCKS).map(|_| RwLock::new(())).collect();
        tracing::info!(
            num_buckets,
            bucket_size = config.bucket_size,
            hot_bucket_size = config.hot_bucket_size,
            hot_cold_sep = hot.is_some(),
            log_size = config.effective_log_size(),
            merge_threads = config.merge_threads,
            "engine initialized"
        );
        Ok(Self {
            bucket_size: config.bucket_size,
            hot_bucket_size: config.hot_bucket_size,
            num_buckets,
            flushing_threshold: config.flushing_threshold,
            gc_upper_threshold: config.gc_upper_threshold,
            gc_lower_threshold: config.gc_lower_threshold,
            merge_threads: config.merge_threads,
            cleaner_poll_interval: config.cleaner_poll_interval,
            generation: AtomicU64::new(1),
            locks,
            bloom: config.bloom_filter.take(),
            bitvec,
            log,
            cold,
            hot,
            metrics: Metrics::new(),
            destructor: config.destructor_callback.take(),
            cleaning: AtomicU8::new(CleaningState::Idle as u8),
        })
    }

    fn bucket_id(&self, hash: u64) -> BucketId {
        BucketId::new((hash % self.num_buckets) as u32)
    }

    fn lock_for(&self, bid: BucketId) -> &RwLock<()> {
        &self.locks[bid.index() as usize & (NUM_LOCKS - 1)]
    }

    /// Cold-bucket slots share the hit word with hot slots when a hot
    /// region exists.
    fn cold_slot(&self, slot: u32) -> u32 {
        if self.hot.is_some() {
            COLD_SLOT_BASE + slot
        } else {
            slot
        }
    }

    pub(crate) fn max_item_size(&self) -> u64 {
        self.bucket_size as u64 / 4
    }

    fn cleaning_state(&self) -> CleaningState {
        match self.cleaning.load(Ordering::Acquire) {
            1 => CleaningState::LogFlush,
            2 => CleaningState::ColdGc,
            3 => CleaningState::HotGc,
            _ => CleaningState::Idle,
        }
    }

    pub(crate) fn set_cleaning_state(&self, state: CleaningState) {
        self.cleaning.store(state as u8, Ordering::Release);
    }

    fn fire(&self, pending: Vec<PendingCallback>) {
        if let Some(callback) = &self.destructor {
            for (hk, value, reason) in pending {
                callback(&hk, &value, reason);
            }
        }
    }

    fn pend(pending: &mut Vec<PendingCallback>, entry: Entry, reason: DestructorReason) {
        pending.push((
            HashedKey::with_hash(entry.key, entry.hash),
            entry.value,
            reason,
        ));
    }

    fn adjust(counter: &Counter, delta: i64) {
        match delta.cmp(&0) {
            CmpOrdering::Greater => counter.add(delta as u64),
            CmpOrdering::Less => counter.sub((-delta) as u64),
            CmpOrdering::Equal => {}
        }
    }

    /// Read and decode a set bucket. Checksum failures and stale
    /// generations come back as an empty bucket; only device failures are
    /// errors.
    fn read_set_bucket(&self, wren: &Wren, capacity: u32, bid: BucketId) -> Result<RripBucket> {
        let generation = self.generation.load(Ordering::Acquire);
        match wren.read(bid) {
            Ok(None) => Ok(RripBucket::empty(capacity as usize, generation)),
            Ok(Some(buf)) => match RripBucket::decode(&buf, generation) {
                Ok(bucket) => Ok(bucket),
                Err(e) => {
                    self.metrics.checksum_error_count.increment();
                    tracing::warn!(
                        bucket = bid.index(),
                        error = %e,
                        "undecodable set bucket, treating as empty"
                    );
                    Ok(RripBucket::empty(capacity as usize, generation))
                }
            },
            Err(e) => {
                self.metrics.io_error_count.increment();
                Err(e)
            }
        }
    }

    pub(crate) fn could_exist(&self, hk: &HashedKey) -> bool {
        let bid = self.bucket_id(hk.hash());
        match self.log.probe(bid, hk) {
            Some(live) => live,
            None => match &self.bloom {
                Some(bloom) => {
                    self.metrics.bf_probe_count.increment();
                    let admitted = bloom.may_contain(bid, hk.hash());
                    if !admitted {
                        self.metrics.bf_reject_count.increment();
                    }
                    admitted
                }
                None => true,
            },
        }
    }

    pub(crate) fn lookup(&self, hk: &HashedKey) -> Result<Vec<u8>> {
        self.metrics.lookup_count.increment();
        let bid = self.bucket_id(hk.hash());
        let _guard = self.lock_for(bid).read().unwrap();

        match self.log.lookup(bid, hk) {
            LogLookup::Hit(value) => {
                self.metrics.log_hits.increment();
                self.metrics.succ_lookup_count.increment();
                return Ok(value);
            }
            LogLookup::Tombstone => return Err(Error::NotFound),
            LogLookup::IndexMismatch => {
                self.metrics.log_index_mismatch_count.increment();
            }
            LogLookup::Miss => {}
        }

        if let Some(bloom) = &self.bloom {
            self.metrics.bf_probe_count.increment();
            if !bloom.may_contain(bid, hk.hash()) {
                self.metrics.bf_reject_count.increment();
                return Err(Error::NotFound);
            }
        }

        if let Some(hot) = &self.hot {
            let bucket = self.read_set_bucket(hot, self.hot_bucket_size, bid)?;
            if let Some((slot, entry)) = bucket.find(hk.hash(), hk.key()) {
                self.bitvec.set(bid, slot as u32);
                self.metrics.set_hits.increment();
                self.metrics.hot_set_hits.increment();
                self.metrics.succ_lookup_count.increment();
                return Ok(entry.value.clone());
            }
        }

        let bucket = self.read_set_bucket(&self.cold, self.bucket_size, bid)?;
        if let Some((slot, entry)) = bucket.find(hk.hash(), hk.key()) {
            self.bitvec.set(bid, self.cold_slot(slot as u32));
            self.metrics.set_hits.increment();
            self.metrics.succ_lookup_count.increment();
            return Ok(entry.value.clone());
        }

        if self.bloom.is_some() {
            self.metrics.bf_false_positive_count.increment();
        }
        Err(Error::NotFound)
    }

    pub(crate) fn insert(&self, hk: &HashedKey, value: &[u8]) -> Result<()> {
        self.metrics.insert_count.increment();
        let entry_size = (ENTRY_HEADER_SIZE + hk.key().len() + value.len()) as u64;
        if entry_size > self.max_item_size() {
            self.metrics.rejected_count.increment();
            return Err(Error::Rejected);
        }
        let bid = self.bucket_id(hk.hash());

        for attempt in 0..2 {
            let outcome = {
                let _guard = self.lock_for(bid).read().unwrap();
                self.log.insert(bid, hk, value)
            };
            match outcome {
                LogAppend::Stored { superseded } => {
                    self.metrics.logical_written_bytes.add(entry_size);
                    let mut pending = Vec::new();
                    match superseded {
                        Some(old) if !old.is_tombstone() => {
                            let reason = if old.matches(hk.hash(), hk.key()) {
                                DestructorReason::Replaced
                            } else {
                                DestructorReason::Evicted
                            };
                            Self::pend(&mut pending, old, reason);
                        }
                        _ => {
                            // New live entry, or a tombstone gave way.
                            self.metrics.log_item_count.increment();
                            self.metrics.item_count.increment();
                        }
                    }
                    self.metrics.succ_insert_count.increment();
                    self.fire(pending);
                    return Ok(());
                }
                LogAppend::Full if attempt == 0 => {
                    self.relieve_log_pressure(bid)?;
                }
                LogAppend::Full => {
                    self.metrics.rejected_count.increment();
                    return Err(Error::Rejected);
                }
            }
        }
        unreachable!("insert loop always returns")
    }

    pub(crate) fn remove(&self, hk: &HashedKey) -> Result<()> {
        self.metrics.remove_count.increment();
        let bid = self.bucket_id(hk.hash());

        for attempt in 0..2 {
            let outcome = {
                let _guard = self.lock_for(bid).read().unwrap();
                // Presence decides Ok vs NotFound, under the same lock as
                // the tombstone append so the answer cannot go stale.
                match self.log.probe(bid, hk) {
                    Some(true) => {}
                    Some(false) => return Err(Error::NotFound),
                    None => {
                        if !self.find_in_sets(bid, hk)? {
                            return Err(Error::NotFound);
                        }
                    }
                }
                Some(self.log.remove(bid, hk))
            };
            match outcome {
                Some(LogAppend::Stored { superseded }) => {
                    let mut pending = Vec::new();
                    if let Some(old) = superseded {
                        if !old.is_tombstone() {
                            Self::pend(&mut pending, old, DestructorReason::Removed);
                            self.metrics.log_item_count.decrement();
                            self.metrics.item_count.decrement();
                        }
                    }
                    self.metrics.succ_remove_count.increment();
                    self.fire(pending);
                    return Ok(());
                }
                Some(LogAppend::Full) if attempt == 0 => {
                    self.relieve_log_pressure(bid)?;
                }
                Some(LogAppend::Full) => {
                    self.metrics.rejected_count.increment();
                    return Err(Error::Rejected);
                }
                None => unreachable!(),
            }
        }
        unreachable!("remove loop always returns")
    }

    fn find_in_sets(&self, bid: BucketId, hk: &HashedKey) -> Result<bool> {
        if let Some(bloom) = &self.bloom {
            self.metrics.bf_probe_count.increment();
            if !bloom.may_contain(bid, hk.hash()) {
                self.metrics.bf_reject_count.increment();
                return Ok(false);
            }
        }
        if let Some(hot) = &self.hot {
            let bucket = self.read_set_bucket(hot, self.hot_bucket_size, bid)?;
            if bucket.find(hk.hash(), hk.key()).is_some() {
                return Ok(true);
            }
        }
        let bucket = self.read_set_bucket(&self.cold, self.bucket_size, bid)?;
        Ok(bucket.find(hk.hash(), hk.key()).is_some())
    }

    /// The log rejected an append. Flush the stuffed partition inline
    /// when the cleaner is idle; otherwise the insert is rejected and the
    /// caller retries after the cleaner catches up.
    fn relieve_log_pressure(&self, bid: BucketId) -> Result<()> {
        if self.cleaning_state() != CleaningState::Idle {
            self.metrics.rejected_count.increment();
            return Err(Error::Rejected);
        }
        self.flush_partition(self.log.partition_of(bid));
        Ok(())
    }

    pub(crate) fn flush_partition(&self, partition: usize) {
        for bid in self.log.pending_buckets(partition) {
            if let Err(e) = self.move_bucket(bid, MoveMode::LogFlush) {
                tracing::warn!(bucket = bid.index(), error = %e, "bucket flush failed");
            }
        }
        self.metrics.log_flush_count.increment();
    }

    pub(crate) fn flush(&self) {
        for partition in 0..self.log.num_partitions() {
            self.flush_partition(partition);
        }
    }

    /// Rewrite one logical bucket: merge pending log entries into the
    /// current set content, re-separate hot from cold by observed hits,
    /// and append the result through the zone writers.
    pub(crate) fn move_bucket(&self, bid: BucketId, mode: MoveMode) -> Result<()> {
        let mut pending = Vec::new();
        let result = {
            let _guard = self.lock_for(bid).write().unwrap();
            self.rewrite_bucket(bid, mode, &mut pending)
        };
        // Destructor callbacks run with no engine lock held.
        self.fire(pending);
        result
    }

    fn rewrite_bucket(
        &self,
        bid: BucketId,
        mode: MoveMode,
        pending: &mut Vec<PendingCallback>,
    ) -> Result<()> {
        if mode == MoveMode::LogFlush && !self.log.has_pending(bid) {
            return Ok(());
        }
        let generation = self.generation.load(Ordering::Acquire);

        // Read current content before draining the log: a device read
        // failure leaves the log entries in place for the next pass.
        let hot_bucket = match &self.hot {
            Some(hot) => Some(self.read_set_bucket(hot, self.hot_bucket_size, bid)?),
            None => None,
        };
        let cold_bucket = self.read_set_bucket(&self.cold, self.bucket_size, bid)?;
        let log_entries = self.log.collect_for_bucket(bid);
        let log_live: Vec<Entry> = log_entries
            .iter()
            .filter(|e| !e.is_tombstone())
            .cloned()
            .collect();

        // Candidates: hot survivors, cold survivors, then log arrivals
        // newest-last. Stored order decides future eviction tie-breaks.
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut hot_keys: Vec<(u64, Vec<u8>)> = Vec::new();
        if let Some(bucket) = hot_bucket {
            for (slot, entry) in bucket.into_entries().into_iter().enumerate() {
                hot_keys.push((entry.hash, entry.key.clone()));
                let hit = self.bitvec.get(bid, slot as u32);
                candidates.push(Candidate { entry, hit });
            }
        }
        for (slot, entry) in cold_bucket.into_entries().into_iter().enumerate() {
            // A hot/cold duplicate can linger after a partially failed
            // rewrite; the hot copy wins.
            if hot_keys.iter().any(|(h, k)| entry.matches(*h, k)) {
                continue;
            }
            let hit = self.bitvec.get(bid, self.cold_slot(slot as u32));
            candidates.push(Candidate { entry, hit });
        }
        let set_before = candidates.len() as i64;

        // Callbacks staged here fire only once the device accepts the
        // rewrite; until then the previous physical copies remain live.
        let mut on_success: Vec<PendingCallback> = Vec::new();

        // Newest-wins dedup: each log arrival supersedes any set-resident
        // copy of its key; a tombstone just erases it.
        for entry in log_entries {
            let hit = entry.hit();
            if let Some(pos) = candidates
                .iter()
                .position(|c| c.entry.matches(entry.hash, &entry.key))
            {
                let old = candidates.remove(pos);
                let reason = if entry.is_tombstone() {
                    DestructorReason::Removed
                } else {
                    DestructorReason::Replaced
                };
                Self::pend(&mut on_success, old.entry, reason);
            }
            if entry.is_tombstone() {
                continue;
            }
            let mut entry = entry;
            entry.set_hit(false);
            candidates.push(Candidate { entry, hit });
        }

        // Redivide: hit entries are rebuilt at counter 0 and promoted to
        // the hot bucket when one exists; overflow demotes to cold, cold
        // overflow evicts for real.
        let mut new_hot = self
            .hot
            .as_ref()
            .map(|_| RripBucket::empty(self.hot_bucket_size as usize, generation));
        let mut cold_list: Vec<Entry> = Vec::new();
        for candidate in candidates {
            let mut entry = candidate.entry;
            if candidate.hit {
                entry.set_rrip(0);
            }
            match &mut new_hot {
                Some(hot_dest) if candidate.hit && hot_dest.fits_when_empty(&entry) => {
                    match hot_dest.insert(entry) {
                        Ok(outcome) => {
                            // Demotions keep their aged counters.
                            cold_list.extend(outcome.evicted);
                            if let Some(replaced) = outcome.replaced {
                                Self::pend(&mut on_success, replaced, DestructorReason::Replaced);
                            }
                        }
                        Err(_) => unreachable!("entry was checked to fit an empty hot bucket"),
                    }
                }
                _ => cold_list.push(entry),
            }
        }

        let mut new_cold = RripBucket::empty(self.bucket_size as usize, generation);
        for entry in cold_list {
            if !new_cold.fits_when_empty(&entry) {
                self.metrics.eviction_count.increment();
                Self::pend(&mut on_success, entry, DestructorReason::Evicted);
                continue;
            }
            match new_cold.insert(entry) {
                Ok(outcome) => {
                    for victim in outcome.evicted {
                        self.metrics.eviction_count.increment();
                        Self::pend(&mut on_success, victim, DestructorReason::Evicted);
                    }
                    if let Some(replaced) = outcome.replaced {
                        Self::pend(&mut on_success, replaced, DestructorReason::Replaced);
                    }
                }
                Err(_) => unreachable!("entry was checked to fit an empty cold bucket"),
            }
        }

        match self.write_destinations(bid, new_hot.as_ref(), &new_cold) {
            Ok(()) => {
                if let Some(bloom) = &self.bloom {
                    let hot_hashes = new_hot
                        .iter()
                        .flat_map(|b| b.entries().iter())
                        .map(|e| e.hash);
                    let cold_hashes = new_cold.entries().iter().map(|e| e.hash);
                    bloom.rebuild_from(bid, hot_hashes.chain(cold_hashes));
                }
                self.bitvec.clear_bucket(bid);

                let set_after =
                    (new_hot.as_ref().map_or(0, RripBucket::len) + new_cold.len()) as i64;
                let log_moved = log_live.len() as i64;
                Self::adjust(&self.metrics.set_item_count, set_after - set_before);
                Self::adjust(&self.metrics.log_item_count, -log_moved);
                Self::adjust(
                    &self.metrics.item_count,
                    set_after - set_before - log_moved,
                );
                pending.append(&mut on_success);
                Ok(())
            }
            Err(e) => {
                // The previous set copies stay live (identifiers were not
                // updated), so their superseded entries have not actually
                // left; only the collected log entries are lost.
                if matches!(e, Error::Device(_)) {
                    self.metrics.io_error_count.increment();
                }
                let log_moved = log_live.len() as i64;
                for entry in log_live {
                    Self::pend(pending, entry, DestructorReason::Evicted);
                }
                Self::adjust(&self.metrics.log_item_count, -log_moved);
                Self::adjust(&self.metrics.item_count, -log_moved);
                Err(e)
            }
        }
    }

    fn write_destinations(
        &self,
        bid: BucketId,
        new_hot: Option<&RripBucket>,
        new_cold: &RripBucket,
    ) -> Result<()> {
        if let (Some(hot), Some(bucket)) = (&self.hot, new_hot) {
            if bucket.is_empty() {
                // Nothing hot survives; drop the identifier instead of
                // burning a zone slot on an empty bucket.
                hot.invalidate(bid);
            } else {
                let buf = bucket.encode()?;
                hot.write(bid, &buf)?;
                self.metrics.physical_written_bytes.add(buf.len() as u64);
            }
        }
        if new_cold.is_empty() {
            self.cold.invalidate(bid);
        } else {
            let buf = new_cold.encode()?;
            self.cold.write(bid, &buf)?;
            self.metrics.physical_written_bytes.add(buf.len() as u64);
        }
        Ok(())
    }

    // Cleaner predicates.

    pub(crate) fn should_flush_log(&self) -> bool {
        self.log.should_flush(self.flushing_threshold)
    }

    pub(crate) fn should_gc_cold(&self, threshold: f64) -> bool {
        self.cold.should_clean(threshold)
    }

    pub(crate) fn should_gc_hot(&self, threshold: f64) -> bool {
        self.hot.as_ref().is_some_and(|hot| hot.should_clean(threshold))
    }

    pub(crate) fn gc_upper_threshold(&self) -> f64 {
        self.gc_upper_threshold
    }

    pub(crate) fn gc_lower_threshold(&self) -> f64 {
        self.gc_lower_threshold
    }

    pub(crate) fn gc_candidates(&self, mode: MoveMode) -> Vec<BucketId> {
        match mode {
            MoveMode::HotGc => self
                .hot
                .as_ref()
                .map(Wren::buckets_in_erase_eu)
                .unwrap_or_default(),
            _ => self.cold.buckets_in_erase_eu(),
        }
    }

    /// Advance the erase pointer once a reclamation pass drained.
    pub(crate) fn finish_gc(&self, mode: MoveMode) -> Result<()> {
        let wren = match mode {
            MoveMode::HotGc => self.hot.as_ref().unwrap_or(&self.cold),
            _ => &self.cold,
        };
        wren.erase()?;
        self.metrics.gc_pass_count.increment();
        Ok(())
    }

    pub(crate) fn flush_candidates(&self) -> Vec<BucketId> {
        self.log.pending_buckets(self.log.most_loaded_partition())
    }

    pub(crate) fn note_log_flush_pass(&self) {
        self.metrics.log_flush_count.increment();
    }

    // Maintenance surface.

    pub(crate) fn reset(&self) {
        // Bumping the generation makes every on-device bucket stale, so
        // the whole set region empties without touching the device.
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.log.clear();
        if let Some(bloom) = &self.bloom {
            bloom.clear_all();
        }
        self.bitvec.clear_all();
        self.cold.clear();
        if let Some(hot) = &self.hot {
            hot.clear();
        }
        self.metrics.reset_population();
        tracing::info!("engine reset");
    }

    pub(crate) fn persist(&self, writer: &mut dyn Write) -> Result<()> {
        let snapshot = Snapshot {
            version: FORMAT_VERSION,
            generation: self.generation.load(Ordering::Acquire),
            num_buckets: self.num_buckets,
            bucket_size: self.bucket_size,
            hot_bucket_size: self.hot_bucket_size,
            item_count: self.metrics.item_count.value(),
            log_item_count: self.metrics.log_item_count.value(),
            set_item_count: self.metrics.set_item_count.value(),
            cold: self.cold.snapshot(),
            hot: self.hot.as_ref().map(Wren::snapshot),
            log: self.log.snapshot(),
            bloom: self.bloom.as_ref().map(BloomFilterBank::snapshot),
            bit_vector: self.bitvec.snapshot(),
        };
        write_snapshot(writer, &snapshot)
    }

    pub(crate) fn recover(&self, reader: &mut dyn Read) -> bool {
        match self.try_recover(reader) {
            Ok(()) => {
                tracing::info!(items = self.metrics.item_count.value(), "recovered");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "recovery failed, starting empty");
                self.reset();
                false
            }
        }
    }

    fn try_recover(&self, reader: &mut dyn Read) -> Result<()> {
        let snapshot = read_snapshot(reader)?;
        if snapshot.version != FORMAT_VERSION {
            return Err(corrupt!(
                "unsupported snapshot version {}",
                snapshot.version
            ));
        }
        if snapshot.num_buckets != self.num_buckets
            || snapshot.bucket_size != self.bucket_size
            || snapshot.hot_bucket_size != self.hot_bucket_size
            || snapshot.hot.is_some() != self.hot.is_some()
        {
            return Err(corrupt!("snapshot geometry does not match configuration"));
        }
        self.cold.restore(&snapshot.cold)?;
        if let (Some(hot), Some(hot_snap)) = (&self.hot, &snapshot.hot) {
            hot.restore(hot_snap)?;
        }
        self.log.restore(&snapshot.log)?;
        match (&self.bloom, &snapshot.bloom) {
            (Some(bloom), Some(words)) => {
                if !bloom.restore(words) {
                    return Err(corrupt!("bloom snapshot does not match bank size"));
                }
            }
            (Some(_), None) => {
                // An empty bank would reject live keys outright.
                return Err(corrupt!("snapshot carries no bloom state"));
            }
            (None, _) => {}
        }
        if !self.bitvec.restore(&snapshot.bit_vector) {
            return Err(corrupt!("bit vector snapshot does not match size"));
        }
        self.metrics.item_count.set(snapshot.item_count);
        self.metrics.log_item_count.set(snapshot.log_item_count);
        self.metrics.set_item_count.set(snapshot.set_item_count);
        self.generation.store(snapshot.generation, Ordering::Release);
        Ok(())
    }
}

/// Flash cache engine for small objects.
pub struct Kangaroo {
    core: Arc<Core>,
    cleaner: Cleaner,
}

impl Kangaroo {
    /// Validate the configuration, open the zone writers and start the
    /// cleaner pool.
    pub fn new(config: Config) -> Result<Self> {
        let config = config.validate()?;
        let core = Arc::new(Core::from_config(config)?);
        let cleaner = Cleaner::spawn(
            core.clone(),
            core.merge_threads,
            core.cleaner_poll_interval,
        );
        Ok(Self { core, cleaner })
    }

    /// Cheap existence pre-check: no device I/O. `false` means the key
    /// definitely does not exist.
    pub fn could_exist(&self, hk: &HashedKey) -> bool {
        self.core.could_exist(hk)
    }

    /// Look up a key, probing the log, then the Bloom bank, then the hot
    /// and cold set buckets.
    pub fn lookup(&self, hk: &HashedKey) -> Result<Vec<u8>> {
        self.core.lookup(hk)
    }

    /// Insert a key. Replaces an existing entry for the same key.
    pub fn insert(&self, hk: &HashedKey, value: &[u8]) -> Result<()> {
        self.core.insert(hk, value)
    }

    /// Remove a key. `Ok` when something was removed, `NotFound`
    /// otherwise.
    pub fn remove(&self, hk: &HashedKey) -> Result<()> {
        self.core.remove(hk)
    }

    /// Synchronously drain the whole log into the set buckets.
    pub fn flush(&self) {
        self.core.flush();
    }

    /// Drop all cached data.
    pub fn reset(&self) {
        self.core.reset();
    }

    /// Serialize recovery state through `writer`. Call on a quiescent
    /// engine.
    pub fn persist(&self, writer: &mut dyn Write) -> Result<()> {
        self.core.persist(writer)
    }

    /// Restore state written by [`Kangaroo::persist`]. Returns false and
    /// starts empty when the snapshot is unusable.
    pub fn recover(&self, reader: &mut dyn Read) -> bool {
        self.core.recover(reader)
    }

    /// Visit every counter, name first.
    pub fn get_counters(&self, visitor: &mut dyn FnMut(&'static str, u64)) {
        self.core.metrics.report(visitor);
    }

    /// Largest admissible entry (key plus value plus framing).
    pub fn max_item_size(&self) -> u64 {
        self.core.max_item_size()
    }
}

impl Drop for Kangaroo {
    fn drop(&mut self) {
        self.cleaner.shutdown();
    }
}
