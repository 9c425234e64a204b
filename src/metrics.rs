use std::sync::atomic::{AtomicU64, Ordering};

/// Relaxed atomic counter.
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn sub(&self, value: u64) {
        self.0.fetch_sub(value, Ordering::Relaxed);
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-engine counters, reported through the `get_counters` visitor.
///
/// Item counts satisfy `item_count == log_item_count + set_item_count`
/// once in-flight operations complete.
#[derive(Default)]
pub struct Metrics {
    pub item_count: Counter,
    pub log_item_count: Counter,
    pub set_item_count: Counter,

    pub insert_count: Counter,
    pub succ_insert_count: Counter,
    pub lookup_count: Counter,
    pub succ_lookup_count: Counter,
    pub remove_count: Counter,
    pub succ_remove_count: Counter,
    pub rejected_count: Counter,

    pub log_hits: Counter,
    pub set_hits: Counter,
    pub hot_set_hits: Counter,

    pub eviction_count: Counter,
    pub logical_written_bytes: Counter,
    pub physical_written_bytes: Counter,

    pub io_error_count: Counter,
    pub checksum_error_count: Counter,
    pub log_index_mismatch_count: Counter,

    pub bf_probe_count: Counter,
    pub bf_reject_count: Counter,
    pub bf_false_positive_count: Counter,

    pub log_flush_count: Counter,
    pub gc_pass_count: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke `visitor` once per counter, name first.
    pub fn report(&self, visitor: &mut dyn FnMut(&'static str, u64)) {
        visitor("item_count", self.item_count.value());
        visitor("log_item_count", self.log_item_count.value());
        visitor("set_item_count", self.set_item_count.value());
        visitor("insert_count", self.insert_count.value());
        visitor("succ_insert_count", self.succ_insert_count.value());
        visitor("lookup_count", self.lookup_count.value());
        visitor("succ_lookup_count", self.succ_lookup_count.value());
        visitor("remove_count", self.remove_count.value());
        visitor("succ_remove_count", self.succ_remove_count.value());
        visitor("rejected_count", self.rejected_count.value());
        visitor("log_hits", self.log_hits.value());
        visitor("set_hits", self.set_hits.value());
        visitor("hot_set_hits", self.hot_set_hits.value());
        visitor("eviction_count", self.eviction_count.value());
        visitor("logical_written_bytes", self.logical_written_bytes.value());
        visitor("physical_written_bytes", self.physical_written_bytes.value());
        visitor("io_error_count", self.io_error_count.value());
        visitor("checksum_error_count", self.checksum_error_count.value());
        visitor(
            "log_index_mismatch_count",
            self.log_index_mismatch_count.value(),
        );
        visitor("bf_probe_count", self.bf_probe_count.value());
        visitor("bf_reject_count", self.bf_reject_count.value());
        visitor(
            "bf_false_positive_count",
            self.bf_false_positive_count.value(),
        );
        visitor("log_flush_count", self.log_flush_count.value());
        visitor("gc_pass_count", self.gc_pass_count.value());
    }

    /// Zero the item population counters. Used by `reset` and `recover`;
    /// operation counters are cumulative and deliberately survive.
    pub fn reset_population(&self) {
        self.item_count.set(0);
        self.log_item_count.set(0);
        self.set_item_count.set(0);
    }
}
