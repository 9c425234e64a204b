use std::sync::Arc;
use std::time::Duration;

use crate::badstate;
use crate::device::Device;
use crate::error::Result;
use crate::index::{BloomFilterBank, HitBitVector};
use crate::types::DestructorCallback;

/// Engine configuration.
///
/// `total_set_size` is the cold set region; with hot/cold separation the
/// hot region of `hot_set_size` bytes follows it on the device, so the
/// engine occupies `[cache_base_offset, cache_base_offset +
/// total_set_size + hot_set_size)`.
pub struct Config {
    /// Bytes per cold set bucket.
    pub bucket_size: u32,
    /// Bytes per hot bucket; 0 disables the hot/cold split.
    pub hot_bucket_size: u32,
    /// Enable hot/cold separation.
    pub hot_cold_sep: bool,
    /// Cold set region capacity in bytes.
    pub total_set_size: u64,
    /// Hot set region capacity in bytes.
    pub hot_set_size: u64,
    /// Device offset where the cache region begins.
    pub cache_base_offset: u64,
    /// Fraction of set slots held back so the zone ring always has
    /// reclamation headroom.
    pub set_overprovisioning: f64,
    /// Cleaner worker pool size.
    pub merge_threads: usize,
    /// Pre-sizing hint for the log index.
    pub avg_small_object_size: u32,
    /// Log partition count; appends to different partitions are parallel.
    pub log_index_partitions: usize,
    /// Byte capacity of the write log; 0 sizes it as 1% of
    /// `total_set_size`.
    pub log_size: u64,
    /// Log occupancy fraction that triggers a flush.
    pub flushing_threshold: f64,
    /// Free-zone fraction that triggers urgent reclamation.
    pub gc_upper_threshold: f64,
    /// Free-zone fraction for opportunistic reclamation.
    pub gc_lower_threshold: f64,
    /// Reserved upstream; accepted and validated but unused, its
    /// semantics were never defined.
    pub hot_rebuild_freq: f64,
    /// Coordinator sleep between threshold checks.
    pub cleaner_poll_interval: Duration,

    pub device: Arc<dyn Device>,
    pub destructor_callback: Option<DestructorCallback>,
    /// Optional per-bucket Bloom bank; size it from
    /// [`Config::num_buckets`]. Lookups of absent keys hit the device
    /// when omitted.
    pub bloom_filter: Option<BloomFilterBank>,
    /// Optional hit tracker; the engine builds its own when omitted.
    pub rrip_bit_vector: Option<HitBitVector>,
}

impl Config {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            bucket_size: 4096,
            hot_bucket_size: 0,
            hot_cold_sep: false,
            total_set_size: 0,
            hot_set_size: 0,
            cache_base_offset: 0,
            set_overprovisioning: 0.05,
            merge_threads: 32,
            avg_small_object_size: 100,
            log_index_partitions: 4,
            log_size: 0,
            flushing_threshold: 0.15,
            gc_upper_threshold: 0.05,
            gc_lower_threshold: 0.015,
            hot_rebuild_freq: 5.0,
            cleaner_poll_interval: Duration::from_millis(100),
            device,
            destructor_callback: None,
            bloom_filter: None,
            rrip_bit_vector: None,
        }
    }

    /// Logical bucket count:
    /// `floor((1 - overprovision) * total_set_size / bucket_size)`.
    /// Public so callers can size the optional Bloom bank before
    /// constructing the engine.
    pub fn num_buckets(&self) -> u64 {
        ((1.0 - self.set_overprovisioning) * self.total_set_size as f64 / self.bucket_size as f64)
            as u64
    }

    pub(crate) fn hot_enabled(&self) -> bool {
        self.hot_cold_sep && self.hot_bucket_size > 0 && self.hot_set_size > 0
    }

    pub(crate) fn effective_log_size(&self) -> u64 {
        if self.log_size > 0 {
            self.log_size
        } else {
            (self.total_set_size / 100).max(4096)
        }
    }

    pub(crate) fn hot_base_offset(&self) -> u64 {
        self.cache_base_offset + self.total_set_size
    }

    pub fn validate(self) -> Result<Self> {
        let zone_size = self.device.io_zone_size();
        let zone_cap = self.device.io_zone_cap_size();
        if self.bucket_size == 0 || self.bucket_size as u64 > zone_cap {
            return Err(badstate!(
                "bucket size {} outside zone capacity {zone_cap}",
                self.bucket_size
            ));
        }
        if zone_cap % self.bucket_size as u64 != 0 {
            return Err(badstate!(
                "bucket size {} does not divide zone capacity {zone_cap}",
                self.bucket_size
            ));
        }
        if self.total_set_size / zone_size < 2 {
            return Err(badstate!(
                "set region of {} bytes holds fewer than 2 zones of {zone_size}",
                self.total_set_size
            ));
        }
        if self.num_buckets() == 0 {
            return Err(badstate!("configuration yields zero buckets"));
        }
        if self.num_buckets() > u32::MAX as u64 {
            return Err(badstate!("bucket count {} overflows ids", self.num_buckets()));
        }
        if self.hot_cold_sep {
            if self.hot_bucket_size == 0 || self.hot_set_size == 0 {
                return Err(badstate!(
                    "hot/cold separation requires hot bucket and set sizes"
                ));
            }
            if zone_cap % self.hot_bucket_size as u64 != 0 {
                return Err(badstate!(
                    "hot bucket size {} does not divide zone capacity {zone_cap}",
                    self.hot_bucket_size
                ));
            }
            if self.hot_set_size / zone_size < 2 {
                return Err(badstate!(
                    "hot region of {} bytes holds fewer than 2 zones",
                    self.hot_set_size
                ));
            }
        } else if self.hot_bucket_size != 0 || self.hot_set_size != 0 {
            return Err(badstate!(
                "hot sizes set without enabling hot/cold separation"
            ));
        }
        if !(0.0..1.0).contains(&self.set_overprovisioning) {
            return Err(badstate!(
                "overprovisioning {} outside [0, 1)",
                self.set_overprovisioning
            ));
        }
        for (name, value) in [
            ("flushing_threshold", self.flushing_threshold),
            ("gc_upper_threshold", self.gc_upper_threshold),
            ("gc_lower_threshold", self.gc_lower_threshold),
        ] {
            if !(0.0..1.0).contains(&value) || value == 0.0 {
                return Err(badstate!("{name} {value} outside (0, 1)"));
            }
        }
        if self.gc_lower_threshold > self.gc_upper_threshold {
            return Err(badstate!(
                "gc_lower_threshold {} above gc_upper_threshold {}",
                self.gc_lower_threshold,
                self.gc_upper_threshold
            ));
        }
        if self.merge_threads == 0 {
            return Err(badstate!("merge_threads must be at least 1"));
        }
        if self.log_index_partitions == 0 {
            return Err(badstate!("log_index_partitions must be at least 1"));
        }
        if let Some(bloom) = &self.bloom_filter {
            if bloom.num_filters() != self.num_buckets() {
                return Err(badstate!(
                    "bloom bank sized for {} buckets, engine has {}",
                    bloom.num_filters(),
                    self.num_buckets()
                ));
            }
        }
        if let Some(bv) = &self.rrip_bit_vector {
            if bv.num_buckets() != self.num_buckets() {
                return Err(badstate!(
                    "bit vector sized for {} buckets, engine has {}",
                    bv.num_buckets(),
                    self.num_buckets()
                ));
            }
        }
        Ok(self)
    }
}
