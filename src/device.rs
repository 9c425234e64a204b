//! Device abstraction consumed by the engine.
//!
//! The engine addresses the device in whole-bucket units and never issues
//! an unaligned access: reads and writes are `bucket_size` bytes at
//! bucket-aligned offsets, resets and finishes cover whole zones. Real
//! backends (raw block devices opened with `O_DIRECT`, ZNS zones) impose
//! alignment on the memory side too, which is why buffers come from
//! [`Device::make_io_buffer`] rather than plain `Vec`s.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Memory alignment for I/O buffers, matching the common 4 KiB device
/// block size.
pub const IO_ALIGNMENT: usize = 4096;

/// Block device interface. Offsets and lengths are in bytes. Failures
/// surface as `false`; the engine maps them to [`crate::Error::Device`]
/// and never updates its indices on a failed write.
pub trait Device: Send + Sync {
    fn read(&self, offset: u64, buf: &mut [u8]) -> bool;

    fn write(&self, offset: u64, buf: &[u8]) -> bool;

    /// Prepare a zone to receive appends again, discarding its contents.
    fn reset(&self, offset: u64, len: u64) -> bool;

    /// Close a fully written zone.
    fn finish(&self, offset: u64, len: u64) -> bool;

    /// Physical zone size in bytes (stride between zone start offsets).
    fn io_zone_size(&self) -> u64;

    /// Usable bytes per zone. May be smaller than [`Device::io_zone_size`]
    /// on zoned namespaces.
    fn io_zone_cap_size(&self) -> u64;

    fn make_io_buffer(&self, len: usize) -> IoBuffer {
        IoBuffer::zeroed(len)
    }
}

/// A zero-initialized, alignment-respecting I/O buffer.
pub struct IoBuffer {
    data: *mut u8,
    len: usize,
    layout: Layout,
}

unsafe impl Send for IoBuffer {}
unsafe impl Sync for IoBuffer {}

impl IoBuffer {
    pub fn zeroed(len: usize) -> Self {
        assert!(len > 0, "zero-length io buffer");
        let layout = Layout::from_size_align(len, IO_ALIGNMENT).expect("invalid io buffer layout");
        let data = unsafe { alloc_zeroed(layout) };
        assert!(!data.is_null(), "io buffer allocation failed");
        Self { data, len, layout }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.data, self.layout) }
    }
}

impl Deref for IoBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }
}

impl DerefMut for IoBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data, self.len) }
    }
}

/// In-memory device for tests and for embedders without flash hardware.
///
/// Tracks per-operation counters so tests can assert on read traffic, and
/// supports byte-level corruption and write fault injection.
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
    zone_size: u64,
    zone_cap: u64,
    reads: AtomicU64,
    writes: AtomicU64,
    resets: AtomicU64,
    finishes: AtomicU64,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemDevice {
    pub fn new(size: u64, zone_size: u64) -> Self {
        Self::with_zone_cap(size, zone_size, zone_size)
    }

    /// Zoned-namespace shape: `zone_cap` usable bytes inside every
    /// `zone_size` stride.
    pub fn with_zone_cap(size: u64, zone_size: u64, zone_cap: u64) -> Self {
        assert!(zone_cap <= zone_size);
        Self {
            data: Mutex::new(vec![0u8; size as usize]),
            zone_size,
            zone_cap,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            resets: AtomicU64::new(0),
            finishes: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        }
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    pub fn finish_count(&self) -> u64 {
        self.finishes.load(Ordering::Relaxed)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Flip one byte of the backing store.
    pub fn corrupt(&self, offset: u64) {
        let mut data = self.data.lock().unwrap();
        let idx = offset as usize;
        data[idx] ^= 0xFF;
    }
}

impl Device for MemDevice {
    fn read(&self, offset: u64, buf: &mut [u8]) -> bool {
        if self.fail_reads.load(Ordering::Relaxed) {
            return false;
        }
        let data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return false;
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        buf.copy_from_slice(&data[start..end]);
        true
    }

    fn write(&self, offset: u64, buf: &[u8]) -> bool {
        if self.fail_writes.load(Ordering::Relaxed) {
            return false;
        }
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return false;
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        data[start..end].copy_from_slice(buf);
        true
    }

    fn reset(&self, offset: u64, len: u64) -> bool {
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start + len as usize;
        if end > data.len() {
            return false;
        }
        self.resets.fetch_add(1, Ordering::Relaxed);
        data[start..end].fill(0);
        true
    }

    fn finish(&self, offset: u64, len: u64) -> bool {
        let data = self.data.lock().unwrap();
        let end = offset as usize + len as usize;
        if end > data.len() {
            return false;
        }
        self.finishes.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn io_zone_size(&self) -> u64 {
        self.zone_size
    }

    fn io_zone_cap_size(&self) -> u64 {
        self.zone_cap
    }
}
