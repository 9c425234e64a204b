//! Zone writer: presents a logical write-any-bucket API on top of an
//! append-only ring of erase units.
//!
//! Buckets are always appended at the write pointer; the EuIdentifier
//! table maps each logical bucket to its current physical slot. The erase
//! pointer chases the write pointer around the ring: the cleaner migrates
//! live buckets out of the erase unit it points at, then calls
//! [`Wren::erase`] to reclaim it. The two pointers meeting is write
//! pressure the engine must relieve through back-pressure; it is reported
//! as `BadState`, never by aborting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::badstate;
use crate::device::{Device, IoBuffer};
use crate::error::{Error, Result};
use crate::types::BucketId;

/// Physical slot identifier: `erase_unit * buckets_per_eu + slot`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EuId(u64);

impl EuId {
    const INVALID: u64 = u64::MAX;

    pub fn index(self) -> u64 {
        self.0
    }
}

struct WriteCursor {
    /// Erase unit currently receiving appends.
    write_eu: u64,
    /// Next bucket slot within `write_eu`.
    write_offset: u64,
}

/// Snapshot of the writer's persistent state.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct WrenSnapshot {
    pub table: Vec<u64>,
    pub write_eu: u64,
    pub write_offset: u64,
    pub erase_eu: u64,
}

pub struct Wren {
    device: Arc<dyn Device>,
    num_eus: u64,
    num_buckets: u64,
    bucket_size: u64,
    region_offset: u64,
    buckets_per_eu: u64,
    /// EuIdentifier table: one entry per logical bucket, `EuId::INVALID`
    /// until first written. Read lock-free; stores are ordered by the
    /// write mutex.
    table: Vec<AtomicU64>,
    cursor: Mutex<WriteCursor>,
    erase_eu: AtomicU64,
}

impl Wren {
    pub fn new(
        device: Arc<dyn Device>,
        num_buckets: u64,
        bucket_size: u64,
        region_size: u64,
        region_offset: u64,
    ) -> Result<Self> {
        let eu_cap = device.io_zone_cap_size();
        if bucket_size == 0 || eu_cap < bucket_size {
            return Err(badstate!(
                "bucket size {bucket_size} does not fit zone capacity {eu_cap}"
            ));
        }
        // Erase units are io_zone_size apart even when only eu_cap bytes
        // of each are usable.
        let num_eus = region_size / device.io_zone_size();
        if num_eus < 2 {
            return Err(badstate!(
                "zone region of {region_size} bytes holds {num_eus} erase units, need at least 2"
            ));
        }
        let buckets_per_eu = eu_cap / bucket_size;
        let table = (0..num_buckets).map(|_| AtomicU64::new(EuId::INVALID)).collect();
        tracing::info!(
            num_eus,
            buckets_per_eu,
            num_buckets,
            bucket_size,
            region_offset,
            "zone writer initialized"
        );
        Ok(Self {
            device,
            num_eus,
            num_buckets,
            bucket_size,
            region_offset,
            buckets_per_eu,
            table,
            cursor: Mutex::new(WriteCursor {
                write_eu: 0,
                write_offset: 0,
            }),
            erase_eu: AtomicU64::new(num_eus - 1),
        })
    }

    pub fn num_eus(&self) -> u64 {
        self.num_eus
    }

    pub fn bucket_size(&self) -> u64 {
        self.bucket_size
    }

    fn eu_id(&self, erase_unit: u64, offset: u64) -> EuId {
        EuId(erase_unit * self.buckets_per_eu + offset)
    }

    /// Byte offset of a physical slot. Zones are `io_zone_size` apart but
    /// only `eu_cap` bytes of each are usable.
    fn location(&self, euid: EuId) -> u64 {
        let zone = euid.0 / self.buckets_per_eu;
        let slot = euid.0 % self.buckets_per_eu;
        self.region_offset + zone * self.device.io_zone_size() + slot * self.bucket_size
    }

    fn zone_start(&self, erase_unit: u64) -> u64 {
        self.location(self.eu_id(erase_unit, 0))
    }

    /// The bucket's current physical slot, if it was ever written.
    pub fn current_euid(&self, bid: BucketId) -> Option<EuId> {
        let raw = self.table[bid.index() as usize].load(Ordering::Acquire);
        (raw != EuId::INVALID).then_some(EuId(raw))
    }

    /// Read the current physical copy of a bucket. `Ok(None)` means the
    /// bucket was never written; no I/O is issued for it.
    pub fn read(&self, bid: BucketId) -> Result<Option<IoBuffer>> {
        let Some(euid) = self.current_euid(bid) else {
            return Ok(None);
        };
        let loc = self.location(euid);
        let mut buf = self.device.make_io_buffer(self.bucket_size as usize);
        if !self.device.read(loc, &mut buf) {
            return Err(Error::Device(format!(
                "bucket read failed at offset {loc}"
            )));
        }
        Ok(Some(buf))
    }

    /// Append a bucket at the write pointer and repoint its EuIdentifier.
    /// The identifier is updated only after the device accepts the write;
    /// on failure the previous physical copy stays live.
    pub fn write(&self, bid: BucketId, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len() as u64, self.bucket_size);
        let mut cursor = self.cursor.lock().unwrap();

        if cursor.write_eu == self.erase_eu.load(Ordering::Acquire) {
            tracing::error!(
                write_eu = cursor.write_eu,
                "write pointer caught the erase pointer, zone ring saturated"
            );
            return Err(badstate!("zone ring saturated at erase unit {}", cursor.write_eu));
        }

        if cursor.write_offset == 0 && !self.device.reset(self.zone_start(cursor.write_eu), self.device.io_zone_size()) {
            return Err(Error::Device(format!(
                "zone reset failed for erase unit {}",
                cursor.write_eu
            )));
        }

        let euid = self.eu_id(cursor.write_eu, cursor.write_offset);
        let loc = self.location(euid);
        if !self.device.write(loc, buf) {
            tracing::warn!(
                bucket = bid.index(),
                offset = loc,
                "bucket write failed, keeping previous copy"
            );
            return Err(Error::Device(format!(
                "bucket write failed at offset {loc}"
            )));
        }
        self.table[bid.index() as usize].store(euid.0, Ordering::Release);

        cursor.write_offset += 1;
        if cursor.write_offset >= self.buckets_per_eu {
            if !self
                .device
                .finish(self.zone_start(cursor.write_eu), self.device.io_zone_size())
            {
                tracing::warn!(write_eu = cursor.write_eu, "zone finish failed");
            }
            cursor.write_eu = (cursor.write_eu + 1) % self.num_eus;
            cursor.write_offset = 0;
            tracing::debug!(write_eu = cursor.write_eu, "advanced write pointer");
        }
        Ok(())
    }

    /// True when the modular distance from the write pointer to the erase
    /// pointer has shrunk to `threshold * num_eus` erase units or fewer.
    pub fn should_clean(&self, threshold: f64) -> bool {
        let write_eu = self.cursor.lock().unwrap().write_eu;
        let erase_eu = self.erase_eu.load(Ordering::Acquire);
        let free_eus = if erase_eu >= write_eu {
            erase_eu - write_eu
        } else {
            erase_eu + (self.num_eus - write_eu)
        };
        free_eus as f64 <= threshold * self.num_eus as f64
    }

    /// Reclaim the erase unit at the erase pointer and advance it. Every
    /// live bucket must have been migrated out first.
    pub fn erase(&self) -> Result<()> {
        let eu = self.erase_eu.load(Ordering::Acquire);
        let loc = self.zone_start(eu);
        if !self.device.reset(loc, self.device.io_zone_size()) {
            return Err(Error::Device(format!(
                "zone reset failed for erase unit {eu}"
            )));
        }
        let next = (eu + 1) % self.num_eus;
        self.erase_eu.store(next, Ordering::Release);
        tracing::debug!(erased = eu, erase_eu = next, "advanced erase pointer");
        Ok(())
    }

    /// Every bucket whose current copy sits in the erase unit about to be
    /// reclaimed, by scanning the EuIdentifier table.
    pub fn buckets_in_erase_eu(&self) -> Vec<BucketId> {
        let erase_eu = self.erase_eu.load(Ordering::Acquire);
        let mut out = Vec::new();
        for (i, slot) in self.table.iter().enumerate() {
            let raw = slot.load(Ordering::Acquire);
            if raw != EuId::INVALID && raw / self.buckets_per_eu == erase_eu {
                out.push(BucketId::new(i as u32));
            }
        }
        out
    }

    /// Drop a bucket's identifier so it reads as never written. Caller
    /// holds the bucket's write lock.
    pub fn invalidate(&self, bid: BucketId) {
        self.table[bid.index() as usize].store(EuId::INVALID, Ordering::Release);
    }

    /// Forget all written data, returning the ring to its initial state.
    pub fn clear(&self) {
        for slot in &self.table {
            slot.store(EuId::INVALID, Ordering::Release);
        }
        let mut cursor = self.cursor.lock().unwrap();
        cursor.write_eu = 0;
        cursor.write_offset = 0;
        self.erase_eu.store(self.num_eus - 1, Ordering::Release);
    }

    pub(crate) fn snapshot(&self) -> WrenSnapshot {
        let cursor = self.cursor.lock().unwrap();
        WrenSnapshot {
            table: self.table.iter().map(|s| s.load(Ordering::Acquire)).collect(),
            write_eu: cursor.write_eu,
            write_offset: cursor.write_offset,
            erase_eu: self.erase_eu.load(Ordering::Acquire),
        }
    }

    pub(crate) fn restore(&self, snap: &WrenSnapshot) -> Result<()> {
        if snap.table.len() as u64 != self.num_buckets
            || snap.write_eu >= self.num_eus
            || snap.erase_eu >= self.num_eus
            || snap.write_offset >= self.buckets_per_eu
        {
            return Err(badstate!("zone writer snapshot does not match geometry"));
        }
        for (slot, raw) in self.table.iter().zip(&snap.table) {
            slot.store(*raw, Ordering::Release);
        }
        let mut cursor = self.cursor.lock().unwrap();
        cursor.write_eu = snap.write_eu;
        cursor.write_offset = snap.write_offset;
        self.erase_eu.store(snap.erase_eu, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    const ZONE: u64 = 16 * 1024;
    const BUCKET: u64 = 4 * 1024;

    fn wren(num_eus: u64, num_buckets: u64) -> (Arc<MemDevice>, Wren) {
        let device = Arc::new(MemDevice::new(num_eus * ZONE, ZONE));
        let wren = Wren::new(device.clone(), num_buckets, BUCKET, num_eus * ZONE, 0).unwrap();
        (device, wren)
    }

    fn bucket_bytes(fill: u8) -> Vec<u8> {
        vec![fill; BUCKET as usize]
    }

    #[test]
    fn test_never_written_reads_none_without_io() {
        let (device, wren) = wren(4, 8);
        assert!(wren.read(BucketId::new(3)).unwrap().is_none());
        assert_eq!(device.read_count(), 0);
    }

    #[test]
    fn test_write_read_round_trip() {
        let (_device, wren) = wren(4, 8);
        wren.write(BucketId::new(5), &bucket_bytes(0xAB)).unwrap();
        let buf = wren.read(BucketId::new(5)).unwrap().unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_rewrites_move_bucket_forward() {
        let (_device, wren) = wren(4, 8);
        wren.write(BucketId::new(0), &bucket_bytes(1)).unwrap();
        let first = wren.current_euid(BucketId::new(0)).unwrap();
        wren.write(BucketId::new(0), &bucket_bytes(2)).unwrap();
        let second = wren.current_euid(BucketId::new(0)).unwrap();
        assert_ne!(first, second);
        let buf = wren.read(BucketId::new(0)).unwrap().unwrap();
        assert!(buf.iter().all(|&b| b == 2));
    }

    #[test]
    fn test_failed_write_keeps_identifier() {
        let (device, wren) = wren(4, 8);
        wren.write(BucketId::new(0), &bucket_bytes(1)).unwrap();
        let before = wren.current_euid(BucketId::new(0)).unwrap();
        device.set_fail_writes(true);
        assert!(wren.write(BucketId::new(0), &bucket_bytes(2)).is_err());
        assert_eq!(wren.current_euid(BucketId::new(0)).unwrap(), before);
        device.set_fail_writes(false);
        let buf = wren.read(BucketId::new(0)).unwrap().unwrap();
        assert!(buf.iter().all(|&b| b == 1));
    }

    #[test]
    fn test_should_clean_threshold() {
        // 4 EUs, 4 buckets each; erase pointer starts at EU 3.
        let (_device, wren) = wren(4, 64);
        assert!(!wren.should_clean(0.25));
        // Fill EUs 0..3 (12 writes) so the write pointer lands on EU 3.
        for i in 0..12 {
            wren.write(BucketId::new(i), &bucket_bytes(i as u8)).unwrap();
        }
        assert!(wren.should_clean(0.25));
    }

    #[test]
    fn test_saturated_ring_is_bad_state() {
        let (_device, wren) = wren(4, 64);
        for i in 0..12 {
            wren.write(BucketId::new(i), &bucket_bytes(0)).unwrap();
        }
        // Write pointer reached the erase pointer: fail closed.
        let err = wren.write(BucketId::new(12), &bucket_bytes(0)).unwrap_err();
        assert!(matches!(err, Error::BadState(_)));
    }

    #[test]
    fn test_erase_advances_and_unblocks() {
        let (_device, wren) = wren(4, 64);
        for i in 0..12 {
            wren.write(BucketId::new(i), &bucket_bytes(0)).unwrap();
        }
        assert!(wren.buckets_in_erase_eu().is_empty());
        wren.erase().unwrap();
        wren.write(BucketId::new(12), &bucket_bytes(0)).unwrap();
        // EU 0 is now next in line for reclamation and holds buckets 0..4.
        let pending = wren.buckets_in_erase_eu();
        assert_eq!(
            pending,
            vec![BucketId::new(0), BucketId::new(1), BucketId::new(2), BucketId::new(3)]
        );
    }

    #[test]
    fn test_erase_resets_zone_bytes() {
        let (device, wren) = wren(4, 64);
        for i in 0..12 {
            wren.write(BucketId::new(i), &bucket_bytes(0xEE)).unwrap();
        }
        wren.erase().unwrap(); // reclaims EU 3 (empty)
        wren.erase().unwrap(); // reclaims EU 0
        let mut probe = [0u8; 16];
        assert!(device.read(0, &mut probe));
        assert!(probe.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_identifiers_stay_between_pointers() {
        let (_device, wren) = wren(4, 64);
        for round in 0u32..3 {
            for i in 0..4 {
                wren.write(BucketId::new(round * 4 + i), &bucket_bytes(0)).unwrap();
            }
        }
        wren.erase().unwrap();
        // After a reclamation pass nothing may point at the erased unit.
        let erased = 3;
        for i in 0..64u32 {
            if let Some(euid) = wren.current_euid(BucketId::new(i)) {
                assert_ne!(euid.index() / 4, erased);
            }
        }
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let (_device, wren_a) = wren(4, 8);
        wren_a.write(BucketId::new(1), &bucket_bytes(7)).unwrap();
        wren_a.write(BucketId::new(2), &bucket_bytes(8)).unwrap();
        let snap = wren_a.snapshot();

        let (_device2, other) = wren(4, 8);
        other.restore(&snap).unwrap();
        assert_eq!(other.current_euid(BucketId::new(1)), wren_a.current_euid(BucketId::new(1)));
        assert_eq!(other.current_euid(BucketId::new(2)), wren_a.current_euid(BucketId::new(2)));
    }

    #[test]
    fn test_restore_rejects_geometry_mismatch() {
        let (_device, wren_a) = wren(4, 8);
        let mut snap = wren_a.snapshot();
        snap.table.push(0);
        let (_device2, other) = wren(4, 8);
        assert!(other.restore(&snap).is_err());
    }

    #[test]
    fn test_zone_cap_smaller_than_zone_size() {
        // ZNS shape: 16 KiB stride, 12 KiB usable, so 3 buckets per EU
        // and a gap before each zone boundary.
        let device = Arc::new(MemDevice::with_zone_cap(4 * ZONE, ZONE, 12 * 1024));
        let wren = Wren::new(device.clone(), 16, BUCKET, 4 * ZONE, 0).unwrap();
        for i in 0..4 {
            wren.write(BucketId::new(i), &bucket_bytes(i as u8 + 1)).unwrap();
        }
        // Fourth write landed in the second zone, past the 16 KiB stride.
        let euid = wren.current_euid(BucketId::new(3)).unwrap();
        assert_eq!(euid.index() / 3, 1);
        let buf = wren.read(BucketId::new(3)).unwrap().unwrap();
        assert!(buf.iter().all(|&b| b == 4));
    }
}
