//! Append-only entry buffer backing one log partition.
//!
//! Same entry framing as the set buckets, no RRIP counters and no
//! intra-log eviction: entries accumulate in arrival order until the
//! fixed byte capacity is exhausted, and space is reclaimed only when the
//! whole buffer resets after a flush drains it.

use super::Entry;
use crate::corrupt;
use crate::error::Result;

pub struct LogBucket {
    buf: Vec<u8>,
    write_pos: usize,
}

impl LogBucket {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            write_pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Append an entry, returning its offset, or `None` when the buffer
    /// is full.
    pub fn append(&mut self, entry: &Entry) -> Option<u32> {
        let size = entry.wire_size();
        if self.write_pos + size > self.buf.len() {
            return None;
        }
        let offset = self.write_pos;
        let mut slot = &mut self.buf[offset..offset + size];
        entry
            .encode_into(&mut slot)
            .expect("sized slot cannot overflow");
        self.write_pos += size;
        Some(offset as u32)
    }

    /// Decode the entry at `offset`.
    pub fn read(&self, offset: u32) -> Result<Entry> {
        let offset = offset as usize;
        if offset >= self.write_pos {
            return Err(corrupt!(
                "log offset {offset} beyond write position {}",
                self.write_pos
            ));
        }
        let mut data = &self.buf[offset..self.write_pos];
        Entry::decode_from(&mut data)
    }

    /// Discard all content. Only valid once every live entry has been
    /// collected out of the partition index.
    pub fn reset(&mut self) {
        self.write_pos = 0;
    }

    /// Raw content up to the write position, for the recovery snapshot.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.write_pos]
    }

    /// Restore from a recovery snapshot.
    pub fn restore(capacity: usize, data: &[u8]) -> Result<Self> {
        if data.len() > capacity {
            return Err(corrupt!(
                "log snapshot of {} bytes exceeds capacity {capacity}",
                data.len()
            ));
        }
        let mut bucket = Self::new(capacity);
        bucket.buf[..data.len()].copy_from_slice(data);
        bucket.write_pos = data.len();
        Ok(bucket)
    }
}
