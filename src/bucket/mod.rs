//! On-device bucket codecs.
//!
//! Set buckets ([`RripBucket`]) and the log's append buffers
//! ([`LogBucket`]) share one entry framing:
//!
//! ```text
//! +----------+---------+------------+--------------+-----+-------+
//! | hash:u64 | flags:u8| key_len:u16| value_len:u16| key | value |
//! +----------+---------+------------+--------------+-----+-------+
//! ```
//!
//! `flags` carries the 2-bit RRIP counter for set entries, and the
//! tombstone / hit markers for log entries. All integers are big-endian.

mod log;
mod rrip;

pub use log::LogBucket;
pub use rrip::{Insertion, RripBucket, BUCKET_HEADER_SIZE};

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::corrupt;

pub(crate) const ENTRY_HEADER_SIZE: usize = 8 + 1 + 2 + 2;

const RRIP_MASK: u8 = 0b0000_0011;
const FLAG_TOMBSTONE: u8 = 0b0000_0100;
const FLAG_HIT: u8 = 0b0000_1000;

/// Highest RRIP counter value; an entry at this value is the next
/// eviction victim.
pub(crate) const MAX_RRIP: u8 = 3;

/// Counter assigned to freshly admitted entries: a long predicted
/// re-reference interval, one aging step away from eviction candidacy.
pub(crate) const DEFAULT_RRIP: u8 = 2;

/// A packed cache entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub hash: u64,
    pub flags: u8,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Entry {
    pub fn new(hash: u64, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            hash,
            flags: DEFAULT_RRIP,
            key,
            value,
        }
    }

    /// A removal marker. Carries no value and no counter.
    pub fn tombstone(hash: u64, key: Vec<u8>) -> Self {
        Self {
            hash,
            flags: FLAG_TOMBSTONE,
            key,
            value: Vec::new(),
        }
    }

    pub fn rrip(&self) -> u8 {
        self.flags & RRIP_MASK
    }

    pub fn set_rrip(&mut self, value: u8) {
        debug_assert!(value <= MAX_RRIP);
        self.flags = (self.flags & !RRIP_MASK) | (value & RRIP_MASK);
    }

    pub fn is_tombstone(&self) -> bool {
        self.flags & FLAG_TOMBSTONE != 0
    }

    pub fn hit(&self) -> bool {
        self.flags & FLAG_HIT != 0
    }

    pub fn set_hit(&mut self, hit: bool) {
        if hit {
            self.flags |= FLAG_HIT;
        } else {
            self.flags &= !FLAG_HIT;
        }
    }

    pub fn matches(&self, hash: u64, key: &[u8]) -> bool {
        self.hash == hash && self.key == key
    }

    /// Encoded size in bytes.
    pub fn wire_size(&self) -> usize {
        ENTRY_HEADER_SIZE + self.key.len() + self.value.len()
    }

    pub fn encode_into<W: Write>(&self, writer: &mut W) -> Result<()> {
        if self.key.len() > u16::MAX as usize || self.value.len() > u16::MAX as usize {
            return Err(corrupt!(
                "entry too large to frame: key {} value {}",
                self.key.len(),
                self.value.len()
            ));
        }
        writer
            .write_u64::<BigEndian>(self.hash)
            .map_err(|e| corrupt!("encode hash: {e}"))?;
        writer
            .write_u8(self.flags)
            .map_err(|e| corrupt!("encode flags: {e}"))?;
        writer
            .write_u16::<BigEndian>(self.key.len() as u16)
            .map_err(|e| corrupt!("encode key_len: {e}"))?;
        writer
            .write_u16::<BigEndian>(self.value.len() as u16)
            .map_err(|e| corrupt!("encode value_len: {e}"))?;
        writer
            .write_all(&self.key)
            .map_err(|e| corrupt!("encode key: {e}"))?;
        writer
            .write_all(&self.value)
            .map_err(|e| corrupt!("encode value: {e}"))?;
        Ok(())
    }

    pub fn decode_from<R: Read>(reader: &mut R) -> Result<Self> {
        let hash = reader
            .read_u64::<BigEndian>()
            .map_err(|e| corrupt!("decode hash: {e}"))?;
        let flags = reader.read_u8().map_err(|e| corrupt!("decode flags: {e}"))?;
        let key_len = reader
            .read_u16::<BigEndian>()
            .map_err(|e| corrupt!("decode key_len: {e}"))? as usize;
        let value_len = reader
            .read_u16::<BigEndian>()
            .map_err(|e| corrupt!("decode value_len: {e}"))? as usize;
        let mut key = vec![0u8; key_len];
        reader
            .read_exact(&mut key)
            .map_err(|e| corrupt!("decode key: {e}"))?;
        let mut value = vec![0u8; value_len];
        reader
            .read_exact(&mut value)
            .map_err(|e| corrupt!("decode value: {e}"))?;
        Ok(Self {
            hash,
            flags,
            key,
            value,
        })
    }
}
