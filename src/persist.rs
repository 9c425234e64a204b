//! Recovery snapshot records.
//!
//! `persist` serializes the whole auxiliary state (EuIdentifier tables
//! and zone cursors, log buffers and index, Bloom bank, hit bit-vector,
//! generation and item counts) through a caller-supplied writer. The set
//! data itself stays on the device; recovery only has to agree with it,
//! which the geometry fingerprint and generation stamp enforce.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::corrupt;
use crate::error::Result;
use crate::fwlog::LogSnapshot;
use crate::wren::WrenSnapshot;

/// Serialization format version. Never 0; versions 1–9 are reserved for
/// testing.
pub(crate) const FORMAT_VERSION: u32 = 10;

#[derive(Serialize, Deserialize)]
pub(crate) struct Snapshot {
    pub version: u32,
    pub generation: u64,

    // Geometry fingerprint: recovery refuses a snapshot taken under a
    // different layout, since every persisted offset would be wrong.
    pub num_buckets: u64,
    pub bucket_size: u32,
    pub hot_bucket_size: u32,

    pub item_count: u64,
    pub log_item_count: u64,
    pub set_item_count: u64,

    pub cold: WrenSnapshot,
    pub hot: Option<WrenSnapshot>,
    pub log: LogSnapshot,
    pub bloom: Option<Vec<u64>>,
    pub bit_vector: Vec<u64>,
}

pub(crate) fn write_snapshot<W: Write + ?Sized>(writer: &mut W, snapshot: &Snapshot) -> Result<()> {
    bincode::serialize_into(writer, snapshot)
        .map_err(|e| corrupt!("snapshot serialization failed: {e}"))
}

pub(crate) fn read_snapshot<R: Read + ?Sized>(reader: &mut R) -> Result<Snapshot> {
    bincode::deserialize_from(reader).map_err(|e| corrupt!("snapshot deserialization failed: {e}"))
}
