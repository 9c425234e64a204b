//! Flash cache engine for small objects.
//!
//! The device is divided into fixed-size buckets and treated as an
//! on-device hash table: each key maps to one bucket by hash, buckets
//! hold variable-size entries and are read and written whole. There is no
//! in-memory key index: a per-bucket Bloom bank absorbs lookups of
//! absent keys, and a memory-resident write log batches inserts so each
//! bucket is rewritten once per flush rather than once per insert. Zone
//! writers hide the append-and-erase discipline of zoned SSDs behind a
//! logical bucket address, and a background cleaner keeps the zone rings
//! reclaimable.
//!
//! Reading or writing a single entry costs a whole bucket of I/O, which
//! makes the engine a poor fit for values beyond a fraction of the bucket
//! size and a very good fit for the sub-kilobyte objects it is tuned
//! for.

pub mod bucket;
mod config;
mod device;
mod engine;
pub mod error;
mod fwlog;
mod index;
mod metrics;
mod persist;
mod types;
mod wren;

pub use config::Config;
pub use device::{Device, IoBuffer, MemDevice, IO_ALIGNMENT};
pub use engine::Kangaroo;
pub use error::{Error, Result};
pub use fwlog::FwLog;
pub use index::{BloomFilterBank, HitBitVector};
pub use metrics::{Counter, Metrics};
pub use types::{BucketId, DestructorCallback, DestructorReason, HashedKey};
pub use wren::{EuId, Wren};
