//! In-memory auxiliary indices: the per-bucket Bloom filter bank and the
//! per-slot hit bit-vector. Both are sized once at startup and mutated
//! under the owning bucket's lock; the backing words are atomic so that
//! rewrites of neighboring buckets never race on shared storage.

mod bitvec;
mod bloom;

pub use bitvec::HitBitVector;
pub use bloom::BloomFilterBank;
