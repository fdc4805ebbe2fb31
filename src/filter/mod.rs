//! Transaction-hash filter index: per-block buckets of 4-byte hash
//! prefixes, pooled per block file, scanned in parallel to produce
//! candidate (block, tx-index) sets for address-history queries.

pub mod bucket;
pub mod pool;
pub mod scan;

pub use bucket::{short_hash, BlockHashMap, BlockHashVector};
pub use pool::{PoolMode, PoolReader, PoolWriter};
pub use scan::{scan_hashes, BlockHits, FileHits, PoolSource, ScanResult};
