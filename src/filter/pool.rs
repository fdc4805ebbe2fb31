//! Per-block-file pools of filter buckets.
//!
//! A pool serializes as `bucket_count(u32 LE) ‖ concatenated buckets`.
//! Pools are append-only: new blocks add buckets to the current file's
//! pool; existing pools are never rewritten.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{Result, WalletError};
use crate::filter::bucket::{short_hash, BlockHashMap, BlockHashVector};

/// How a reader indexes a pool for lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// Pick by needle count.
    Auto,
    /// Linear scan per bucket; up to ~200 needles.
    BucketVector,
    /// Per-bucket hash map; up to ~2300 needles.
    BucketMap,
    /// One map over the whole file; beyond that.
    PoolMap,
}

pub const BUCKET_VECTOR_NEEDLE_LIMIT: usize = 200;
pub const BUCKET_MAP_NEEDLE_LIMIT: usize = 2300;

impl PoolMode {
    pub fn for_needle_count(count: usize) -> PoolMode {
        if count <= BUCKET_VECTOR_NEEDLE_LIMIT {
            PoolMode::BucketVector
        } else if count <= BUCKET_MAP_NEEDLE_LIMIT {
            PoolMode::BucketMap
        } else {
            PoolMode::PoolMap
        }
    }
}

/// Builds and extends pool serializations.
#[derive(Debug, Default)]
pub struct PoolWriter {
    existing: Vec<u8>,
    pending: BTreeMap<u32, BlockHashVector>,
}

impl PoolWriter {
    pub fn new() -> Self {
        PoolWriter::default()
    }

    /// Start from an already serialized pool; its buckets are kept as-is.
    pub fn from_serialized(existing: Vec<u8>) -> Result<Self> {
        if !existing.is_empty() && existing.len() < 4 {
            return Err(WalletError::InvalidArgument("truncated filter pool".into()));
        }
        Ok(PoolWriter { existing, pending: BTreeMap::new() })
    }

    pub fn is_empty(&self) -> bool {
        self.existing.is_empty() && self.pending.is_empty()
    }

    /// Queue buckets for append.
    pub fn update(&mut self, buckets: impl IntoIterator<Item = BlockHashVector>) {
        for bucket in buckets {
            self.pending.insert(bucket.block_key(), bucket);
        }
    }

    /// Serialize: existing buckets verbatim, pending buckets appended,
    /// count header rewritten.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if self.is_empty() {
            return Err(WalletError::InvalidArgument("empty filter pool".into()));
        }

        let existing_count = if self.existing.is_empty() {
            0
        } else {
            u32::from_le_bytes(self.existing[..4].try_into().unwrap())
        };
        let total = existing_count + self.pending.len() as u32;

        let mut out = Vec::with_capacity(self.existing.len().max(4) + self.pending.len() * 64);
        out.extend_from_slice(&total.to_le_bytes());
        if !self.existing.is_empty() {
            out.extend_from_slice(&self.existing[4..]);
        }
        for bucket in self.pending.values() {
            bucket.serialize(&mut out);
        }
        Ok(out)
    }
}

enum ReaderIndex {
    /// Raw bytes, buckets parsed per lookup.
    Vector(Vec<u8>),
    /// block_key → map bucket
    BucketMaps(BTreeMap<u32, BlockHashMap>),
    /// short_hash → block_key → tx indices
    PoolMap(HashMap<u32, BTreeMap<u32, BTreeSet<u32>>>),
}

/// Read-side view of one pool.
pub struct PoolReader {
    index: ReaderIndex,
}

impl PoolReader {
    pub fn new(data: &[u8], mode: PoolMode) -> Result<PoolReader> {
        if data.len() < 4 {
            return Err(WalletError::InvalidArgument("truncated filter pool".into()));
        }
        let bucket_count = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;

        let index = match mode {
            PoolMode::Auto => {
                return Err(WalletError::InvalidArgument(
                    "auto mode must be resolved before constructing a reader".into(),
                ))
            }
            PoolMode::BucketVector => ReaderIndex::Vector(data.to_vec()),
            PoolMode::BucketMap => {
                let mut buckets = BTreeMap::new();
                let mut pos = 4;
                for _ in 0..bucket_count {
                    let (bucket, consumed) = BlockHashMap::deserialize(&data[pos..])?;
                    buckets.insert(bucket.block_key(), bucket);
                    pos += consumed;
                }
                ReaderIndex::BucketMaps(buckets)
            }
            PoolMode::PoolMap => {
                let mut map: HashMap<u32, BTreeMap<u32, BTreeSet<u32>>> = HashMap::new();
                let mut pos = 4;
                for _ in 0..bucket_count {
                    let (bucket, consumed) = BlockHashVector::deserialize(&data[pos..])?;
                    let encoded = &data[pos + 12..pos + consumed];
                    for (tx_index, chunk) in encoded.chunks_exact(4).enumerate() {
                        let hash = u32::from_le_bytes(chunk.try_into().unwrap());
                        map.entry(hash)
                            .or_default()
                            .entry(bucket.block_key())
                            .or_default()
                            .insert(tx_index as u32);
                    }
                    pos += consumed;
                }
                ReaderIndex::PoolMap(map)
            }
        };

        Ok(PoolReader { index })
    }

    /// Candidate `(block_key → tx indices)` for one full hash.
    pub fn compare(&self, full_hash: &[u8]) -> Result<BTreeMap<u32, BTreeSet<u32>>> {
        let key = short_hash(full_hash)?;
        let mut hits = BTreeMap::new();

        match &self.index {
            ReaderIndex::Vector(data) => {
                let bucket_count = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
                let mut pos = 4;
                for _ in 0..bucket_count {
                    let (bucket, consumed) = BlockHashVector::deserialize(&data[pos..])?;
                    let matches = bucket.compare(key);
                    if !matches.is_empty() {
                        hits.insert(bucket.block_key(), matches);
                    }
                    pos += consumed;
                }
            }
            ReaderIndex::BucketMaps(buckets) => {
                for bucket in buckets.values() {
                    let matches = bucket.compare(key);
                    if !matches.is_empty() {
                        hits.insert(bucket.block_key(), matches);
                    }
                }
            }
            ReaderIndex::PoolMap(map) => {
                if let Some(blocks) = map.get(&key) {
                    hits = blocks.clone();
                }
            }
        }

        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::sha256;

    fn tx_hash(tag: &[u8]) -> Vec<u8> {
        sha256(tag).to_vec()
    }

    fn bucket(block_key: u32, tags: &[&[u8]]) -> BlockHashVector {
        let mut bucket = BlockHashVector::new(block_key);
        for tag in tags {
            bucket.update(&tx_hash(tag)).unwrap();
        }
        bucket
    }

    fn sample_pool() -> Vec<u8> {
        let mut writer = PoolWriter::new();
        writer.update([bucket(0, &[b"a", b"b"]), bucket(1, &[b"c"])]);
        writer.serialize().unwrap()
    }

    #[test]
    fn all_modes_agree() {
        let pool = sample_pool();
        for mode in [PoolMode::BucketVector, PoolMode::BucketMap, PoolMode::PoolMap] {
            let reader = PoolReader::new(&pool, mode).unwrap();
            let hits = reader.compare(&tx_hash(b"a")).unwrap();
            assert_eq!(hits, BTreeMap::from([(0, BTreeSet::from([0]))]), "{mode:?}");

            let hits = reader.compare(&tx_hash(b"c")).unwrap();
            assert_eq!(hits, BTreeMap::from([(1, BTreeSet::from([0]))]), "{mode:?}");

            assert!(reader.compare(&tx_hash(b"z")).unwrap().is_empty(), "{mode:?}");
        }
    }

    #[test]
    fn append_only_extension() {
        let first = sample_pool();
        let mut writer = PoolWriter::from_serialized(first.clone()).unwrap();
        writer.update([bucket(2, &[b"d", b"e"])]);
        let extended = writer.serialize().unwrap();

        // old serialization is a prefix (modulo the count header)
        assert_eq!(&extended[4..first.len()], &first[4..]);
        assert_eq!(u32::from_le_bytes(extended[..4].try_into().unwrap()), 3);

        let reader = PoolReader::new(&extended, PoolMode::BucketVector).unwrap();
        let hits = reader.compare(&tx_hash(b"e")).unwrap();
        assert_eq!(hits, BTreeMap::from([(2, BTreeSet::from([1]))]));
    }

    #[test]
    fn mode_selection_thresholds() {
        assert_eq!(PoolMode::for_needle_count(1), PoolMode::BucketVector);
        assert_eq!(PoolMode::for_needle_count(200), PoolMode::BucketVector);
        assert_eq!(PoolMode::for_needle_count(201), PoolMode::BucketMap);
        assert_eq!(PoolMode::for_needle_count(2300), PoolMode::BucketMap);
        assert_eq!(PoolMode::for_needle_count(2301), PoolMode::PoolMap);
    }

    #[test]
    fn empty_pool_refused() {
        assert!(PoolWriter::new().serialize().is_err());
        assert!(PoolReader::new(&[], PoolMode::BucketVector).is_err());
    }
}
