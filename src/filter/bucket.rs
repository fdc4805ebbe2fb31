//! Per-block buckets of 4-byte transaction-hash prefixes.
//!
//! Wire shape (little-endian throughout): `total_size(u32) ‖ block_key(u32)
//! ‖ count(u32) ‖ count × short_hash(u32)`. The position of a short hash in
//! its bucket is the transaction's index within the block.

use std::collections::{BTreeSet, HashMap};

use crate::error::{Result, WalletError};

pub const BUCKET_HEADER_LEN: usize = 12;

/// First 4 bytes of a tx hash, read little-endian.
pub fn short_hash(full_hash: &[u8]) -> Result<u32> {
    if full_hash.len() != 32 {
        return Err(WalletError::InvalidArgument("tx hash must be 32 bytes".into()));
    }
    Ok(u32::from_le_bytes(full_hash[..4].try_into().unwrap()))
}

/// Vector-form bucket: linear scan per lookup, cheapest to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHashVector {
    block_key: u32,
    short_hashes: Vec<u32>,
}

impl BlockHashVector {
    pub fn new(block_key: u32) -> Self {
        BlockHashVector { block_key, short_hashes: Vec::new() }
    }

    pub fn block_key(&self) -> u32 {
        self.block_key
    }

    pub fn len(&self) -> usize {
        self.short_hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.short_hashes.is_empty()
    }

    pub fn reserve(&mut self, additional: usize) {
        self.short_hashes.reserve(additional);
    }

    /// Append one tx hash; the new entry's position is its tx index.
    pub fn update(&mut self, full_hash: &[u8]) -> Result<()> {
        self.short_hashes.push(short_hash(full_hash)?);
        Ok(())
    }

    pub fn update_many(&mut self, hashes: &[Vec<u8>]) -> Result<()> {
        self.reserve(hashes.len());
        for hash in hashes {
            self.update(hash)?;
        }
        Ok(())
    }

    /// Tx indices whose short hash matches.
    pub fn compare(&self, key: u32) -> BTreeSet<u32> {
        self.short_hashes
            .iter()
            .enumerate()
            .filter(|(_, &hash)| hash == key)
            .map(|(index, _)| index as u32)
            .collect()
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        let total = (BUCKET_HEADER_LEN + self.short_hashes.len() * 4) as u32;
        out.extend_from_slice(&total.to_le_bytes());
        out.extend_from_slice(&self.block_key.to_le_bytes());
        out.extend_from_slice(&(self.short_hashes.len() as u32).to_le_bytes());
        for hash in &self.short_hashes {
            out.extend_from_slice(&hash.to_le_bytes());
        }
    }

    /// Parse one bucket from the head of `data`; returns the bucket and its
    /// encoded size.
    pub fn deserialize(data: &[u8]) -> Result<(BlockHashVector, usize)> {
        let (block_key, count, total) = read_bucket_header(data)?;
        let mut short_hashes = Vec::with_capacity(count);
        for i in 0..count {
            let start = BUCKET_HEADER_LEN + i * 4;
            short_hashes.push(u32::from_le_bytes(data[start..start + 4].try_into().unwrap()));
        }
        Ok((BlockHashVector { block_key, short_hashes }, total))
    }
}

fn read_bucket_header(data: &[u8]) -> Result<(u32, usize, usize)> {
    if data.len() < BUCKET_HEADER_LEN {
        return Err(WalletError::InvalidArgument("truncated filter bucket".into()));
    }
    let total = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
    let block_key = u32::from_le_bytes(data[4..8].try_into().unwrap());
    let count = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
    if total != BUCKET_HEADER_LEN + count * 4 || data.len() < total {
        return Err(WalletError::InvalidArgument("filter bucket size mismatch".into()));
    }
    Ok((block_key, count, total))
}

/// Map-form bucket: `short_hash → tx indices`, for mid-sized needle sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHashMap {
    block_key: u32,
    map: HashMap<u32, BTreeSet<u32>>,
    len: usize,
}

impl BlockHashMap {
    pub fn block_key(&self) -> u32 {
        self.block_key
    }

    /// Number of transactions indexed, counting short-hash duplicates.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn compare(&self, key: u32) -> BTreeSet<u32> {
        self.map.get(&key).cloned().unwrap_or_default()
    }

    pub fn deserialize(data: &[u8]) -> Result<(BlockHashMap, usize)> {
        let (block_key, count, total) = read_bucket_header(data)?;
        let mut map: HashMap<u32, BTreeSet<u32>> = HashMap::with_capacity(count);
        for i in 0..count {
            let start = BUCKET_HEADER_LEN + i * 4;
            let hash = u32::from_le_bytes(data[start..start + 4].try_into().unwrap());
            map.entry(hash).or_default().insert(i as u32);
        }
        Ok((BlockHashMap { block_key, map, len: count }, total))
    }
}
