//! Multithreaded prefix scan over many block-file pools.
//!
//! Files are handed out to workers through a shared counter; each worker
//! fetches pool bytes via the caller's callback, picks an index mode for
//! the needle count, and collects candidate hits. Hits are candidates
//! only: the caller re-reads the referenced block and confirms full-hash
//! equality.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::error::Result;
use crate::filter::pool::{PoolMode, PoolReader};

/// Candidate hits for one hash within one file:
/// `block_key → tx indices`.
pub type BlockHits = BTreeMap<u32, BTreeSet<u32>>;

/// Per-file results: `full hash → hits`.
pub type FileHits = BTreeMap<Vec<u8>, BlockHits>;

/// Scan result: `file id → per-hash candidate sets`. Files with no hits map
/// to an empty set.
pub type ScanResult = BTreeMap<u32, FileHits>;

/// Fetches the serialized pool for a file id; empty means "no pool".
pub trait PoolSource: Sync {
    fn fetch(&self, file_id: u32) -> Vec<u8>;
}

impl<F> PoolSource for F
where
    F: Fn(u32) -> Vec<u8> + Sync,
{
    fn fetch(&self, file_id: u32) -> Vec<u8> {
        self(file_id)
    }
}

fn scan_one_file(
    source: &dyn PoolSource,
    file_id: u32,
    hashes: &BTreeSet<Vec<u8>>,
    mode: PoolMode,
) -> Result<FileHits> {
    let data = source.fetch(file_id);
    if data.is_empty() {
        return Ok(FileHits::new());
    }

    let resolved = match mode {
        PoolMode::Auto => PoolMode::for_needle_count(hashes.len()),
        explicit => explicit,
    };
    let reader = PoolReader::new(&data, resolved)?;

    let mut hits = FileHits::new();
    for hash in hashes {
        let blocks = reader.compare(hash)?;
        if !blocks.is_empty() {
            hits.insert(hash.clone(), blocks);
        }
    }
    Ok(hits)
}

/// Scan `file_count` pools for a set of full tx hashes.
///
/// Workers default to hardware concurrency minus one, floored at one.
pub fn scan_hashes(
    file_count: u32,
    source: &dyn PoolSource,
    hashes: &BTreeSet<Vec<u8>>,
    mode: PoolMode,
) -> Result<ScanResult> {
    let worker_count = num_cpus::get().saturating_sub(1).max(1);
    debug!(file_count, needles = hashes.len(), workers = worker_count, "filter scan");

    let next_file = AtomicU32::new(0);
    let results: Mutex<ScanResult> = Mutex::new(ScanResult::new());
    let first_error: Mutex<Option<crate::error::WalletError>> = Mutex::new(None);

    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            scope.spawn(|| {
                let mut local = ScanResult::new();
                loop {
                    let file_id = next_file.fetch_add(1, Ordering::Relaxed);
                    if file_id >= file_count {
                        break;
                    }
                    match scan_one_file(source, file_id, hashes, mode) {
                        Ok(hits) => {
                            local.insert(file_id, hits);
                        }
                        Err(e) => {
                            let mut slot = first_error.lock().unwrap();
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                            break;
                        }
                    }
                }
                results.lock().unwrap().extend(local);
            });
        }
    });

    if let Some(e) = first_error.into_inner().unwrap() {
        return Err(e);
    }
    Ok(results.into_inner().unwrap())
}
