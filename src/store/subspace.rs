//! A named, encrypted key space inside the wallet file.
//!
//! On disk a subspace is a run of IES packets filed under consecutive
//! big-endian u32 storage keys. Loading replays the packets in storage-key
//! order, deriving `(decrypt_key, mac_key)` pairs from the subspace root by
//! counter-mode HMAC-SHA512 and advancing the counter at every `cycle`
//! marker, so each session's writes decrypt only under that session's pair.
//! Erased keys leave a gap plus a tombstone recording the gap; a gap with no
//! tombstone fails the load.
//!
//! Live data is served from an immutable in-memory snapshot. Writers queue
//! ops in an overlay transaction and publish a fresh snapshot on commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

use crate::crypto::hash::{hmac256, hmac512};
use crate::crypto::secp::{check_privkey, pubkey_from_privkey};
use crate::crypto::{FortunaPrng, SecureBytes};
use crate::encode::{ByteReader, ByteWriter};
use crate::error::{Result, WalletError};
use crate::store::envelope::{
    create_data_packet, read_data_packet, ERASURE_PLACEHOLDER, KEY_CYCLE_FLAG,
};
use crate::store::raw::{RawOp, RawStore};

/// Immutable view of a subspace's decrypted contents.
#[derive(Default, Clone)]
pub struct DataMap {
    data: BTreeMap<Vec<u8>, Arc<Vec<u8>>>,
    data_key_to_storage_key: BTreeMap<Vec<u8>, u32>,
    storage_key_counter: u32,
}

impl DataMap {
    pub fn get(&self, data_key: &[u8]) -> Option<&Arc<Vec<u8>>> {
        self.data.get(data_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Arc<Vec<u8>>)> {
        self.data.iter()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn storage_key_for(&self, data_key: &[u8]) -> Option<u32> {
        self.data_key_to_storage_key.get(data_key).copied()
    }
}

fn storage_key_bytes(key: u32) -> Vec<u8> {
    key.to_be_bytes().to_vec()
}

struct SessionKeys {
    encrypt_pubkey: Vec<u8>,
    mac_key: SecureBytes,
}

/// Statistics observed during the last load, kept for integrity audits.
#[derive(Debug, Default, Clone)]
pub struct LoadReport {
    pub cycle_markers: u32,
    pub tombstones: Vec<u32>,
    pub live_records: usize,
}

pub struct Subspace {
    name: String,
    control_salt: Vec<u8>,
    encryption_version: u32,
    store: Arc<RawStore>,
    prng: Arc<FortunaPrng>,

    session: RwLock<Option<SessionKeys>>,
    snapshot: RwLock<Arc<DataMap>>,
    write_lock: Mutex<()>,
    poisoned: AtomicBool,
    last_load: RwLock<LoadReport>,
}

impl std::fmt::Debug for Subspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subspace").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Subspace {
    pub fn new(
        name: impl Into<String>,
        control_salt: Vec<u8>,
        encryption_version: u32,
        store: Arc<RawStore>,
        prng: Arc<FortunaPrng>,
    ) -> Self {
        Subspace {
            name: name.into(),
            control_salt,
            encryption_version,
            store,
            prng,
            session: RwLock::new(None),
            snapshot: RwLock::new(Arc::new(DataMap::default())),
            write_lock: Mutex::new(()),
            poisoned: AtomicBool::new(false),
            last_load: RwLock::new(LoadReport::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_count(&self) -> usize {
        self.snapshot.read().len()
    }

    pub fn last_load_report(&self) -> LoadReport {
        self.last_load.read().clone()
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(WalletError::IntegrityFailure(format!(
                "subspace {} is poisoned; reopen the wallet",
                self.name
            )));
        }
        if self.session.read().is_none() {
            return Err(WalletError::Conflict(format!("subspace {} not loaded", self.name)));
        }
        Ok(())
    }

    fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
        warn!(subspace = %self.name, "subspace poisoned after integrity failure");
    }

    /// Derive the key pair for rotation counter `k`.
    fn key_pair_for(salted_root: &[u8], counter: u32) -> Result<(SecureBytes, SecureBytes)> {
        let stretched = hmac512(&counter.to_le_bytes(), salted_root);
        let decrypt_priv = SecureBytes::from_slice(&stretched[..32]);
        let mac_key = SecureBytes::from_slice(&stretched[32..]);
        if !check_privkey(decrypt_priv.as_slice()) {
            return Err(WalletError::IntegrityFailure("invalid derived decryption key".into()));
        }
        Ok((decrypt_priv, mac_key))
    }

    /// Replay the on-disk packets under `root_key`, then open a fresh
    /// session key pair for this session's writes.
    ///
    /// A record overwritten in a later session keeps its original storage
    /// key but carries that later session's encryption, so replay searches
    /// forward (bounded) from the key pair current at the packet's position.
    pub fn load(&self, root_key: &[u8]) -> Result<()> {
        const KEY_SEARCH_AHEAD: u32 = 1024;

        let salted_root = hmac256(&self.control_salt, root_key);

        let mut counter: u32 = 0;
        let (mut decrypt_priv, mut mac_key) = Self::key_pair_for(&salted_root, counter)?;

        let mut map = DataMap::default();
        let mut gaps: BTreeMap<u32, ()> = BTreeMap::new();
        let mut report = LoadReport::default();

        let rows = self.store.read_all(&self.name)?;
        let mut prev_key: i64 = -1;
        for (raw_key, packet) in &rows {
            if raw_key.len() != 4 {
                self.poison();
                return Err(WalletError::IntegrityFailure("invalid storage key length".into()));
            }
            let storage_key = u32::from_be_bytes(raw_key.as_slice().try_into().unwrap());
            if storage_key >= 0x1000_0000 {
                self.poison();
                return Err(WalletError::IntegrityFailure("storage key out of range".into()));
            }

            // consecutive keys expected; mark the holes
            for missing in (prev_key + 1)..storage_key as i64 {
                gaps.insert(missing as u32, ());
            }
            prev_key = storage_key as i64;

            let mut opened = read_data_packet(
                raw_key,
                packet,
                decrypt_priv.as_slice(),
                mac_key.as_slice(),
                self.encryption_version,
            );
            if opened.is_err() {
                for ahead in 1..=KEY_SEARCH_AHEAD {
                    let Ok(pair) = Self::key_pair_for(&salted_root, counter + ahead) else {
                        continue;
                    };
                    if let Ok(found) = read_data_packet(
                        raw_key,
                        packet,
                        pair.0.as_slice(),
                        pair.1.as_slice(),
                        self.encryption_version,
                    ) {
                        opened = Ok(found);
                        break;
                    }
                }
            }
            let (data_key, value) = match opened {
                Ok(pair) => pair,
                Err(e) => {
                    self.poison();
                    return Err(e);
                }
            };

            if data_key.is_empty() {
                // meta packet: tombstone or cycle marker
                if value.as_slice() == KEY_CYCLE_FLAG {
                    counter += 1;
                    report.cycle_markers += 1;
                    let pair = Self::key_pair_for(&salted_root, counter)?;
                    decrypt_priv = pair.0;
                    mac_key = pair.1;
                    continue;
                }
                if let Some(erased) = parse_tombstone(value.as_slice()) {
                    if gaps.remove(&erased).is_none() {
                        self.poison();
                        return Err(WalletError::IntegrityFailure(
                            "tombstone for a storage key that is not a gap".into(),
                        ));
                    }
                    report.tombstones.push(erased);
                    continue;
                }
                self.poison();
                return Err(WalletError::IntegrityFailure("meta packet not recognized".into()));
            }

            if map.data_key_to_storage_key.insert(data_key.clone(), storage_key).is_some() {
                self.poison();
                return Err(WalletError::IntegrityFailure("duplicated data key".into()));
            }
            map.data.insert(data_key, Arc::new(value.as_slice().to_vec()));
        }

        if !gaps.is_empty() {
            self.poison();
            return Err(WalletError::IntegrityFailure(format!(
                "{} unfilled storage key gaps",
                gaps.len()
            )));
        }

        map.storage_key_counter = (prev_key + 1) as u32;
        report.live_records = map.data.len();

        // Append this session's cycle marker under the current pair, then
        // advance so everything written from here on uses the next pair.
        let flag_key = map.storage_key_counter;
        map.storage_key_counter += 1;
        let current_pub = pubkey_from_privkey(decrypt_priv.as_slice(), true)?;
        let flag_packet = create_data_packet(
            &storage_key_bytes(flag_key),
            &[],
            KEY_CYCLE_FLAG,
            &current_pub,
            mac_key.as_slice(),
            self.encryption_version,
            &self.prng,
        )?;
        self.store.put(&self.name, &storage_key_bytes(flag_key), &flag_packet)?;

        counter += 1;
        let (session_priv, session_mac) = Self::key_pair_for(&salted_root, counter)?;
        let session_pub = pubkey_from_privkey(session_priv.as_slice(), true)?;

        *self.session.write() =
            Some(SessionKeys { encrypt_pubkey: session_pub, mac_key: session_mac });
        *self.snapshot.write() = Arc::new(map);
        *self.last_load.write() = report;
        self.poisoned.store(false, Ordering::Release);

        debug!(subspace = %self.name, records = self.entry_count(), "subspace loaded");
        Ok(())
    }

    /// Read-only view of the current snapshot.
    pub fn begin_read(&self) -> Result<ReadTransaction> {
        self.check_usable()?;
        Ok(ReadTransaction { snapshot: self.snapshot.read().clone() })
    }

    /// Exclusive write transaction. Blocks other writers across threads;
    /// readers keep the pre-commit snapshot.
    pub fn begin_write(&self) -> Result<WriteTransaction<'_>> {
        self.check_usable()?;
        let guard = self.write_lock.lock();
        let base = self.snapshot.read().clone();
        Ok(WriteTransaction {
            subspace: self,
            _guard: guard,
            base,
            ops: Vec::new(),
            key_to_op: HashMap::new(),
        })
    }
}

fn parse_tombstone(value: &[u8]) -> Option<u32> {
    if value.len() <= ERASURE_PLACEHOLDER.len()
        || &value[..ERASURE_PLACEHOLDER.len()] != ERASURE_PLACEHOLDER
    {
        return None;
    }
    let mut reader = ByteReader::new(&value[ERASURE_PLACEHOLDER.len()..]);
    let len = reader.get_var_int().ok()?;
    if len != 4 {
        return None;
    }
    let erased = reader.get_u32_be().ok()?;
    reader.is_exhausted().then_some(erased)
}

fn tombstone_value(erased_storage_key: u32) -> Vec<u8> {
    let mut writer = ByteWriter::with_capacity(ERASURE_PLACEHOLDER.len() + 5);
    writer.put_bytes(ERASURE_PLACEHOLDER);
    writer.put_var_int(4);
    writer.put_u32_be(erased_storage_key);
    writer.into_vec()
}

pub struct ReadTransaction {
    snapshot: Arc<DataMap>,
}

impl ReadTransaction {
    pub fn get(&self, data_key: &[u8]) -> Option<Arc<Vec<u8>>> {
        self.snapshot.get(data_key).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Arc<Vec<u8>>)> {
        self.snapshot.iter()
    }

    pub fn len(&self) -> usize {
        self.snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }
}

enum PendingOp {
    Put { data_key: Vec<u8>, value: Arc<Vec<u8>> },
    Erase { data_key: Vec<u8> },
}

/// Overlay write transaction: mutations are queued in order and applied to
/// a fresh snapshot on commit. Dropping the transaction rolls it back.
///
/// The handle borrows the subspace and holds its write mutex, so it cannot
/// outlive the store or cross threads.
pub struct WriteTransaction<'a> {
    subspace: &'a Subspace,
    _guard: MutexGuard<'a, ()>,
    base: Arc<DataMap>,
    ops: Vec<PendingOp>,
    key_to_op: HashMap<Vec<u8>, usize>,
}

impl<'a> WriteTransaction<'a> {
    pub fn put(&mut self, data_key: &[u8], value: Vec<u8>) -> Result<()> {
        if data_key.is_empty() {
            return Err(WalletError::InvalidArgument("empty data key".into()));
        }
        let op = PendingOp::Put { data_key: data_key.to_vec(), value: Arc::new(value) };
        self.push_op(data_key, op);
        Ok(())
    }

    pub fn erase(&mut self, data_key: &[u8]) -> Result<()> {
        if data_key.is_empty() {
            return Err(WalletError::InvalidArgument("empty data key".into()));
        }
        let op = PendingOp::Erase { data_key: data_key.to_vec() };
        self.push_op(data_key, op);
        Ok(())
    }

    fn push_op(&mut self, data_key: &[u8], op: PendingOp) {
        self.ops.push(op);
        self.key_to_op.insert(data_key.to_vec(), self.ops.len() - 1);
    }

    /// Pending ops first, then the begin-time snapshot.
    pub fn get(&self, data_key: &[u8]) -> Option<Arc<Vec<u8>>> {
        if let Some(&idx) = self.key_to_op.get(data_key) {
            return match &self.ops[idx] {
                PendingOp::Put { value, .. } => Some(value.clone()),
                PendingOp::Erase { .. } => None,
            };
        }
        self.base.get(data_key).cloned()
    }

    /// Consistent merged view: snapshot at begin time plus pending ops.
    pub fn iter_merged(&self) -> BTreeMap<Vec<u8>, Arc<Vec<u8>>> {
        let mut merged: BTreeMap<Vec<u8>, Arc<Vec<u8>>> =
            self.base.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for op in &self.ops {
            match op {
                PendingOp::Put { data_key, value } => {
                    merged.insert(data_key.clone(), value.clone());
                }
                PendingOp::Erase { data_key } => {
                    merged.remove(data_key);
                }
            }
        }
        merged
    }

    /// Apply pending ops: encrypt packets, push them to the B-tree in one
    /// atomic batch, then publish the new snapshot.
    pub fn commit(self) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }

        let session = self.subspace.session.read();
        let session = session
            .as_ref()
            .ok_or_else(|| WalletError::Conflict("subspace not loaded".into()))?;

        let mut map = (*self.base).clone();
        let mut raw_ops: Vec<RawOp> = Vec::with_capacity(self.ops.len());

        for op in &self.ops {
            match op {
                PendingOp::Put { data_key, value } => {
                    // rewriting a known data key reuses its storage key
                    let storage_key = match map.data_key_to_storage_key.get(data_key) {
                        Some(&existing) => existing,
                        None => {
                            let fresh = map.storage_key_counter;
                            map.storage_key_counter += 1;
                            map.data_key_to_storage_key.insert(data_key.clone(), fresh);
                            fresh
                        }
                    };
                    let packet = create_data_packet(
                        &storage_key_bytes(storage_key),
                        data_key,
                        value,
                        &session.encrypt_pubkey,
                        session.mac_key.as_slice(),
                        self.subspace.encryption_version,
                        &self.subspace.prng,
                    )?;
                    raw_ops.push((storage_key_bytes(storage_key), Some(packet)));
                    map.data.insert(data_key.clone(), value.clone());
                }
                PendingOp::Erase { data_key } => {
                    let Some(old_key) = map.data_key_to_storage_key.remove(data_key) else {
                        continue; // erasing an absent key is a no-op
                    };
                    map.data.remove(data_key);
                    raw_ops.push((storage_key_bytes(old_key), None));

                    // tombstone under a fresh key records the gap
                    let fresh = map.storage_key_counter;
                    map.storage_key_counter += 1;
                    let packet = create_data_packet(
                        &storage_key_bytes(fresh),
                        &[],
                        &tombstone_value(old_key),
                        &session.encrypt_pubkey,
                        session.mac_key.as_slice(),
                        self.subspace.encryption_version,
                        &self.subspace.prng,
                    )?;
                    raw_ops.push((storage_key_bytes(fresh), Some(packet)));
                }
            }
        }

        self.subspace.store.apply(&self.subspace.name, &raw_ops)?;
        *self.subspace.snapshot.write() = Arc::new(map);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_subspace(dir: &TempDir) -> Subspace {
        let store = Arc::new(RawStore::open(dir.path()).unwrap());
        let prng = Arc::new(FortunaPrng::new());
        Subspace::new("test_db", vec![0x11; 32], 1, store, prng)
    }

    const ROOT: [u8; 32] = [0x99; 32];

    #[test]
    fn write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let subspace = open_subspace(&dir);
        subspace.load(&ROOT).unwrap();

        let mut tx = subspace.begin_write().unwrap();
        tx.put(b"key-a", b"value-a".to_vec()).unwrap();
        tx.put(b"key-b", b"value-b".to_vec()).unwrap();
        tx.commit().unwrap();

        let read = subspace.begin_read().unwrap();
        assert_eq!(read.get(b"key-a").unwrap().as_slice(), b"value-a");
        assert_eq!(read.len(), 2);
    }

    #[test]
    fn storage_key_reuse_on_overwrite() {
        let dir = TempDir::new().unwrap();
        let subspace = open_subspace(&dir);
        subspace.load(&ROOT).unwrap();

        let mut tx = subspace.begin_write().unwrap();
        tx.put(b"key", b"one".to_vec()).unwrap();
        tx.commit().unwrap();
        let first = subspace.snapshot.read().storage_key_for(b"key").unwrap();

        let mut tx = subspace.begin_write().unwrap();
        tx.put(b"key", b"two".to_vec()).unwrap();
        tx.commit().unwrap();
        let second = subspace.snapshot.read().storage_key_for(b"key").unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn erase_then_write_assigns_fresh_key() {
        let dir = TempDir::new().unwrap();
        let subspace = open_subspace(&dir);
        subspace.load(&ROOT).unwrap();

        let mut tx = subspace.begin_write().unwrap();
        tx.put(b"key", b"one".to_vec()).unwrap();
        tx.commit().unwrap();
        let first = subspace.snapshot.read().storage_key_for(b"key").unwrap();

        let mut tx = subspace.begin_write().unwrap();
        tx.erase(b"key").unwrap();
        tx.commit().unwrap();

        let mut tx = subspace.begin_write().unwrap();
        tx.put(b"key", b"two".to_vec()).unwrap();
        tx.commit().unwrap();
        let second = subspace.snapshot.read().storage_key_for(b"key").unwrap();

        assert!(second > first);
    }

    #[test]
    fn rollback_leaves_snapshot_untouched() {
        let dir = TempDir::new().unwrap();
        let subspace = open_subspace(&dir);
        subspace.load(&ROOT).unwrap();

        let mut tx = subspace.begin_write().unwrap();
        tx.put(b"key", b"value".to_vec()).unwrap();
        drop(tx); // rollback

        assert!(subspace.begin_read().unwrap().is_empty());
    }

    #[test]
    fn pending_ops_shadow_snapshot() {
        let dir = TempDir::new().unwrap();
        let subspace = open_subspace(&dir);
        subspace.load(&ROOT).unwrap();

        let mut tx = subspace.begin_write().unwrap();
        tx.put(b"key", b"committed".to_vec()).unwrap();
        tx.commit().unwrap();

        let mut tx = subspace.begin_write().unwrap();
        tx.put(b"key", b"pending".to_vec()).unwrap();
        assert_eq!(tx.get(b"key").unwrap().as_slice(), b"pending");
        tx.erase(b"key").unwrap();
        assert!(tx.get(b"key").is_none());
        assert!(tx.iter_merged().is_empty());
        drop(tx);

        assert_eq!(
            subspace.begin_read().unwrap().get(b"key").unwrap().as_slice(),
            b"committed"
        );
    }

    #[test]
    fn reload_replays_and_cycles() {
        let dir = TempDir::new().unwrap();
        {
            let subspace = open_subspace(&dir);
            subspace.load(&ROOT).unwrap();
            let mut tx = subspace.begin_write().unwrap();
            for i in 0..10u8 {
                tx.put(&[b'k', i], vec![b'v', i]).unwrap();
            }
            tx.commit().unwrap();
        }

        let subspace = open_subspace(&dir);
        subspace.load(&ROOT).unwrap();
        let report = subspace.last_load_report();
        assert_eq!(report.cycle_markers, 1);
        assert_eq!(report.live_records, 10);
        assert!(report.tombstones.is_empty());
    }

    #[test]
    fn wrong_root_key_fails_load() {
        let dir = TempDir::new().unwrap();
        {
            let subspace = open_subspace(&dir);
            subspace.load(&ROOT).unwrap();
            let mut tx = subspace.begin_write().unwrap();
            tx.put(b"key", b"value".to_vec()).unwrap();
            tx.commit().unwrap();
        }

        let subspace = open_subspace(&dir);
        let err = subspace.load(&[0x55; 32]).unwrap_err();
        assert!(matches!(err, WalletError::IntegrityFailure(_)));
        assert!(subspace.begin_read().is_err());
    }
}
