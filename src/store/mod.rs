//! Encrypted wallet store: a memory-mapped B-tree of named subspaces whose
//! records all pass through the IES envelope.
//!
//! The distinguished `control_db` subspace carries the headers and wrapped
//! master root keys of every other subspace. The control subspace's own
//! root key is wrapped under a passphrase-derived key in a small plaintext
//! header table; verifying that wrap is the first (and cheapest) passphrase
//! check on open.

pub mod envelope;
pub mod header;
pub mod raw;
pub mod subspace;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::crypto::aes::{aes256_cbc_decrypt, aes256_cbc_encrypt, AES_BLOCK_SIZE};
use crate::crypto::hash::{compute_data_id, hash256};
use crate::crypto::kdf::KDF_DEFAULT_TARGET_SECS;
use crate::crypto::secp::{check_privkey, pubkey_from_privkey};
use crate::crypto::{os_random, FortunaPrng, KdfRomix, SecureBytes};
use crate::encode::{ByteReader, ByteWriter};
use crate::error::{Result, WalletError};
pub use crate::store::header::{WalletHeader, CONTROL_DB_NAME};
use crate::store::header::PREFIX_ENCRYPTION_KEY;
pub use crate::store::raw::RawStore;
pub use crate::store::subspace::{ReadTransaction, Subspace, WriteTransaction};

const CONTROL_TABLE: &str = "__control";
const CONTROL_HEADER_KEY: &[u8] = b"header";
const CONTROL_HEADER_VERSION: u32 = 1;

const HMAC_KEY_ENCRYPTIONKEYS: &str = "encryptionkeys";

/// Id committing to secret key material without revealing it: the key is
/// hashed into a scalar, lifted to a curve point, and the point is HMAC'd.
pub fn encryption_key_id(key: &[u8]) -> Result<Vec<u8>> {
    let scalar = hash256(key);
    if !check_privkey(&scalar) {
        return Err(WalletError::InvalidArgument("key hashes to invalid scalar".into()));
    }
    let point = pubkey_from_privkey(&scalar, false)?;
    Ok(compute_data_id(&point, HMAC_KEY_ENCRYPTIONKEYS))
}

/// Draw a root key whose id computation is guaranteed to succeed.
fn generate_root_key() -> SecureBytes {
    loop {
        let candidate = os_random(32);
        if check_privkey(&hash256(candidate.as_slice())) {
            return candidate;
        }
    }
}

struct ControlHeader {
    control_salt: Vec<u8>,
    kdf: KdfRomix,
    wrap_iv: Vec<u8>,
    wrapped_root: Vec<u8>,
    root_id: Vec<u8>,
}

impl ControlHeader {
    fn serialize(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_u32_le(CONTROL_HEADER_VERSION);
        writer.put_var_bytes(&self.control_salt);
        writer.put_u32_le(self.kdf.memory_bytes());
        writer.put_u32_le(self.kdf.iterations());
        writer.put_var_bytes(self.kdf.salt());
        writer.put_var_bytes(&self.wrap_iv);
        writer.put_var_bytes(&self.wrapped_root);
        writer.put_var_bytes(&self.root_id);
        writer.into_vec()
    }

    fn deserialize(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let version = reader.get_u32_le()?;
        if version != CONTROL_HEADER_VERSION {
            return Err(WalletError::Unsupported(format!("control header version {version}")));
        }
        let control_salt = reader.get_var_bytes()?.to_vec();
        let memory = reader.get_u32_le()?;
        let iterations = reader.get_u32_le()?;
        let salt = reader.get_var_bytes()?.to_vec();
        Ok(ControlHeader {
            control_salt,
            kdf: KdfRomix::new(memory, iterations, salt)?,
            wrap_iv: reader.get_var_bytes()?.to_vec(),
            wrapped_root: reader.get_var_bytes()?.to_vec(),
            root_id: reader.get_var_bytes()?.to_vec(),
        })
    }
}

/// Handle over one wallet directory: the raw B-tree plus every loaded
/// subspace.
pub struct WalletInterface {
    store: Arc<RawStore>,
    prng: Arc<FortunaPrng>,
    control: Arc<Subspace>,
    subspaces: RwLock<HashMap<String, Arc<Subspace>>>,
}

impl std::fmt::Debug for WalletInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletInterface").finish_non_exhaustive()
    }
}

impl WalletInterface {
    /// Create a new wallet file and its control subspace.
    pub fn create(
        dir: &Path,
        control_passphrase: &[u8],
        kdf_target_secs: Option<f64>,
    ) -> Result<Self> {
        let store = Arc::new(RawStore::open(dir)?);
        if store.get(CONTROL_TABLE, CONTROL_HEADER_KEY)?.is_some() {
            return Err(WalletError::Conflict(format!(
                "wallet already exists at {}",
                dir.display()
            )));
        }

        let prng = Arc::new(FortunaPrng::new());
        let kdf = KdfRomix::calibrate(
            kdf_target_secs.unwrap_or(KDF_DEFAULT_TARGET_SECS),
            os_random(32).as_slice().to_vec(),
        )?;

        let root = generate_root_key();
        let root_id = encryption_key_id(root.as_slice())?;

        let derived = kdf.derive(control_passphrase)?;
        let wrap_iv = prng.random_bytes(AES_BLOCK_SIZE);
        let wrapped_root =
            aes256_cbc_encrypt(derived.as_slice(), wrap_iv.as_slice(), root.as_slice())?;

        let header = ControlHeader {
            control_salt: os_random(32).as_slice().to_vec(),
            kdf,
            wrap_iv: wrap_iv.as_slice().to_vec(),
            wrapped_root,
            root_id,
        };
        store.put(CONTROL_TABLE, CONTROL_HEADER_KEY, &header.serialize())?;

        let control = Arc::new(Subspace::new(
            CONTROL_DB_NAME,
            header.control_salt.clone(),
            envelope::ENCRYPTION_VERSION,
            store.clone(),
            prng.clone(),
        ));
        control.load(root.as_slice())?;

        info!(dir = %dir.display(), "created wallet store");
        Ok(WalletInterface { store, prng, control, subspaces: RwLock::new(HashMap::new()) })
    }

    /// Open an existing wallet file. The passphrase check happens against
    /// the control header wrap before any subspace is touched.
    pub fn open(dir: &Path, control_passphrase: &[u8]) -> Result<Self> {
        let store = Arc::new(RawStore::open(dir)?);
        let header_bytes = store
            .get(CONTROL_TABLE, CONTROL_HEADER_KEY)?
            .ok_or_else(|| WalletError::NotFound(format!("no wallet at {}", dir.display())))?;
        let header = ControlHeader::deserialize(&header_bytes)?;

        let derived = header.kdf.derive(control_passphrase)?;
        let root_candidate = aes256_cbc_decrypt(
            derived.as_slice(),
            &header.wrap_iv,
            &header.wrapped_root,
        )
        .map_err(|_| WalletError::PermissionDenied("control passphrase rejected".into()))?;
        let root = SecureBytes::new(root_candidate);

        let candidate_id = encryption_key_id(root.as_slice())
            .map_err(|_| WalletError::PermissionDenied("control passphrase rejected".into()))?;
        if candidate_id != header.root_id {
            return Err(WalletError::PermissionDenied("control passphrase rejected".into()));
        }

        let prng = Arc::new(FortunaPrng::new());
        let control = Arc::new(Subspace::new(
            CONTROL_DB_NAME,
            header.control_salt.clone(),
            envelope::ENCRYPTION_VERSION,
            store.clone(),
            prng.clone(),
        ));
        control.load(root.as_slice())?;

        debug!(dir = %dir.display(), "opened wallet store");
        Ok(WalletInterface { store, prng, control, subspaces: RwLock::new(HashMap::new()) })
    }

    pub fn prng(&self) -> Arc<FortunaPrng> {
        self.prng.clone()
    }

    pub fn control(&self) -> Arc<Subspace> {
        self.control.clone()
    }

    fn root_key_data_key(master_encryption_key_id: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + master_encryption_key_id.len());
        key.push(PREFIX_ENCRYPTION_KEY);
        key.extend_from_slice(master_encryption_key_id);
        key
    }

    /// Register a new subspace: generate its root key, file header and
    /// wrapped root in the control subspace, and load it.
    pub fn add_subspace(&self, mut header: WalletHeader) -> Result<Arc<Subspace>> {
        {
            let read = self.control.begin_read()?;
            if read.get(&WalletHeader::data_key(&header.db_name)).is_some() {
                return Err(WalletError::Conflict(format!(
                    "subspace {} already exists",
                    header.db_name
                )));
            }
        }

        let root = generate_root_key();
        header.master_encryption_key_id = encryption_key_id(root.as_slice())?;
        if header.control_salt.is_empty() {
            header.control_salt = os_random(32).as_slice().to_vec();
        }

        let mut tx = self.control.begin_write()?;
        tx.put(&WalletHeader::data_key(&header.db_name), header.serialize())?;
        tx.put(
            &Self::root_key_data_key(&header.master_encryption_key_id),
            root.as_slice().to_vec(),
        )?;
        tx.commit()?;

        let subspace = Arc::new(Subspace::new(
            header.db_name.clone(),
            header.control_salt.clone(),
            envelope::ENCRYPTION_VERSION,
            self.store.clone(),
            self.prng.clone(),
        ));
        subspace.load(root.as_slice())?;

        self.subspaces.write().insert(header.db_name.clone(), subspace.clone());
        Ok(subspace)
    }

    pub fn header(&self, db_name: &str) -> Result<WalletHeader> {
        let read = self.control.begin_read()?;
        let bytes = read
            .get(&WalletHeader::data_key(db_name))
            .ok_or_else(|| WalletError::NotFound(format!("no header for {db_name}")))?;
        WalletHeader::deserialize(&bytes)
    }

    pub fn headers(&self) -> Result<Vec<WalletHeader>> {
        let read = self.control.begin_read()?;
        let mut headers = Vec::new();
        for (key, value) in read.iter() {
            if key.first() == Some(&header::PREFIX_WALLET_HEADER) {
                headers.push(WalletHeader::deserialize(value)?);
            }
        }
        Ok(headers)
    }

    /// Load a subspace registered in the control subspace.
    pub fn open_subspace(&self, db_name: &str) -> Result<Arc<Subspace>> {
        if let Some(existing) = self.subspaces.read().get(db_name) {
            return Ok(existing.clone());
        }

        let header = self.header(db_name)?;
        let root = {
            let read = self.control.begin_read()?;
            read.get(&Self::root_key_data_key(&header.master_encryption_key_id))
                .ok_or_else(|| {
                    WalletError::IntegrityFailure(format!(
                        "master key missing for subspace {db_name}"
                    ))
                })?
        };

        let subspace = Arc::new(Subspace::new(
            header.db_name.clone(),
            header.control_salt.clone(),
            envelope::ENCRYPTION_VERSION,
            self.store.clone(),
            self.prng.clone(),
        ));
        subspace.load(&root)?;

        self.subspaces.write().insert(db_name.to_string(), subspace.clone());
        Ok(subspace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_header(name: &str) -> WalletHeader {
        WalletHeader {
            wallet_id: format!("id-{name}"),
            db_name: name.to_string(),
            default_encryption_key_id: Vec::new(),
            default_kdf_id: Vec::new(),
            master_encryption_key_id: Vec::new(),
            control_salt: Vec::new(),
        }
    }

    #[test]
    fn create_open_cycle() {
        let dir = TempDir::new().unwrap();
        {
            let iface = WalletInterface::create(dir.path(), b"hunter2", Some(0.01)).unwrap();
            let subspace = iface.add_subspace(new_header("main")).unwrap();
            let mut tx = subspace.begin_write().unwrap();
            tx.put(b"\x04asset", b"payload".to_vec()).unwrap();
            tx.commit().unwrap();
        }

        let iface = WalletInterface::open(dir.path(), b"hunter2").unwrap();
        let subspace = iface.open_subspace("main").unwrap();
        let read = subspace.begin_read().unwrap();
        assert_eq!(read.get(b"\x04asset").unwrap().as_slice(), b"payload");
    }

    #[test]
    fn wrong_passphrase_is_permission_denied() {
        let dir = TempDir::new().unwrap();
        drop(WalletInterface::create(dir.path(), b"hunter2", Some(0.01)).unwrap());

        let err = WalletInterface::open(dir.path(), b"hunter3").unwrap_err();
        assert!(matches!(err, WalletError::PermissionDenied(_)));
    }

    #[test]
    fn duplicate_subspace_conflicts() {
        let dir = TempDir::new().unwrap();
        let iface = WalletInterface::create(dir.path(), b"pw", Some(0.01)).unwrap();
        iface.add_subspace(new_header("main")).unwrap();
        let err = iface.add_subspace(new_header("main")).unwrap_err();
        assert!(matches!(err, WalletError::Conflict(_)));
    }

    #[test]
    fn open_missing_wallet_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = WalletInterface::open(dir.path(), b"pw").unwrap_err();
        assert!(matches!(err, WalletError::NotFound(_)));
    }
}
