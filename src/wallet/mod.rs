//! The asset-tree wallet: typed entries over the encrypted store, with
//! deterministic derivation, address accounts and an explicit unlock scope
//! guarding private material.

pub mod account;
pub mod asset;
pub mod container;
pub mod derive;
pub mod encryption;
pub mod metadata;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::crypto::hash::{hash160, hash256};
use crate::crypto::secp::check_privkey;
use crate::crypto::{os_random, KdfRomix, SecureBytes};
use crate::encode::base58check_encode;
use crate::error::{Result, WalletError};
use crate::store::header::{
    PREFIX_ADDRESS_ACCOUNT, PREFIX_ASSET, PREFIX_ENCRYPTION_KEY, PREFIX_KDF,
};
use crate::store::{encryption_key_id, Subspace, WalletHeader, WalletInterface};
use crate::wallet::account::{AccountPolicy, AddressAccount, AddressType};
use crate::wallet::asset::{
    AssetEntry, AssetId, AssetPrivateKey, AssetPublicKey, AssetSingle, EncryptedSeed,
};
use crate::wallet::container::{ContainerLock, DecryptedDataContainer, PassphrasePrompt};
use crate::wallet::derive::{compute_chaincode_legacy, derive_chained_privkey, Bip32Node};
use crate::wallet::encryption::{Cipher, CipherData, EncryptionKeyRecord, KdfRecord};

pub const HARDENED: u32 = derive::HARDENED_FLAG;

const DEFAULT_ACCOUNT_ID: [u8; 4] = [0, 0, 0, 0];

/// Wallet id: base58check of the first 5 bytes of hash160 of the neutered
/// root's compressed pubkey.
pub fn compute_wallet_id(root_pubkey_compressed: &[u8]) -> Result<String> {
    let digest = hash160(root_pubkey_compressed);
    base58check_encode(&digest[..5])
}

/// Knobs for wallet creation.
pub struct CreateParams<'a> {
    pub passphrase: &'a [u8],
    pub control_passphrase: &'a [u8],
    /// How many lookahead assets to instantiate per account chain.
    pub lookup: u32,
    /// KDF calibration target; `None` uses the default 0.25 s.
    pub kdf_target_secs: Option<f64>,
}

impl<'a> CreateParams<'a> {
    pub fn new(passphrase: &'a [u8], control_passphrase: &'a [u8]) -> Self {
        CreateParams { passphrase, control_passphrase, lookup: 10, kdf_target_secs: None }
    }
}

pub struct Wallet {
    iface: Arc<WalletInterface>,
    subspace: Arc<Subspace>,
    header: WalletHeader,
    container: DecryptedDataContainer,
    root: AssetEntry,
    encrypted_seed: Option<EncryptedSeed>,
    assets: BTreeMap<AssetId, AssetEntry>,
    accounts: BTreeMap<[u8; 4], AddressAccount>,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet").finish_non_exhaustive()
    }
}

/// Fresh master key whose content-derived id is computable.
fn generate_master_key() -> SecureBytes {
    loop {
        let candidate = os_random(32);
        if check_privkey(&hash256(candidate.as_slice())) {
            return candidate;
        }
    }
}

struct MasterKeyMaterial {
    kdf: KdfRomix,
    master_key: SecureBytes,
    master_key_id: Vec<u8>,
    kdf_record: KdfRecord,
    key_record: EncryptionKeyRecord,
}

/// Calibrate a KDF and wrap a fresh master key under the passphrase.
fn build_master_key(
    passphrase: &[u8],
    kdf_target_secs: Option<f64>,
    iface: &WalletInterface,
) -> Result<MasterKeyMaterial> {
    let kdf = KdfRomix::calibrate(
        kdf_target_secs.unwrap_or(crate::crypto::kdf::KDF_DEFAULT_TARGET_SECS),
        os_random(32).as_slice().to_vec(),
    )?;

    let master_key = generate_master_key();
    let master_key_id = encryption_key_id(master_key.as_slice())?;

    let derived = kdf.derive(passphrase)?;
    let derived_id = encryption_key_id(derived.as_slice())?;
    let wrap_cipher = Cipher::fresh(kdf.id(), derived_id, &iface.prng());
    let wrapped = wrap_cipher.encrypt(derived.as_slice(), master_key.as_slice())?;

    let mut wraps = BTreeMap::new();
    wraps.insert(kdf.id(), CipherData { cipher: wrap_cipher, cipher_text: wrapped });

    Ok(MasterKeyMaterial {
        kdf_record: KdfRecord { kdf: kdf.clone() },
        key_record: EncryptionKeyRecord { id: master_key_id.clone(), wraps },
        kdf,
        master_key,
        master_key_id,
    })
}

impl Wallet {
    /// Create a BIP-32 wallet from seed entropy. The wallet root is the
    /// master node; the default account lives at `m/0'`.
    pub fn create_from_seed_bip32(
        dir: &Path,
        seed: &[u8],
        params: CreateParams<'_>,
        prompt: PassphrasePrompt,
    ) -> Result<Wallet> {
        let master_node = Bip32Node::from_seed(seed)?;
        let wallet_id = compute_wallet_id(master_node.neutered()?.pubkey())?;

        let iface = Arc::new(WalletInterface::create(
            dir,
            params.control_passphrase,
            params.kdf_target_secs,
        )?);
        let material = build_master_key(params.passphrase, params.kdf_target_secs, &iface)?;

        let header = WalletHeader {
            wallet_id: wallet_id.clone(),
            db_name: wallet_id.clone(),
            default_encryption_key_id: material.master_key_id.clone(),
            default_kdf_id: material.kdf.id(),
            master_encryption_key_id: Vec::new(),
            control_salt: Vec::new(),
        };
        let subspace = iface.add_subspace(header)?;
        let header = iface.header(&wallet_id)?;

        let prng = iface.prng();
        let seed_fingerprint = master_node.fingerprint();

        let encrypt_secret = |cleartext: &[u8]| -> Result<CipherData> {
            let cipher =
                Cipher::fresh(material.kdf.id(), material.master_key_id.clone(), &prng);
            let cipher_text = cipher.encrypt(material.master_key.as_slice(), cleartext)?;
            Ok(CipherData { cipher, cipher_text })
        };

        // root asset: the master node itself
        let root = AssetEntry::Bip32Root {
            base: AssetSingle {
                id: AssetId::root(),
                pubkey: AssetPublicKey::from_compressed(master_node.pubkey().to_vec())?,
                privkey: Some(AssetPrivateKey {
                    cipher_data: encrypt_secret(
                        master_node.privkey().expect("fresh seed node has a key").as_slice(),
                    )?,
                }),
            },
            chaincode: master_node.chaincode().to_vec(),
            depth: 0,
            child_num: 0,
            parent_fingerprint: 0,
            seed_fingerprint,
            derivation_path: Vec::new(),
        };

        // seeds are 16..=64 bytes, so the seed blob uses the padded shape
        let encrypted_seed = EncryptedSeed {
            cipher_data: {
                let cipher =
                    Cipher::fresh(material.kdf.id(), material.master_key_id.clone(), &prng);
                let cipher_text =
                    cipher.encrypt_padded(material.master_key.as_slice(), seed)?;
                CipherData { cipher, cipher_text }
            },
        };

        // default account under m/0'
        let account_node = master_node.derive_private(HARDENED)?;
        let account_root = AssetEntry::Bip32Root {
            base: AssetSingle {
                id: AssetId::new(DEFAULT_ACCOUNT_ID, u32::MAX),
                pubkey: AssetPublicKey::from_compressed(account_node.pubkey().to_vec())?,
                privkey: Some(AssetPrivateKey {
                    cipher_data: encrypt_secret(
                        account_node.privkey().expect("private derivation").as_slice(),
                    )?,
                }),
            },
            chaincode: account_node.chaincode().to_vec(),
            depth: 1,
            child_num: HARDENED,
            parent_fingerprint: master_node.fingerprint(),
            seed_fingerprint,
            derivation_path: vec![HARDENED],
        };

        let mut assets = BTreeMap::new();
        let mut account = AddressAccount::new(
            DEFAULT_ACCOUNT_ID,
            AccountPolicy::new([AddressType::P2PKH, AddressType::P2WPKH]),
        );
        for index in 0..params.lookup {
            let child = account_node.derive_private(index)?;
            let entry = AssetEntry::Single(AssetSingle {
                id: AssetId::new(DEFAULT_ACCOUNT_ID, index),
                pubkey: AssetPublicKey::from_compressed(child.pubkey().to_vec())?,
                privkey: Some(AssetPrivateKey {
                    cipher_data: encrypt_secret(
                        child.privkey().expect("private derivation").as_slice(),
                    )?,
                }),
            });
            account.add_asset(&entry)?;
            assets.insert(entry.id().clone(), entry);
        }

        // persist everything in one transaction
        let mut tx = subspace.begin_write()?;
        tx.put(&KdfRecord::data_key(&material.kdf.id()), material.kdf_record.serialize())?;
        tx.put(
            &EncryptionKeyRecord::data_key(&material.key_record.id),
            material.key_record.serialize(),
        )?;
        tx.put(&root.id().data_key(), root.serialize())?;
        tx.put(&EncryptedSeed::data_key(), encrypted_seed.serialize())?;
        tx.put(&account_root.id().data_key(), account_root.serialize())?;
        for entry in assets.values() {
            tx.put(&entry.id().data_key(), entry.serialize())?;
        }
        tx.put(&AddressAccount::data_key(&DEFAULT_ACCOUNT_ID), account.serialize())?;
        tx.commit()?;

        assets.insert(account_root.id().clone(), account_root);

        let mut container = DecryptedDataContainer::new(prompt);
        container.add_kdf(material.kdf.clone());
        container.add_encryption_key(material.key_record.clone());

        let mut accounts = BTreeMap::new();
        accounts.insert(DEFAULT_ACCOUNT_ID, account);

        info!(wallet_id = %wallet_id, "created bip32 wallet");
        Ok(Wallet {
            iface,
            subspace,
            header,
            container,
            root,
            encrypted_seed: Some(encrypted_seed),
            assets,
            accounts,
        })
    }

    /// Create a legacy single-chain wallet from a private root, computing
    /// the deterministic chaincode when none is supplied.
    pub fn create_from_legacy_root(
        dir: &Path,
        private_root: &[u8],
        chaincode: Option<&[u8]>,
        params: CreateParams<'_>,
        prompt: PassphrasePrompt,
    ) -> Result<Wallet> {
        if !check_privkey(private_root) {
            return Err(WalletError::InvalidArgument("invalid legacy root key".into()));
        }
        let chaincode: SecureBytes = match chaincode {
            Some(cc) if cc.len() == 32 => SecureBytes::from_slice(cc),
            Some(_) => {
                return Err(WalletError::InvalidArgument("chaincode must be 32 bytes".into()))
            }
            None => compute_chaincode_legacy(private_root),
        };

        let root_pub =
            crate::crypto::secp::pubkey_from_privkey(private_root, true)?;
        let wallet_id = compute_wallet_id(&root_pub)?;

        let iface = Arc::new(WalletInterface::create(
            dir,
            params.control_passphrase,
            params.kdf_target_secs,
        )?);
        let material = build_master_key(params.passphrase, params.kdf_target_secs, &iface)?;

        let header = WalletHeader {
            wallet_id: wallet_id.clone(),
            db_name: wallet_id.clone(),
            default_encryption_key_id: material.master_key_id.clone(),
            default_kdf_id: material.kdf.id(),
            master_encryption_key_id: Vec::new(),
            control_salt: Vec::new(),
        };
        let subspace = iface.add_subspace(header)?;
        let header = iface.header(&wallet_id)?;

        let prng = iface.prng();
        let encrypt_secret = |cleartext: &[u8]| -> Result<CipherData> {
            let cipher =
                Cipher::fresh(material.kdf.id(), material.master_key_id.clone(), &prng);
            let cipher_text = cipher.encrypt(material.master_key.as_slice(), cleartext)?;
            Ok(CipherData { cipher, cipher_text })
        };

        let root = AssetEntry::LegacyRoot {
            base: AssetSingle {
                id: AssetId::root(),
                pubkey: AssetPublicKey::from_compressed(root_pub)?,
                privkey: Some(AssetPrivateKey { cipher_data: encrypt_secret(private_root)? }),
            },
            chaincode: chaincode.as_slice().to_vec(),
        };

        // legacy chain: each key is chained off the previous one
        let mut assets = BTreeMap::new();
        let mut account = AddressAccount::new(
            DEFAULT_ACCOUNT_ID,
            AccountPolicy::new([AddressType::P2PKH]),
        );
        let mut current = SecureBytes::from_slice(private_root);
        for index in 0..params.lookup {
            current = derive_chained_privkey(current.as_slice(), chaincode.as_slice())?;
            let pubkey =
                crate::crypto::secp::pubkey_from_privkey(current.as_slice(), true)?;
            let entry = AssetEntry::Single(AssetSingle {
                id: AssetId::new(DEFAULT_ACCOUNT_ID, index),
                pubkey: AssetPublicKey::from_compressed(pubkey)?,
                privkey: Some(AssetPrivateKey {
                    cipher_data: encrypt_secret(current.as_slice())?,
                }),
            });
            account.add_asset(&entry)?;
            assets.insert(entry.id().clone(), entry);
        }

        let mut tx = subspace.begin_write()?;
        tx.put(&KdfRecord::data_key(&material.kdf.id()), material.kdf_record.serialize())?;
        tx.put(
            &EncryptionKeyRecord::data_key(&material.key_record.id),
            material.key_record.serialize(),
        )?;
        tx.put(&root.id().data_key(), root.serialize())?;
        for entry in assets.values() {
            tx.put(&entry.id().data_key(), entry.serialize())?;
        }
        tx.put(&AddressAccount::data_key(&DEFAULT_ACCOUNT_ID), account.serialize())?;
        tx.commit()?;

        let mut container = DecryptedDataContainer::new(prompt);
        container.add_kdf(material.kdf.clone());
        container.add_encryption_key(material.key_record.clone());

        let mut accounts = BTreeMap::new();
        accounts.insert(DEFAULT_ACCOUNT_ID, account);

        info!(wallet_id = %wallet_id, "created legacy wallet");
        Ok(Wallet {
            iface,
            subspace,
            header,
            container,
            root,
            encrypted_seed: None,
            assets,
            accounts,
        })
    }

    /// Multisig wallet roots have a reserved on-disk type tag but no
    /// production behaviour yet.
    pub fn create_multisig(_dir: &Path) -> Result<Wallet> {
        Err(WalletError::Unsupported("multisig wallet roots are not defined".into()))
    }

    /// Open the first wallet in a directory.
    pub fn open(dir: &Path, control_passphrase: &[u8], prompt: PassphrasePrompt) -> Result<Wallet> {
        let iface = Arc::new(WalletInterface::open(dir, control_passphrase)?);
        let headers = iface.headers()?;
        let header = headers
            .into_iter()
            .next()
            .ok_or_else(|| WalletError::NotFound("wallet file holds no wallets".into()))?;
        let subspace = iface.open_subspace(&header.db_name)?;

        let mut container = DecryptedDataContainer::new(prompt);
        let mut assets = BTreeMap::new();
        let mut root = None;
        let mut encrypted_seed = None;
        let mut account_records: Vec<Vec<u8>> = Vec::new();

        {
            let read = subspace.begin_read()?;
            for (data_key, value) in read.iter() {
                match data_key.first() {
                    Some(&PREFIX_KDF) => {
                        container.add_kdf(KdfRecord::deserialize(value)?.kdf);
                    }
                    Some(&PREFIX_ENCRYPTION_KEY) => {
                        container.add_encryption_key(EncryptionKeyRecord::deserialize(value)?);
                    }
                    Some(&PREFIX_ASSET) => {
                        let entry = AssetEntry::deserialize(data_key, value)?;
                        if *entry.id() == AssetId::root() {
                            root = Some(entry);
                        } else {
                            assets.insert(entry.id().clone(), entry);
                        }
                    }
                    Some(&crate::store::header::PREFIX_ENCRYPTED_SEED) => {
                        encrypted_seed = Some(EncryptedSeed::deserialize(value)?);
                    }
                    Some(&PREFIX_ADDRESS_ACCOUNT) => {
                        account_records.push(value.as_slice().to_vec());
                    }
                    _ => {}
                }
            }
        }

        let root = root
            .ok_or_else(|| WalletError::NotFound("wallet root asset missing".into()))?;

        let mut accounts = BTreeMap::new();
        for record in account_records {
            let account = AddressAccount::deserialize(&record, &assets)?;
            accounts.insert(account.account_id, account);
        }

        info!(wallet_id = %header.wallet_id, "opened wallet");
        Ok(Wallet { iface, subspace, header, container, root, encrypted_seed, assets, accounts })
    }

    pub fn wallet_id(&self) -> &str {
        &self.header.wallet_id
    }

    pub fn root(&self) -> &AssetEntry {
        &self.root
    }

    pub fn encrypted_seed(&self) -> Option<&EncryptedSeed> {
        self.encrypted_seed.as_ref()
    }

    pub fn asset(&self, id: &AssetId) -> Result<&AssetEntry> {
        self.assets
            .get(id)
            .ok_or_else(|| WalletError::NotFound(format!("asset {id:?}")))
    }

    pub fn account(&self, account_id: &[u8; 4]) -> Result<&AddressAccount> {
        self.accounts
            .get(account_id)
            .ok_or_else(|| WalletError::NotFound(format!("account {account_id:?}")))
    }

    pub fn default_account(&self) -> Result<&AddressAccount> {
        self.account(&DEFAULT_ACCOUNT_ID)
    }

    pub fn container(&self) -> &DecryptedDataContainer {
        &self.container
    }

    /// Enter an unlock scope for private material.
    pub fn unlock(&self) -> ContainerLock<'_> {
        self.container.unlock()
    }

    /// Decrypt the private key of an asset. Must be inside an unlock scope.
    pub fn decrypted_privkey(&self, id: &AssetId) -> Result<SecureBytes> {
        let entry = if *id == AssetId::root() { &self.root } else { self.asset(id)? };
        let single = entry
            .single()
            .ok_or_else(|| WalletError::InvalidArgument("asset carries no single key".into()))?;
        let privkey = single
            .privkey
            .as_ref()
            .ok_or_else(|| WalletError::NotFound("asset has no private key".into()))?;
        self.container.decrypt(&privkey.cipher_data)
    }

    /// Decrypt the wallet seed. Must be inside an unlock scope.
    pub fn decrypted_seed(&self) -> Result<SecureBytes> {
        let seed = self
            .encrypted_seed
            .as_ref()
            .ok_or_else(|| WalletError::NotFound("wallet has no stored seed".into()))?;
        self.container.decrypt_padded(&seed.cipher_data)
    }

    /// Re-wrap the default master key under a new wallet passphrase. The
    /// old wrap is overwritten on disk in the same commit.
    pub fn change_passphrase(&mut self, new_passphrase: &[u8]) -> Result<()> {
        let key_id = self.header.default_encryption_key_id.clone();
        let record =
            self.container.rewrap_master_key(&key_id, new_passphrase, &self.iface.prng())?;

        let mut tx = self.subspace.begin_write()?;
        tx.put(&EncryptionKeyRecord::data_key(&record.id), record.serialize())?;
        tx.commit()?;
        info!(wallet_id = %self.header.wallet_id, "wallet passphrase changed");
        Ok(())
    }

    /// Attach or replace a comment on an arbitrary target (address, txid).
    pub fn set_comment(&self, record: &metadata::CommentData) -> Result<()> {
        let mut tx = self.subspace.begin_write()?;
        let serialized = record.serialize();
        if serialized.is_empty() {
            tx.erase(&record.data_key())?;
        } else {
            tx.put(&record.data_key(), serialized)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn comments(&self) -> Result<Vec<metadata::CommentData>> {
        let read = self.subspace.begin_read()?;
        let mut records = Vec::new();
        for (data_key, value) in read.iter() {
            if data_key.first() == Some(&crate::store::header::PREFIX_META_COMMENT) {
                records.push(metadata::CommentData::deserialize(data_key, value)?);
            }
        }
        Ok(records)
    }

    /// Authorise a peer identity for the transport layer.
    pub fn add_auth_peer(&self, record: &metadata::PeerPublicData) -> Result<()> {
        let mut tx = self.subspace.begin_write()?;
        let serialized = record.serialize();
        if serialized.is_empty() {
            tx.erase(&record.data_key())?;
        } else {
            tx.put(&record.data_key(), serialized)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn auth_peers(&self) -> Result<Vec<metadata::PeerPublicData>> {
        let read = self.subspace.begin_read()?;
        let mut records = Vec::new();
        for (data_key, value) in read.iter() {
            if data_key.first() == Some(&crate::store::header::PREFIX_META_AUTHPEER) {
                records.push(metadata::PeerPublicData::deserialize(data_key, value)?);
            }
        }
        Ok(records)
    }

    /// Identity pubkeys of every authorised peer, for handshake
    /// verification.
    pub fn known_peer_keys(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.auth_peers()?.into_iter().map(|peer| peer.public_key).collect())
    }

    pub fn subspace(&self) -> &Arc<Subspace> {
        &self.subspace
    }

    pub fn interface(&self) -> &Arc<WalletInterface> {
        &self.iface
    }
}
