//! Typed asset entries: every keyed cryptographic object a wallet stores.
//!
//! On-disk shape per entry: `varint(total_len) ‖ version(u32) ‖ type(u8) ‖
//! body`. Key material inside an entry is carried as length-prefixed
//! sub-records with their own version and marker byte, so compressed and
//! uncompressed public keys can coexist and encrypted private keys travel
//! with their cipher descriptor.

use crate::crypto::secp::{compress_pubkey, uncompress_pubkey};
use crate::encode::{ByteReader, ByteWriter};
use crate::error::{Result, WalletError};
use crate::store::header::{PREFIX_ASSET, PREFIX_ENCRYPTED_SEED};
use crate::wallet::encryption::CipherData;

pub const ASSET_VERSION: u32 = 1;
pub const BIP32_ROOT_VERSION: u32 = 2;

const PUBKEY_UNCOMPRESSED_BYTE: u8 = 0x80;
const PUBKEY_COMPRESSED_BYTE: u8 = 0x81;
const PRIVKEY_BYTE: u8 = 0x82;
const WALLET_SEED_BYTE: u8 = 0x84;

const PUBKEY_SUBRECORD_VERSION: u32 = 1;
const PRIVKEY_SUBRECORD_VERSION: u32 = 1;
const SEED_RECORD_VERSION: u32 = 1;

const TYPE_SINGLE: u8 = 0x01;
const TYPE_MULTISIG: u8 = 0x02;
const TYPE_BIP32_ROOT: u8 = 0x03;
const TYPE_LEGACY_ROOT: u8 = 0x04;

/// Ordered asset identifier: big-endian `(account_id ‖ index)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetId {
    pub account_id: [u8; 4],
    pub index: u32,
}

impl AssetId {
    pub const ROOT_ACCOUNT: [u8; 4] = [0xFF; 4];

    pub fn new(account_id: [u8; 4], index: u32) -> Self {
        AssetId { account_id, index }
    }

    /// The wallet-scoped root asset.
    pub fn root() -> Self {
        AssetId { account_id: Self::ROOT_ACCOUNT, index: u32::MAX }
    }

    /// Subspace data key: `0x04 ‖ account_id ‖ index_be`.
    pub fn data_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(9);
        key.push(PREFIX_ASSET);
        key.extend_from_slice(&self.account_id);
        key.extend_from_slice(&self.index.to_be_bytes());
        key
    }

    pub fn from_data_key(key: &[u8]) -> Result<Self> {
        if key.len() != 9 || key[0] != PREFIX_ASSET {
            return Err(WalletError::InvalidArgument("invalid asset data key".into()));
        }
        Ok(AssetId {
            account_id: key[1..5].try_into().unwrap(),
            index: u32::from_be_bytes(key[5..9].try_into().unwrap()),
        })
    }
}

/// Public key in one or both encodings. When both are present they must
/// name the same point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPublicKey {
    uncompressed: Option<Vec<u8>>,
    compressed: Option<Vec<u8>>,
}

impl AssetPublicKey {
    pub fn new(uncompressed: Option<Vec<u8>>, compressed: Option<Vec<u8>>) -> Result<Self> {
        match (&uncompressed, &compressed) {
            (None, None) => {
                return Err(WalletError::InvalidArgument("empty public key".into()));
            }
            (Some(full), Some(short)) => {
                if &compress_pubkey(full)? != short {
                    return Err(WalletError::InvalidArgument(
                        "compressed and uncompressed keys disagree".into(),
                    ));
                }
            }
            _ => {}
        }
        if let Some(full) = &uncompressed {
            if full.len() != 65 {
                return Err(WalletError::InvalidArgument("uncompressed key must be 65 bytes".into()));
            }
        }
        if let Some(short) = &compressed {
            if short.len() != 33 {
                return Err(WalletError::InvalidArgument("compressed key must be 33 bytes".into()));
            }
        }
        Ok(AssetPublicKey { uncompressed, compressed })
    }

    pub fn from_compressed(compressed: Vec<u8>) -> Result<Self> {
        AssetPublicKey::new(None, Some(compressed))
    }

    /// Compressed form, deriving it if only the uncompressed form is stored.
    pub fn compressed(&self) -> Result<Vec<u8>> {
        match (&self.compressed, &self.uncompressed) {
            (Some(short), _) => Ok(short.clone()),
            (None, Some(full)) => compress_pubkey(full),
            (None, None) => unreachable!("constructor enforces at least one form"),
        }
    }

    pub fn uncompressed(&self) -> Result<Vec<u8>> {
        match (&self.uncompressed, &self.compressed) {
            (Some(full), _) => Ok(full.clone()),
            (None, Some(short)) => uncompress_pubkey(short),
            (None, None) => unreachable!("constructor enforces at least one form"),
        }
    }

    fn serialize(&self, writer: &mut ByteWriter) {
        if let Some(full) = &self.uncompressed {
            writer.put_var_int(full.len() as u64 + 5);
            writer.put_u32_le(PUBKEY_SUBRECORD_VERSION);
            writer.put_u8(PUBKEY_UNCOMPRESSED_BYTE);
            writer.put_bytes(full);
        }
        if let Some(short) = &self.compressed {
            writer.put_var_int(short.len() as u64 + 5);
            writer.put_u32_le(PUBKEY_SUBRECORD_VERSION);
            writer.put_u8(PUBKEY_COMPRESSED_BYTE);
            writer.put_bytes(short);
        }
    }
}

/// Encrypted private key plus the cipher descriptor naming its KDF and
/// encryption key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPrivateKey {
    pub cipher_data: CipherData,
}

impl AssetPrivateKey {
    pub fn encryption_key_id(&self) -> &[u8] {
        &self.cipher_data.cipher.encryption_key_id
    }

    pub fn kdf_id(&self) -> &[u8] {
        &self.cipher_data.cipher.kdf_id
    }

    fn serialize(&self, writer: &mut ByteWriter) {
        let mut body = ByteWriter::new();
        body.put_u32_le(PRIVKEY_SUBRECORD_VERSION);
        body.put_u8(PRIVKEY_BYTE);
        body.put_var_bytes(&self.cipher_data.serialize());
        writer.put_var_bytes(body.as_slice());
    }
}

/// Key data shared by every concrete entry shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetSingle {
    pub id: AssetId,
    pub pubkey: AssetPublicKey,
    pub privkey: Option<AssetPrivateKey>,
}

/// Tagged asset entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetEntry {
    Single(AssetSingle),
    Bip32Root {
        base: AssetSingle,
        chaincode: Vec<u8>,
        depth: u8,
        child_num: u32,
        parent_fingerprint: u32,
        seed_fingerprint: u32,
        derivation_path: Vec<u32>,
    },
    LegacyRoot {
        base: AssetSingle,
        chaincode: Vec<u8>,
    },
    Multisig {
        id: AssetId,
        m: u8,
        n: u8,
        members: Vec<AssetSingle>,
    },
}

impl AssetEntry {
    pub fn id(&self) -> &AssetId {
        match self {
            AssetEntry::Single(single) => &single.id,
            AssetEntry::Bip32Root { base, .. } => &base.id,
            AssetEntry::LegacyRoot { base, .. } => &base.id,
            AssetEntry::Multisig { id, .. } => id,
        }
    }

    pub fn single(&self) -> Option<&AssetSingle> {
        match self {
            AssetEntry::Single(single) => Some(single),
            AssetEntry::Bip32Root { base, .. } => Some(base),
            AssetEntry::LegacyRoot { base, .. } => Some(base),
            AssetEntry::Multisig { .. } => None,
        }
    }

    fn type_byte(&self) -> u8 {
        match self {
            AssetEntry::Single(_) => TYPE_SINGLE,
            AssetEntry::Multisig { .. } => TYPE_MULTISIG,
            AssetEntry::Bip32Root { .. } => TYPE_BIP32_ROOT,
            AssetEntry::LegacyRoot { .. } => TYPE_LEGACY_ROOT,
        }
    }

    fn check_multisig(m: u8, n: u8, members: &[AssetSingle]) -> Result<()> {
        if n as usize != members.len() || m == 0 || m > n || n > 16 {
            return Err(WalletError::InvalidArgument(format!("invalid multisig policy {m}-of-{n}")));
        }
        let mut kdf_id: Option<&[u8]> = None;
        for member in members {
            if let Some(privkey) = &member.privkey {
                match kdf_id {
                    None => kdf_id = Some(privkey.kdf_id()),
                    Some(existing) if existing != privkey.kdf_id() => {
                        return Err(WalletError::InvalidArgument(
                            "multisig members must share one kdf".into(),
                        ));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut body = ByteWriter::new();
        match self {
            AssetEntry::Single(single) => {
                body.put_u32_le(ASSET_VERSION);
                body.put_u8(self.type_byte());
                single.pubkey.serialize(&mut body);
                if let Some(privkey) = &single.privkey {
                    privkey.serialize(&mut body);
                }
            }
            AssetEntry::Bip32Root {
                base,
                chaincode,
                depth,
                child_num,
                parent_fingerprint,
                seed_fingerprint,
                derivation_path,
            } => {
                body.put_u32_le(BIP32_ROOT_VERSION);
                body.put_u8(self.type_byte());
                body.put_u8(*depth);
                body.put_u32_le(*child_num);
                body.put_u32_le(*parent_fingerprint);
                body.put_var_bytes(chaincode);
                body.put_u32_le(*seed_fingerprint);
                body.put_var_int(derivation_path.len() as u64);
                for step in derivation_path {
                    body.put_u32_le(*step);
                }
                base.pubkey.serialize(&mut body);
                if let Some(privkey) = &base.privkey {
                    privkey.serialize(&mut body);
                }
            }
            AssetEntry::LegacyRoot { base, chaincode } => {
                body.put_u32_le(ASSET_VERSION);
                body.put_u8(self.type_byte());
                body.put_var_bytes(chaincode);
                base.pubkey.serialize(&mut body);
                if let Some(privkey) = &base.privkey {
                    privkey.serialize(&mut body);
                }
            }
            AssetEntry::Multisig { m, n, members, .. } => {
                body.put_u32_le(ASSET_VERSION);
                body.put_u8(self.type_byte());
                body.put_u8(*m);
                body.put_u8(*n);
                for member in members {
                    let mut member_body = ByteWriter::new();
                    member_body.put_u32_le(ASSET_VERSION);
                    member_body.put_bytes(&member.id.account_id);
                    member_body.put_u32_le(member.id.index);
                    member.pubkey.serialize(&mut member_body);
                    if let Some(privkey) = &member.privkey {
                        privkey.serialize(&mut member_body);
                    }
                    body.put_var_bytes(member_body.as_slice());
                }
            }
        }

        let mut framed = ByteWriter::with_capacity(body.len() + 5);
        framed.put_var_bytes(body.as_slice());
        framed.into_vec()
    }

    /// Parse the key sub-records trailing an entry body.
    fn read_key_data(
        reader: &mut ByteReader<'_>,
    ) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>, Option<AssetPrivateKey>)> {
        let mut uncompressed = None;
        let mut compressed = None;
        let mut privkey = None;

        while !reader.is_exhausted() {
            let record = reader.get_var_bytes()?;
            let total_len = record.len();
            let mut sub = ByteReader::new(record);
            let version = sub.get_u32_le()?;
            let marker = sub.get_u8()?;
            match marker {
                PUBKEY_UNCOMPRESSED_BYTE => {
                    if version != PUBKEY_SUBRECORD_VERSION {
                        return Err(WalletError::Unsupported(format!("pubkey version {version}")));
                    }
                    if total_len != 70 {
                        return Err(WalletError::InvalidArgument(
                            "bad uncompressed pubkey record size".into(),
                        ));
                    }
                    if uncompressed.replace(sub.rest().to_vec()).is_some() {
                        return Err(WalletError::InvalidArgument(
                            "multiple uncompressed pubkeys".into(),
                        ));
                    }
                }
                PUBKEY_COMPRESSED_BYTE => {
                    if version != PUBKEY_SUBRECORD_VERSION {
                        return Err(WalletError::Unsupported(format!("pubkey version {version}")));
                    }
                    if total_len != 38 {
                        return Err(WalletError::InvalidArgument(
                            "bad compressed pubkey record size".into(),
                        ));
                    }
                    if compressed.replace(sub.rest().to_vec()).is_some() {
                        return Err(WalletError::InvalidArgument(
                            "multiple compressed pubkeys".into(),
                        ));
                    }
                }
                PRIVKEY_BYTE => {
                    if version != PRIVKEY_SUBRECORD_VERSION {
                        return Err(WalletError::Unsupported(format!("privkey version {version}")));
                    }
                    let cipher_data = CipherData::deserialize(sub.get_var_bytes()?)?;
                    if privkey.replace(AssetPrivateKey { cipher_data }).is_some() {
                        return Err(WalletError::InvalidArgument("multiple private keys".into()));
                    }
                }
                other => {
                    return Err(WalletError::Unsupported(format!("key record marker {other:#x}")));
                }
            }
        }

        Ok((uncompressed, compressed, privkey))
    }

    pub fn deserialize(data_key: &[u8], value: &[u8]) -> Result<AssetEntry> {
        let id = AssetId::from_data_key(data_key)?;

        let mut outer = ByteReader::new(value);
        let body = outer.get_var_bytes()?;
        if !outer.is_exhausted() {
            return Err(WalletError::InvalidArgument("trailing bytes after asset entry".into()));
        }

        let mut reader = ByteReader::new(body);
        let version = reader.get_u32_le()?;
        let entry_type = reader.get_u8()? & 0x0F;

        match entry_type {
            TYPE_SINGLE => {
                if version != ASSET_VERSION {
                    return Err(WalletError::Unsupported(format!("asset version {version}")));
                }
                let (uncompressed, compressed, privkey) = Self::read_key_data(&mut reader)?;
                Ok(AssetEntry::Single(AssetSingle {
                    id,
                    pubkey: AssetPublicKey::new(uncompressed, compressed)?,
                    privkey,
                }))
            }
            TYPE_BIP32_ROOT => {
                if version != 1 && version != BIP32_ROOT_VERSION {
                    return Err(WalletError::Unsupported(format!("bip32 root version {version}")));
                }
                let depth = reader.get_u8()?;
                let child_num = reader.get_u32_le()?;
                let parent_fingerprint = reader.get_u32_le()?;
                let chaincode = reader.get_var_bytes()?.to_vec();

                let mut seed_fingerprint = u32::MAX;
                let mut derivation_path = Vec::new();
                if version >= 2 {
                    seed_fingerprint = reader.get_u32_le()?;
                    let count = reader.get_var_int()?;
                    for _ in 0..count {
                        derivation_path.push(reader.get_u32_le()?);
                    }
                }

                // invariant when the entry is anchored to a seed
                if seed_fingerprint != 0
                    && seed_fingerprint != u32::MAX
                    && depth as usize != derivation_path.len()
                {
                    return Err(WalletError::InvalidArgument(
                        "bip32 root depth disagrees with derivation path".into(),
                    ));
                }

                let (uncompressed, compressed, privkey) = Self::read_key_data(&mut reader)?;
                Ok(AssetEntry::Bip32Root {
                    base: AssetSingle {
                        id,
                        pubkey: AssetPublicKey::new(uncompressed, compressed)?,
                        privkey,
                    },
                    chaincode,
                    depth,
                    child_num,
                    parent_fingerprint,
                    seed_fingerprint,
                    derivation_path,
                })
            }
            TYPE_LEGACY_ROOT => {
                if version != ASSET_VERSION {
                    return Err(WalletError::Unsupported(format!("legacy root version {version}")));
                }
                let chaincode = reader.get_var_bytes()?.to_vec();
                let (uncompressed, compressed, privkey) = Self::read_key_data(&mut reader)?;
                Ok(AssetEntry::LegacyRoot {
                    base: AssetSingle {
                        id,
                        pubkey: AssetPublicKey::new(uncompressed, compressed)?,
                        privkey,
                    },
                    chaincode,
                })
            }
            TYPE_MULTISIG => {
                if version != ASSET_VERSION {
                    return Err(WalletError::Unsupported(format!("multisig version {version}")));
                }
                let m = reader.get_u8()?;
                let n = reader.get_u8()?;
                let mut members = Vec::with_capacity(n as usize);
                while !reader.is_exhausted() {
                    let record = reader.get_var_bytes()?;
                    let mut sub = ByteReader::new(record);
                    let member_version = sub.get_u32_le()?;
                    if member_version != ASSET_VERSION {
                        return Err(WalletError::Unsupported(format!(
                            "multisig member version {member_version}"
                        )));
                    }
                    let account_id: [u8; 4] = sub.get_bytes(4)?.try_into().unwrap();
                    let index = sub.get_u32_le()?;
                    let (uncompressed, compressed, privkey) = Self::read_key_data(&mut sub)?;
                    members.push(AssetSingle {
                        id: AssetId::new(account_id, index),
                        pubkey: AssetPublicKey::new(uncompressed, compressed)?,
                        privkey,
                    });
                }
                Self::check_multisig(m, n, &members)?;
                Ok(AssetEntry::Multisig { id, m, n, members })
            }
            other => Err(WalletError::InvalidArgument(format!("unknown asset type {other:#x}"))),
        }
    }
}

/// Wallet-scoped encrypted seed blob; carries no asset id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedSeed {
    pub cipher_data: CipherData,
}

impl EncryptedSeed {
    pub fn data_key() -> Vec<u8> {
        vec![PREFIX_ENCRYPTED_SEED]
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut body = ByteWriter::new();
        body.put_u32_le(SEED_RECORD_VERSION);
        body.put_u8(WALLET_SEED_BYTE);
        body.put_var_bytes(&self.cipher_data.serialize());

        let mut framed = ByteWriter::new();
        framed.put_var_bytes(body.as_slice());
        framed.into_vec()
    }

    pub fn deserialize(value: &[u8]) -> Result<Self> {
        let mut outer = ByteReader::new(value);
        let body = outer.get_var_bytes()?;
        let mut reader = ByteReader::new(body);
        let version = reader.get_u32_le()?;
        if version != SEED_RECORD_VERSION {
            return Err(WalletError::Unsupported(format!("seed record version {version}")));
        }
        let marker = reader.get_u8()?;
        if marker != WALLET_SEED_BYTE {
            return Err(WalletError::InvalidArgument("not a seed record".into()));
        }
        Ok(EncryptedSeed { cipher_data: CipherData::deserialize(reader.get_var_bytes()?)? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::secp::{generate_privkey, pubkey_from_privkey};
    use crate::wallet::encryption::Cipher;

    fn sample_privkey() -> AssetPrivateKey {
        AssetPrivateKey {
            cipher_data: CipherData {
                cipher: Cipher {
                    kdf_id: vec![1; 16],
                    encryption_key_id: vec![2; 16],
                    iv: vec![3; 16],
                },
                cipher_text: vec![4; 32],
            },
        }
    }

    fn sample_single(index: u32) -> AssetSingle {
        let privkey = generate_privkey();
        let compressed = pubkey_from_privkey(privkey.as_slice(), true).unwrap();
        AssetSingle {
            id: AssetId::new([0, 0, 0, 1], index),
            pubkey: AssetPublicKey::from_compressed(compressed).unwrap(),
            privkey: Some(sample_privkey()),
        }
    }

    #[test]
    fn single_roundtrip() {
        let entry = AssetEntry::Single(sample_single(7));
        let decoded =
            AssetEntry::deserialize(&entry.id().data_key(), &entry.serialize()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn single_roundtrip_both_pubkey_forms() {
        let privkey = generate_privkey();
        let full = pubkey_from_privkey(privkey.as_slice(), false).unwrap();
        let short = pubkey_from_privkey(privkey.as_slice(), true).unwrap();
        let entry = AssetEntry::Single(AssetSingle {
            id: AssetId::new([0, 0, 0, 2], 0),
            pubkey: AssetPublicKey::new(Some(full), Some(short)).unwrap(),
            privkey: None,
        });
        let decoded =
            AssetEntry::deserialize(&entry.id().data_key(), &entry.serialize()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn mismatched_pubkey_forms_rejected() {
        let a = generate_privkey();
        let b = generate_privkey();
        let full = pubkey_from_privkey(a.as_slice(), false).unwrap();
        let short = pubkey_from_privkey(b.as_slice(), true).unwrap();
        assert!(AssetPublicKey::new(Some(full), Some(short)).is_err());
    }

    #[test]
    fn bip32_root_roundtrip() {
        let entry = AssetEntry::Bip32Root {
            base: sample_single(u32::MAX),
            chaincode: vec![0xCC; 32],
            depth: 2,
            child_num: 0x8000_0000,
            parent_fingerprint: 0xDEAD_BEEF,
            seed_fingerprint: 0x1234_5678,
            derivation_path: vec![0x8000_002C, 0x8000_0000],
        };
        let decoded =
            AssetEntry::deserialize(&entry.id().data_key(), &entry.serialize()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn bip32_root_depth_path_invariant() {
        let entry = AssetEntry::Bip32Root {
            base: sample_single(u32::MAX),
            chaincode: vec![0xCC; 32],
            depth: 3,
            child_num: 0,
            parent_fingerprint: 0,
            seed_fingerprint: 0x1234_5678,
            derivation_path: vec![0x8000_0000],
        };
        let err =
            AssetEntry::deserialize(&entry.id().data_key(), &entry.serialize()).unwrap_err();
        assert!(matches!(err, WalletError::InvalidArgument(_)));
    }

    #[test]
    fn legacy_root_roundtrip() {
        let entry = AssetEntry::LegacyRoot {
            base: sample_single(u32::MAX),
            chaincode: vec![0xAB; 32],
        };
        let decoded =
            AssetEntry::deserialize(&entry.id().data_key(), &entry.serialize()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn multisig_roundtrip_and_policy() {
        let members = vec![sample_single(0), sample_single(1), sample_single(2)];
        let entry = AssetEntry::Multisig {
            id: AssetId::new([0, 0, 0, 9], 0),
            m: 2,
            n: 3,
            members,
        };
        let decoded =
            AssetEntry::deserialize(&entry.id().data_key(), &entry.serialize()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn multisig_bad_policy_rejected() {
        let members = vec![sample_single(0), sample_single(1)];
        let entry = AssetEntry::Multisig {
            id: AssetId::new([0, 0, 0, 9], 0),
            m: 3,
            n: 2,
            members,
        };
        assert!(AssetEntry::deserialize(&entry.id().data_key(), &entry.serialize()).is_err());
    }

    #[test]
    fn seed_roundtrip() {
        let seed = EncryptedSeed {
            cipher_data: CipherData {
                cipher: Cipher {
                    kdf_id: vec![1; 16],
                    encryption_key_id: vec![2; 16],
                    iv: vec![3; 16],
                },
                cipher_text: vec![9; 32],
            },
        };
        assert_eq!(EncryptedSeed::deserialize(&seed.serialize()).unwrap(), seed);
    }

    #[test]
    fn unknown_version_rejected() {
        let entry = AssetEntry::Single(sample_single(0));
        let mut bytes = entry.serialize();
        // version sits right after the varint length prefix
        bytes[1] = 0x7F;
        assert!(matches!(
            AssetEntry::deserialize(&entry.id().data_key(), &bytes).unwrap_err(),
            WalletError::Unsupported(_)
        ));
    }
}
