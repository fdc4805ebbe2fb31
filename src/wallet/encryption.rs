//! On-disk shapes of everything encryption-related inside a wallet
//! subspace: cipher descriptors, wrapped key material and KDF parameters.

use std::collections::BTreeMap;

use crate::crypto::aes::{aes256_cbc_decrypt, aes256_cbc_encrypt, AES_BLOCK_SIZE};
use crate::crypto::{FortunaPrng, KdfRomix, SecureBytes};
use crate::encode::{ByteReader, ByteWriter};
use crate::error::{Result, WalletError};
use crate::store::header::{PREFIX_ENCRYPTION_KEY, PREFIX_KDF};

pub const CIPHER_VERSION: u32 = 1;
pub const CIPHER_DATA_VERSION: u32 = 1;
pub const ENCRYPTION_KEY_VERSION: u32 = 1;
pub const KDF_RECORD_VERSION: u32 = 1;

const CIPHER_TYPE_AES_CBC: u8 = 0x01;
const KDF_TYPE_ROMIX: u8 = 0x01;

/// Descriptor naming how a blob was encrypted: which KDF, which key, which IV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cipher {
    pub kdf_id: Vec<u8>,
    pub encryption_key_id: Vec<u8>,
    pub iv: Vec<u8>,
}

impl Cipher {
    pub fn fresh(kdf_id: Vec<u8>, encryption_key_id: Vec<u8>, prng: &FortunaPrng) -> Self {
        Cipher { kdf_id, encryption_key_id, iv: prng.random_bytes(AES_BLOCK_SIZE).as_slice().to_vec() }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_u32_le(CIPHER_VERSION);
        writer.put_u8(CIPHER_TYPE_AES_CBC);
        writer.put_var_bytes(&self.kdf_id);
        writer.put_var_bytes(&self.encryption_key_id);
        writer.put_var_bytes(&self.iv);
        writer.into_vec()
    }

    pub fn deserialize(reader: &mut ByteReader<'_>) -> Result<Self> {
        let version = reader.get_u32_le()?;
        if version != CIPHER_VERSION {
            return Err(WalletError::Unsupported(format!("cipher version {version}")));
        }
        let cipher_type = reader.get_u8()?;
        if cipher_type != CIPHER_TYPE_AES_CBC {
            return Err(WalletError::Unsupported(format!("cipher type {cipher_type:#x}")));
        }
        Ok(Cipher {
            kdf_id: reader.get_var_bytes()?.to_vec(),
            encryption_key_id: reader.get_var_bytes()?.to_vec(),
            iv: reader.get_var_bytes()?.to_vec(),
        })
    }

    /// Encrypt an exact-multiple-of-16 secret under `key` with this IV.
    pub fn encrypt(&self, key: &[u8], cleartext: &[u8]) -> Result<Vec<u8>> {
        aes256_cbc_encrypt(key, &self.iv, cleartext)
    }

    pub fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<SecureBytes> {
        Ok(SecureBytes::new(aes256_cbc_decrypt(key, &self.iv, ciphertext)?))
    }

    /// Padded variant for secrets of arbitrary length (wallet seeds).
    pub fn encrypt_padded(&self, key: &[u8], cleartext: &[u8]) -> Result<Vec<u8>> {
        crate::crypto::aes::aes256_cbc_encrypt_padded(key, &self.iv, cleartext)
    }

    pub fn decrypt_padded(&self, key: &[u8], ciphertext: &[u8]) -> Result<SecureBytes> {
        Ok(SecureBytes::new(crate::crypto::aes::aes256_cbc_decrypt_padded(
            key, &self.iv, ciphertext,
        )?))
    }
}

/// `{cipher, ciphertext}`: one wrapped secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherData {
    pub cipher: Cipher,
    pub cipher_text: Vec<u8>,
}

impl CipherData {
    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_u32_le(CIPHER_DATA_VERSION);
        writer.put_var_bytes(&self.cipher_text);
        writer.put_var_bytes(&self.cipher.serialize());
        writer.into_vec()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let version = reader.get_u32_le()?;
        if version != CIPHER_DATA_VERSION {
            return Err(WalletError::Unsupported(format!("cipher data version {version}")));
        }
        let cipher_text = reader.get_var_bytes()?.to_vec();
        let cipher_bytes = reader.get_var_bytes()?;
        let mut cipher_reader = ByteReader::new(cipher_bytes);
        let cipher = Cipher::deserialize(&mut cipher_reader)?;
        Ok(CipherData { cipher, cipher_text })
    }
}

/// A physical encryption key wrapped under one or more KDFs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionKeyRecord {
    pub id: Vec<u8>,
    /// kdf id → wrap of this key under that KDF's derived key
    pub wraps: BTreeMap<Vec<u8>, CipherData>,
}

impl EncryptionKeyRecord {
    pub fn data_key(id: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + id.len());
        key.push(PREFIX_ENCRYPTION_KEY);
        key.extend_from_slice(id);
        key
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut body = ByteWriter::new();
        body.put_u32_le(ENCRYPTION_KEY_VERSION);
        body.put_var_bytes(&self.id);
        body.put_var_int(self.wraps.len() as u64);
        for (kdf_id, cipher_data) in &self.wraps {
            body.put_var_bytes(kdf_id);
            body.put_var_bytes(&cipher_data.serialize());
        }

        let mut framed = ByteWriter::new();
        framed.put_var_bytes(body.as_slice());
        framed.into_vec()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut outer = ByteReader::new(data);
        let body = outer.get_var_bytes()?;
        let mut reader = ByteReader::new(body);

        let version = reader.get_u32_le()?;
        if version != ENCRYPTION_KEY_VERSION {
            return Err(WalletError::Unsupported(format!("encryption key version {version}")));
        }
        let id = reader.get_var_bytes()?.to_vec();
        let count = reader.get_var_int()?;
        let mut wraps = BTreeMap::new();
        for _ in 0..count {
            let kdf_id = reader.get_var_bytes()?.to_vec();
            let cipher_data = CipherData::deserialize(reader.get_var_bytes()?)?;
            wraps.insert(kdf_id, cipher_data);
        }
        Ok(EncryptionKeyRecord { id, wraps })
    }
}

/// On-disk KDF parameter record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfRecord {
    pub kdf: KdfRomix,
}

impl KdfRecord {
    pub fn data_key(id: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + id.len());
        key.push(PREFIX_KDF);
        key.extend_from_slice(id);
        key
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_u32_le(KDF_RECORD_VERSION);
        writer.put_u8(KDF_TYPE_ROMIX);
        writer.put_u32_le(self.kdf.memory_bytes());
        writer.put_u32_le(self.kdf.iterations());
        writer.put_var_bytes(self.kdf.salt());
        writer.into_vec()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let version = reader.get_u32_le()?;
        if version != KDF_RECORD_VERSION {
            return Err(WalletError::Unsupported(format!("kdf record version {version}")));
        }
        let kdf_type = reader.get_u8()?;
        if kdf_type != KDF_TYPE_ROMIX {
            return Err(WalletError::Unsupported(format!("kdf type {kdf_type:#x}")));
        }
        let memory = reader.get_u32_le()?;
        let iterations = reader.get_u32_le()?;
        let salt = reader.get_var_bytes()?.to_vec();
        Ok(KdfRecord { kdf: KdfRomix::new(memory, iterations, salt)? })
    }
}
