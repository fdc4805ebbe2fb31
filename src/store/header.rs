//! Wallet-file record key prefixes and the per-subspace wallet header.

use crate::encode::{ByteReader, ByteWriter};
use crate::error::{Result, WalletError};

pub const PREFIX_WALLET_HEADER: u8 = 0x01;
pub const PREFIX_KDF: u8 = 0x02;
pub const PREFIX_ENCRYPTION_KEY: u8 = 0x03;
pub const PREFIX_ASSET: u8 = 0x04;
pub const PREFIX_ADDRESS_ACCOUNT: u8 = 0x05;
pub const PREFIX_META_COMMENT: u8 = 0x06;
pub const PREFIX_META_AUTHPEER: u8 = 0x07;
pub const PREFIX_META_PEER_ROOT: u8 = 0x08;
pub const PREFIX_META_ROOT_SIG: u8 = 0x09;
pub const PREFIX_ENCRYPTED_SEED: u8 = 0x0A;

/// Name of the subspace holding the wrapped master keys of all others.
pub const CONTROL_DB_NAME: &str = "control_db";

const WALLET_HEADER_VERSION: u32 = 1;

/// Descriptor of one named subspace, stored in the control subspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletHeader {
    pub wallet_id: String,
    pub db_name: String,
    pub default_encryption_key_id: Vec<u8>,
    pub default_kdf_id: Vec<u8>,
    pub master_encryption_key_id: Vec<u8>,
    pub control_salt: Vec<u8>,
}

impl WalletHeader {
    /// Control-subspace data key for this header.
    pub fn data_key(db_name: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + db_name.len());
        key.push(PREFIX_WALLET_HEADER);
        key.extend_from_slice(db_name.as_bytes());
        key
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_u32_le(WALLET_HEADER_VERSION);
        writer.put_var_bytes(self.wallet_id.as_bytes());
        writer.put_var_bytes(self.db_name.as_bytes());
        writer.put_var_bytes(&self.default_encryption_key_id);
        writer.put_var_bytes(&self.default_kdf_id);
        writer.put_var_bytes(&self.master_encryption_key_id);
        writer.put_var_bytes(&self.control_salt);
        writer.into_vec()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let version = reader.get_u32_le()?;
        if version != WALLET_HEADER_VERSION {
            return Err(WalletError::Unsupported(format!("wallet header version {version}")));
        }

        let wallet_id = String::from_utf8(reader.get_var_bytes()?.to_vec())
            .map_err(|_| WalletError::InvalidArgument("wallet id is not utf-8".into()))?;
        let db_name = String::from_utf8(reader.get_var_bytes()?.to_vec())
            .map_err(|_| WalletError::InvalidArgument("db name is not utf-8".into()))?;
        let header = WalletHeader {
            wallet_id,
            db_name,
            default_encryption_key_id: reader.get_var_bytes()?.to_vec(),
            default_kdf_id: reader.get_var_bytes()?.to_vec(),
            master_encryption_key_id: reader.get_var_bytes()?.to_vec(),
            control_salt: reader.get_var_bytes()?.to_vec(),
        };
        if !reader.is_exhausted() {
            return Err(WalletError::InvalidArgument("trailing bytes in wallet header".into()));
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> WalletHeader {
        WalletHeader {
            wallet_id: "2tWavfBc".into(),
            db_name: "wallet_main".into(),
            default_encryption_key_id: vec![1; 16],
            default_kdf_id: vec![2; 16],
            master_encryption_key_id: vec![3; 16],
            control_salt: vec![4; 32],
        }
    }

    #[test]
    fn serialization_roundtrip() {
        let original = header();
        let decoded = WalletHeader::deserialize(&original.serialize()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn unknown_version_rejected() {
        let mut bytes = header().serialize();
        bytes[0] = 9;
        assert!(matches!(
            WalletHeader::deserialize(&bytes).unwrap_err(),
            WalletError::Unsupported(_)
        ));
    }

    #[test]
    fn data_key_is_prefixed() {
        let key = WalletHeader::data_key("wallet_main");
        assert_eq!(key[0], PREFIX_WALLET_HEADER);
        assert_eq!(&key[1..], b"wallet_main");
    }
}
