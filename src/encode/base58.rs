//! Base58 and base58check. The check variant appends the first 4 bytes of
//! SHA256(SHA256(payload)) before encoding.

use crate::error::{Result, WalletError};

pub fn base58_encode(payload: &[u8]) -> String {
    bs58::encode(payload).into_string()
}

pub fn base58_decode(encoded: &str) -> Result<Vec<u8>> {
    if encoded.is_empty() {
        return Err(WalletError::InvalidArgument("empty base58 string".into()));
    }
    bs58::decode(encoded)
        .into_vec()
        .map_err(|e| WalletError::InvalidArgument(format!("base58 decode: {e}")))
}

pub fn base58check_encode(payload: &[u8]) -> Result<String> {
    if payload.is_empty() {
        return Err(WalletError::InvalidArgument("empty base58check payload".into()));
    }
    Ok(bs58::encode(payload).with_check().into_string())
}

pub fn base58check_decode(encoded: &str) -> Result<Vec<u8>> {
    if encoded.is_empty() {
        return Err(WalletError::InvalidArgument("empty base58check string".into()));
    }
    bs58::decode(encoded).with_check(None).into_vec().map_err(|e| match e {
        bs58::decode::Error::InvalidChecksum { .. } => {
            WalletError::IntegrityFailure("base58 checksum mismatch".into())
        }
        other => WalletError::InvalidArgument(format!("base58check decode: {other}")),
    })
}
