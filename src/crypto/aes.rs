//! AES-256-CBC, in the two shapes the wallet file needs.
//!
//! Fixed-length secrets (roots, chaincodes, wrapped keys) are encrypted
//! without padding so ciphertext length reveals nothing beyond the already
//! known 32-byte payload size. The store envelope carries variable-length
//! records and uses PKCS#7.

use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;

use crate::error::{Result, WalletError};

pub const AES_BLOCK_SIZE: usize = 16;
pub const AES_KEY_SIZE: usize = 32;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

fn make_enc(key: &[u8], iv: &[u8]) -> Result<Aes256CbcEnc> {
    Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|_| WalletError::InvalidArgument("bad AES key or iv length".into()))
}

fn make_dec(key: &[u8], iv: &[u8]) -> Result<Aes256CbcDec> {
    Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| WalletError::InvalidArgument("bad AES key or iv length".into()))
}

/// Encrypt an exact multiple of the block size. No padding is added.
pub fn aes256_cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if plaintext.is_empty() || plaintext.len() % AES_BLOCK_SIZE != 0 {
        return Err(WalletError::InvalidArgument(
            "plaintext must be a non-empty multiple of 16 bytes".into(),
        ));
    }
    Ok(make_enc(key, iv)?.encrypt_padded_vec_mut::<NoPadding>(plaintext))
}

/// Inverse of [`aes256_cbc_encrypt`].
pub fn aes256_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(WalletError::InvalidArgument(
            "ciphertext must be a non-empty multiple of 16 bytes".into(),
        ));
    }
    make_dec(key, iv)?
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|_| WalletError::IntegrityFailure("AES-CBC decrypt failed".into()))
}

/// PKCS#7-padded encryption for variable-length payloads.
pub fn aes256_cbc_encrypt_padded(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    Ok(make_enc(key, iv)?.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Inverse of [`aes256_cbc_encrypt_padded`]. A bad pad byte is reported as
/// an integrity failure; callers always MAC-check on top of this.
pub fn aes256_cbc_decrypt_padded(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(WalletError::InvalidArgument(
            "ciphertext must be a non-empty multiple of 16 bytes".into(),
        ));
    }
    make_dec(key, iv)?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| WalletError::IntegrityFailure("AES-CBC unpad failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];
    const IV: [u8; 16] = [0x24; 16];

    #[test]
    fn nopad_roundtrip_is_length_preserving() {
        let plaintext = [0xABu8; 32];
        let ciphertext = aes256_cbc_encrypt(&KEY, &IV, &plaintext).unwrap();
        assert_eq!(ciphertext.len(), 32);
        let decrypted = aes256_cbc_decrypt(&KEY, &IV, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn nopad_rejects_partial_blocks() {
        assert!(aes256_cbc_encrypt(&KEY, &IV, &[0u8; 20]).is_err());
        assert!(aes256_cbc_decrypt(&KEY, &IV, &[0u8; 20]).is_err());
    }

    #[test]
    fn padded_roundtrip_any_length() {
        for len in [1usize, 15, 16, 17, 100] {
            let plaintext = vec![0x5Au8; len];
            let ciphertext = aes256_cbc_encrypt_padded(&KEY, &IV, &plaintext).unwrap();
            assert_eq!(ciphertext.len() % AES_BLOCK_SIZE, 0);
            let decrypted = aes256_cbc_decrypt_padded(&KEY, &IV, &ciphertext).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }
}
