//! Thin wrappers over secp256k1 used by the wallet, store envelope and
//! transport layers. Signatures are deterministic (RFC 6979) and low-S.

use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Scalar, Secp256k1, SecretKey};

use crate::crypto::hash::sha256;
use crate::crypto::secure::SecureBytes;
use crate::error::{Result, WalletError};

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

pub const PRIVKEY_LEN: usize = 32;
pub const PUBKEY_COMPRESSED_LEN: usize = 33;
pub const PUBKEY_UNCOMPRESSED_LEN: usize = 65;

/// True when the 32 bytes form a valid, non-zero scalar.
pub fn check_privkey(key: &[u8]) -> bool {
    key.len() == PRIVKEY_LEN && SecretKey::from_slice(key).is_ok()
}

/// Draw a fresh private key from the OS entropy source.
pub fn generate_privkey() -> SecureBytes {
    let mut buf = [0u8; PRIVKEY_LEN];
    loop {
        OsRng.fill_bytes(&mut buf);
        if check_privkey(&buf) {
            return SecureBytes::from_slice(&buf);
        }
    }
}

/// Compute the public key for a private scalar.
pub fn pubkey_from_privkey(privkey: &[u8], compressed: bool) -> Result<Vec<u8>> {
    let sk = SecretKey::from_slice(privkey)?;
    let pk = PublicKey::from_secret_key(&SECP, &sk);
    Ok(if compressed {
        pk.serialize().to_vec()
    } else {
        pk.serialize_uncompressed().to_vec()
    })
}

pub fn compress_pubkey(pubkey: &[u8]) -> Result<Vec<u8>> {
    let pk = PublicKey::from_slice(pubkey)?;
    Ok(pk.serialize().to_vec())
}

pub fn uncompress_pubkey(pubkey: &[u8]) -> Result<Vec<u8>> {
    let pk = PublicKey::from_slice(pubkey)?;
    Ok(pk.serialize_uncompressed().to_vec())
}

pub fn check_pubkey(pubkey: &[u8]) -> bool {
    PublicKey::from_slice(pubkey).is_ok()
}

/// ECDH: multiply a peer public key by a local private scalar, returning the
/// resulting point in compressed form. Callers hash the output before using
/// it as key material.
pub fn ecdh_mul(pubkey: &[u8], privkey: &[u8]) -> Result<Vec<u8>> {
    let pk = PublicKey::from_slice(pubkey)?;
    let sk = SecretKey::from_slice(privkey)?;
    let scalar = Scalar::from(sk);
    let shared = pk
        .mul_tweak(&SECP, &scalar)
        .map_err(|e| WalletError::InvalidArgument(format!("ecdh: {e}")))?;
    Ok(shared.serialize().to_vec())
}

/// Multiply a public key by an arbitrary 32-byte scalar.
pub fn pubkey_scalar_multiply(pubkey: &[u8], scalar: &[u8]) -> Result<Vec<u8>> {
    let pk = PublicKey::from_slice(pubkey)?;
    let scalar: [u8; 32] = scalar
        .try_into()
        .map_err(|_| WalletError::InvalidArgument("scalar must be 32 bytes".into()))?;
    let scalar = Scalar::from_be_bytes(scalar)
        .map_err(|_| WalletError::InvalidArgument("scalar out of range".into()))?;
    let out = pk
        .mul_tweak(&SECP, &scalar)
        .map_err(|e| WalletError::InvalidArgument(format!("scalar multiply: {e}")))?;
    Ok(out.serialize().to_vec())
}

/// Multiply a private key by an arbitrary 32-byte scalar, mod n.
pub fn privkey_scalar_multiply(privkey: &[u8], scalar: &[u8]) -> Result<SecureBytes> {
    let sk = SecretKey::from_slice(privkey)?;
    let scalar: [u8; 32] = scalar
        .try_into()
        .map_err(|_| WalletError::InvalidArgument("scalar must be 32 bytes".into()))?;
    let scalar = Scalar::from_be_bytes(scalar)
        .map_err(|_| WalletError::InvalidArgument("scalar out of range".into()))?;
    let out = sk
        .mul_tweak(&scalar)
        .map_err(|e| WalletError::InvalidArgument(format!("scalar multiply: {e}")))?;
    Ok(SecureBytes::from_slice(&out.secret_bytes()))
}

/// Deterministic ECDSA over SHA256 of the message; 64-byte compact, low-S.
pub fn sign_det(msg: &[u8], privkey: &[u8]) -> Result<[u8; 64]> {
    let sk = SecretKey::from_slice(privkey)?;
    let digest = Message::from_slice(&sha256(msg))?;
    let mut sig = SECP.sign_ecdsa(&digest, &sk);
    sig.normalize_s();
    Ok(sig.serialize_compact())
}

/// Verify a 64-byte compact signature produced by [`sign_det`].
pub fn verify(msg: &[u8], sig: &[u8], pubkey: &[u8]) -> bool {
    let Ok(pk) = PublicKey::from_slice(pubkey) else {
        return false;
    };
    let Ok(signature) = Signature::from_compact(sig) else {
        return false;
    };
    let Ok(digest) = Message::from_slice(&sha256(msg)) else {
        return false;
    };
    SECP.verify_ecdsa(&digest, &signature, &pk).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pubkey_compress_roundtrip() {
        let privkey = generate_privkey();
        let full = pubkey_from_privkey(privkey.as_slice(), false).unwrap();
        let comp = pubkey_from_privkey(privkey.as_slice(), true).unwrap();
        assert_eq!(full.len(), PUBKEY_UNCOMPRESSED_LEN);
        assert_eq!(comp.len(), PUBKEY_COMPRESSED_LEN);
        assert_eq!(compress_pubkey(&full).unwrap(), comp);
        assert_eq!(uncompress_pubkey(&comp).unwrap(), full);
    }

    #[test]
    fn ecdh_is_symmetric() {
        let a = generate_privkey();
        let b = generate_privkey();
        let pub_a = pubkey_from_privkey(a.as_slice(), true).unwrap();
        let pub_b = pubkey_from_privkey(b.as_slice(), true).unwrap();

        let ab = ecdh_mul(&pub_b, a.as_slice()).unwrap();
        let ba = ecdh_mul(&pub_a, b.as_slice()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn sign_verify_roundtrip() {
        let privkey = generate_privkey();
        let pubkey = pubkey_from_privkey(privkey.as_slice(), true).unwrap();

        let sig = sign_det(b"challenge bytes", privkey.as_slice()).unwrap();
        assert!(verify(b"challenge bytes", &sig, &pubkey));
        assert!(!verify(b"other bytes", &sig, &pubkey));

        // deterministic: same input, same signature
        let sig2 = sign_det(b"challenge bytes", privkey.as_slice()).unwrap();
        assert_eq!(sig, sig2);
    }

    #[test]
    fn invalid_privkey_rejected() {
        assert!(!check_privkey(&[0u8; 32]));
        assert!(!check_privkey(&[0xFF; 32]));
        assert!(!check_privkey(&[1u8; 31]));
        assert!(check_privkey(&[1u8; 32]));
    }
}
