//! The IES envelope every subspace record goes through before touching the
//! B-tree: an HMAC over `payload ‖ storage_key`, then AES-256-CBC under a
//! key agreed between a fresh ephemeral keypair and the subspace session
//! key.
//!
//! Packet layout: `ephemeral_pub(33) ‖ iv(16) ‖ ciphertext`.

use self::subtle_eq::ct_eq;

use crate::crypto::aes::{aes256_cbc_decrypt_padded, aes256_cbc_encrypt_padded, AES_BLOCK_SIZE};
use crate::crypto::hash::{hash256, hmac256};
use crate::crypto::secp::{ecdh_mul, generate_privkey, pubkey_from_privkey, PUBKEY_COMPRESSED_LEN};
use crate::crypto::{FortunaPrng, SecureBytes};
use crate::encode::{ByteReader, ByteWriter};
use crate::error::{Result, WalletError};

pub const ENCRYPTION_VERSION: u32 = 1;

const HMAC_LEN: usize = 32;

/// Tombstone marker recorded when a storage key is erased.
pub const ERASURE_PLACEHOLDER: &[u8] = b"erased";
/// Session boundary marker; the loader advances its key counter on sight.
pub const KEY_CYCLE_FLAG: &[u8] = b"cycle";

mod subtle_eq {
    /// Constant-time equality for MAC comparison.
    pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
        if a.len() != b.len() {
            return false;
        }
        let mut diff = 0u8;
        for (x, y) in a.iter().zip(b.iter()) {
            diff |= x ^ y;
        }
        diff == 0
    }
}

fn payload_bytes(data_key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut writer = ByteWriter::with_capacity(data_key.len() + value.len() + 8);
    writer.put_var_bytes(data_key);
    writer.put_var_bytes(value);
    writer.into_vec()
}

/// Seal `(data_key, value)` for storage under `storage_key`.
pub fn create_data_packet(
    storage_key: &[u8],
    data_key: &[u8],
    value: &[u8],
    subspace_pubkey: &[u8],
    mac_key: &[u8],
    version: u32,
    prng: &FortunaPrng,
) -> Result<Vec<u8>> {
    if version != ENCRYPTION_VERSION {
        return Err(WalletError::Unsupported(format!("encryption version {version}")));
    }

    let payload = payload_bytes(data_key, value);

    let mut mac_input = payload.clone();
    mac_input.extend_from_slice(storage_key);
    let mac = hmac256(mac_key, &mac_input);

    let mut cleartext = Vec::with_capacity(HMAC_LEN + payload.len());
    cleartext.extend_from_slice(&mac);
    cleartext.extend_from_slice(&payload);

    let ephemeral_priv = generate_privkey();
    let ephemeral_pub = pubkey_from_privkey(ephemeral_priv.as_slice(), true)?;
    let shared = ecdh_mul(subspace_pubkey, ephemeral_priv.as_slice())?;
    let enc_key = SecureBytes::from_slice(&hash256(&shared));

    let iv = prng.random_bytes(AES_BLOCK_SIZE);
    let ciphertext = aes256_cbc_encrypt_padded(enc_key.as_slice(), iv.as_slice(), &cleartext)?;

    let mut packet = ByteWriter::with_capacity(
        PUBKEY_COMPRESSED_LEN + AES_BLOCK_SIZE + ciphertext.len(),
    );
    packet.put_bytes(&ephemeral_pub);
    packet.put_bytes(iv.as_slice());
    packet.put_bytes(&ciphertext);
    Ok(packet.into_vec())
}

/// Open a packet read from `storage_key` and verify its MAC against that
/// key. Any mismatch is a fatal corruption error.
pub fn read_data_packet(
    storage_key: &[u8],
    packet: &[u8],
    decrypt_privkey: &[u8],
    mac_key: &[u8],
    version: u32,
) -> Result<(Vec<u8>, SecureBytes)> {
    if version != ENCRYPTION_VERSION {
        return Err(WalletError::Unsupported(format!("encryption version {version}")));
    }

    let mut reader = ByteReader::new(packet);
    let ephemeral_pub = reader.get_bytes(PUBKEY_COMPRESSED_LEN)?;
    let iv = reader.get_bytes(AES_BLOCK_SIZE)?;
    let ciphertext = reader.rest();

    let shared = ecdh_mul(ephemeral_pub, decrypt_privkey)?;
    let enc_key = SecureBytes::from_slice(&hash256(&shared));
    let cleartext = aes256_cbc_decrypt_padded(enc_key.as_slice(), iv, ciphertext)
        .map_err(|_| WalletError::IntegrityFailure("packet decryption failed".into()))?;

    let mut clear = ByteReader::new(&cleartext);
    let mac = clear.get_bytes(HMAC_LEN)?.to_vec();
    let payload_start = clear.position();
    let data_key = clear
        .get_var_bytes()
        .map_err(|_| WalletError::IntegrityFailure("malformed packet payload".into()))?
        .to_vec();
    let value = clear
        .get_var_bytes()
        .map_err(|_| WalletError::IntegrityFailure("malformed packet payload".into()))?
        .to_vec();
    let payload_end = clear.position();
    if !clear.is_exhausted() {
        return Err(WalletError::IntegrityFailure("loose data in packet".into()));
    }

    let mut mac_input = cleartext[payload_start..payload_end].to_vec();
    mac_input.extend_from_slice(storage_key);
    let computed = hmac256(mac_key, &mac_input);
    if !ct_eq(&mac, &computed) {
        return Err(WalletError::IntegrityFailure("packet mac mismatch".into()));
    }

    Ok((data_key, SecureBytes::new(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::secp;

    struct Keys {
        privkey: SecureBytes,
        pubkey: Vec<u8>,
        mac_key: Vec<u8>,
    }

    fn keys() -> Keys {
        let privkey = secp::generate_privkey();
        let pubkey = secp::pubkey_from_privkey(privkey.as_slice(), true).unwrap();
        Keys { privkey, pubkey, mac_key: vec![0x77; 32] }
    }

    #[test]
    fn envelope_roundtrip() {
        let keys = keys();
        let prng = FortunaPrng::new();
        let packet = create_data_packet(
            b"\x00\x00\x00\x07",
            b"asset-key",
            b"asset-value",
            &keys.pubkey,
            &keys.mac_key,
            ENCRYPTION_VERSION,
            &prng,
        )
        .unwrap();

        let (data_key, value) = read_data_packet(
            b"\x00\x00\x00\x07",
            &packet,
            keys.privkey.as_slice(),
            &keys.mac_key,
            ENCRYPTION_VERSION,
        )
        .unwrap();
        assert_eq!(data_key, b"asset-key");
        assert_eq!(value.as_slice(), b"asset-value");
    }

    #[test]
    fn bit_flips_anywhere_are_fatal() {
        let keys = keys();
        let prng = FortunaPrng::new();
        let packet = create_data_packet(
            b"\x00\x00\x00\x01",
            b"k",
            b"v",
            &keys.pubkey,
            &keys.mac_key,
            ENCRYPTION_VERSION,
            &prng,
        )
        .unwrap();

        for pos in [0usize, 34, packet.len() - 1] {
            let mut corrupted = packet.clone();
            corrupted[pos] ^= 0x01;
            let result = read_data_packet(
                b"\x00\x00\x00\x01",
                &corrupted,
                keys.privkey.as_slice(),
                &keys.mac_key,
                ENCRYPTION_VERSION,
            );
            assert!(result.is_err(), "flip at {pos} must fail");
        }
    }

    #[test]
    fn wrong_storage_key_is_a_mac_mismatch() {
        let keys = keys();
        let prng = FortunaPrng::new();
        let packet = create_data_packet(
            b"\x00\x00\x00\x01",
            b"k",
            b"v",
            &keys.pubkey,
            &keys.mac_key,
            ENCRYPTION_VERSION,
            &prng,
        )
        .unwrap();

        let err = read_data_packet(
            b"\x00\x00\x00\x02",
            &packet,
            keys.privkey.as_slice(),
            &keys.mac_key,
            ENCRYPTION_VERSION,
        )
        .unwrap_err();
        assert!(matches!(err, WalletError::IntegrityFailure(_)));
    }

    #[test]
    fn unsupported_version_rejected() {
        let keys = keys();
        let prng = FortunaPrng::new();
        let err = create_data_packet(
            b"\x00",
            b"k",
            b"v",
            &keys.pubkey,
            &keys.mac_key,
            2,
            &prng,
        )
        .unwrap_err();
        assert!(matches!(err, WalletError::Unsupported(_)));
    }
}
