//! SecurePrint: encrypt a 32-byte root (and optional chaincode) under a
//! short printable passphrase derived from the secret itself. The
//! passphrase goes on the paper backup; it is never chosen by the user.
//!
//! The IV and KDF salt are nothing-up-my-sleeve constants built from the
//! digits of pi and e.

use once_cell::sync::Lazy;

use crate::crypto::aes::{aes256_cbc_decrypt, aes256_cbc_encrypt};
use crate::crypto::hash::{hash256, hmac512};
use crate::crypto::{KdfRomix, SecureBytes};
use crate::encode::{base58_decode, base58_encode};
use crate::error::{Result, WalletError};

const DIGITS_PI: &str = concat!(
    "ARMORY_ENCRYPTION_INITIALIZATION_VECTOR_",
    "1415926535897932384626433832795028841971693993751058209749445923",
    "0781640628620899862803482534211706798214808651328230664709384460",
    "9550582231725359408128481117450284102701938521105559644622948954",
    "9303819644288109756659334461284756482337867831652712019091456485",
);

const DIGITS_E: &str = concat!(
    "ARMORY_KEY_DERIVATION_FUNCTION_SALT_",
    "7182818284590452353602874713526624977572470936999595749669676277",
    "2407663035354759457138217852516642742746639193200305992181741359",
    "6629043572900334295260595630738132328627943490763233829880753195",
    "2510190115738341879307021540891499348841675092447614606680822648",
);

const KDF_MEMORY: u32 = 16 * 1024 * 1024;
const PASSPHRASE_BASE_LEN: usize = 7;

static IV16: Lazy<[u8; 16]> =
    Lazy::new(|| hash256(DIGITS_PI.as_bytes())[..16].try_into().unwrap());
static SALT: Lazy<[u8; 32]> = Lazy::new(|| hash256(DIGITS_E.as_bytes()));

fn kdf() -> Result<KdfRomix> {
    KdfRomix::new(KDF_MEMORY, 1, SALT.to_vec())
}

/// Derive the printable passphrase for a root (+ optional chaincode):
/// 7 bytes of HMAC keyed by the secret's hash, a 1-byte checksum, base58.
pub fn derive_passphrase(root: &[u8], chaincode: Option<&[u8]>) -> Result<String> {
    if root.len() != 32 {
        return Err(WalletError::InvalidArgument("secureprint root must be 32 bytes".into()));
    }

    let key_hash = match chaincode {
        None => hash256(root),
        Some(cc) => {
            let mut joined = Vec::with_capacity(root.len() + cc.len());
            joined.extend_from_slice(root);
            joined.extend_from_slice(cc);
            hash256(&joined)
        }
    };
    let stretched = hmac512(&key_hash, &SALT[..]);

    let mut passphrase_bytes = stretched[..PASSPHRASE_BASE_LEN].to_vec();
    let checksum = hash256(&passphrase_bytes)[0];
    passphrase_bytes.push(checksum);

    Ok(base58_encode(&passphrase_bytes))
}

/// Validate a passphrase's embedded checksum. Runs before the KDF so a
/// mistyped passphrase fails fast.
pub fn check_passphrase(passphrase: &str) -> Result<()> {
    let decoded = base58_decode(passphrase)?;
    if decoded.len() != PASSPHRASE_BASE_LEN + 1 {
        return Err(WalletError::IntegrityFailure("bad secureprint passphrase length".into()));
    }
    let (base, checksum) = decoded.split_at(PASSPHRASE_BASE_LEN);
    if hash256(base)[0] != checksum[0] {
        return Err(WalletError::IntegrityFailure("secureprint passphrase checksum".into()));
    }
    Ok(())
}

fn passphrase_key(passphrase: &str) -> Result<SecureBytes> {
    check_passphrase(passphrase)?;
    kdf()?.derive(passphrase.as_bytes())
}

/// Encrypted root and chaincode plus the passphrase that unlocks them.
pub struct SecurePrintData {
    pub encrypted_root: Vec<u8>,
    pub encrypted_chaincode: Option<Vec<u8>>,
    pub passphrase: String,
}

/// Encrypt a root (and optional chaincode), each exactly 32 bytes in and
/// 32 bytes out.
pub fn encrypt(root: &[u8], chaincode: Option<&[u8]>) -> Result<SecurePrintData> {
    if root.len() != 32 {
        return Err(WalletError::InvalidArgument("secureprint root must be 32 bytes".into()));
    }
    if let Some(cc) = chaincode {
        if cc.len() != 32 {
            return Err(WalletError::InvalidArgument(
                "secureprint chaincode must be 32 bytes".into(),
            ));
        }
    }

    let passphrase = derive_passphrase(root, chaincode)?;
    let key = passphrase_key(&passphrase)?;

    let encrypted_root = aes256_cbc_encrypt(key.as_slice(), &IV16[..], root)?;
    let encrypted_chaincode = chaincode
        .map(|cc| aes256_cbc_encrypt(key.as_slice(), &IV16[..], cc))
        .transpose()?;

    Ok(SecurePrintData { encrypted_root, encrypted_chaincode, passphrase })
}

/// Decrypt one 32-byte SecurePrint block. The passphrase checksum is
/// verified before the memory-hard KDF runs.
pub fn decrypt(ciphertext: &[u8], passphrase: &str) -> Result<SecureBytes> {
    if ciphertext.len() != 32 {
        return Err(WalletError::InvalidArgument(
            "secureprint ciphertext must be 32 bytes".into(),
        ));
    }
    let key = passphrase_key(passphrase)?;
    Ok(SecureBytes::new(aes256_cbc_decrypt(key.as_slice(), &IV16[..], ciphertext)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Vec<u8> {
        (0u8..32).collect()
    }

    fn chaincode() -> Vec<u8> {
        (32u8..64).collect()
    }

    #[test]
    fn passphrase_checksum_structure() {
        let passphrase = derive_passphrase(&root(), None).unwrap();
        let decoded = base58_decode(&passphrase).unwrap();
        assert_eq!(decoded.len(), 8);
        assert_eq!(hash256(&decoded[..7])[0], decoded[7]);
        check_passphrase(&passphrase).unwrap();
    }

    #[test]
    fn passphrase_depends_on_chaincode() {
        let without = derive_passphrase(&root(), None).unwrap();
        let with = derive_passphrase(&root(), Some(&chaincode())).unwrap();
        assert_ne!(without, with);
    }

    #[test]
    fn roundtrip_root_only() {
        let data = encrypt(&root(), None).unwrap();
        assert_eq!(data.encrypted_root.len(), 32);
        assert!(data.encrypted_chaincode.is_none());

        let recovered = decrypt(&data.encrypted_root, &data.passphrase).unwrap();
        assert_eq!(recovered.as_slice(), root().as_slice());
    }

    #[test]
    fn roundtrip_with_chaincode() {
        let data = encrypt(&root(), Some(&chaincode())).unwrap();
        let cc = data.encrypted_chaincode.as_ref().unwrap();
        assert_eq!(cc.len(), 32);

        assert_eq!(
            decrypt(&data.encrypted_root, &data.passphrase).unwrap().as_slice(),
            root().as_slice()
        );
        assert_eq!(decrypt(cc, &data.passphrase).unwrap().as_slice(), chaincode().as_slice());
    }

    #[test]
    fn wrong_passphrase_fails_before_kdf() {
        let data = encrypt(&root(), None).unwrap();

        // flip a character; the embedded checksum catches it
        let mut chars: Vec<char> = data.passphrase.chars().collect();
        chars[0] = if chars[0] == '2' { '3' } else { '2' };
        let wrong: String = chars.into_iter().collect();

        let err = decrypt(&data.encrypted_root, &wrong).unwrap_err();
        assert!(matches!(err, WalletError::IntegrityFailure(_)));
    }
}
