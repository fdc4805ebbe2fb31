//! Authenticated, encrypted peer transport: per-direction AEAD framing and
//! the two-stage handshake that sets it up.

pub mod frame;
pub mod handshake;

use crate::crypto::hash::hash160;
use crate::encode::base58check_encode;
use crate::error::Result;

pub use frame::{DirectionState, MAX_FRAME_LEN, REKEY_BYTE_THRESHOLD};
pub use handshake::{
    HandshakeMessage, HandshakeState, IdentityConfig, PeerSession, Role,
    CIPHER_SUITE_CHACHA20POLY1305,
};

/// Printable identity fingerprint for out-of-band verification.
pub fn identity_fingerprint(identity_pubkey: &[u8]) -> Result<String> {
    base58check_encode(&hash160(identity_pubkey))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::secp::{generate_privkey, pubkey_from_privkey};

    #[test]
    fn fingerprint_is_stable_and_printable() {
        let privkey = generate_privkey();
        let pubkey = pubkey_from_privkey(privkey.as_slice(), true).unwrap();
        let a = identity_fingerprint(&pubkey).unwrap();
        let b = identity_fingerprint(&pubkey).unwrap();
        assert_eq!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
