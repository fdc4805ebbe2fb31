//! Per-direction AEAD framing: ChaCha20-Poly1305 over the payload, with the
//! 4-byte length prefix encrypted under a separate keystream so nothing on
//! the wire is plaintext after session setup.
//!
//! Frame layout: `len(4, encrypted) ‖ ciphertext ‖ tag(16)`. The sequence
//! number feeds the nonce, so reordered or replayed frames fail the MAC.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::crypto::hash::hmac256;
use crate::crypto::SecureBytes;
use crate::error::{Result, WalletError};

pub const TAG_LEN: usize = 16;
pub const LEN_PREFIX: usize = 4;

/// Refuse frames claiming more than this; a garbled length otherwise reads
/// as a huge allocation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Rekey after this much traffic in one direction.
pub const REKEY_BYTE_THRESHOLD: u64 = 1 << 30;

const LENGTH_KEY_TAG: &[u8] = b"frame-length";

/// One direction of an encrypted channel.
pub struct DirectionState {
    key: SecureBytes,
    length_key: SecureBytes,
    iv_seed: [u8; 4],
    sequence: u64,
    bytes_since_rekey: u64,
}

impl DirectionState {
    /// `key` is the 32-byte agreed secret; `iv_seed` salts the nonce so the
    /// two directions of a connection never share one.
    pub fn new(key: SecureBytes, iv_seed: [u8; 4]) -> Self {
        let length_key = SecureBytes::from_slice(&hmac256(key.as_slice(), LENGTH_KEY_TAG));
        DirectionState { key, length_key, iv_seed, sequence: 0, bytes_since_rekey: 0 }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn needs_rekey(&self) -> bool {
        self.bytes_since_rekey >= REKEY_BYTE_THRESHOLD
    }

    /// Swap in a fresh key; applies from the next frame.
    pub fn rekey(&mut self, key: SecureBytes) {
        self.length_key = SecureBytes::from_slice(&hmac256(key.as_slice(), LENGTH_KEY_TAG));
        self.key = key;
        self.sequence = 0;
        self.bytes_since_rekey = 0;
    }

    /// Rekey by folding extra material into the current key, so the new
    /// key stays secret even when the extra material is not.
    pub fn rekey_mixed(&mut self, extra: &[u8]) {
        let mixed = hmac256(self.key.as_slice(), extra);
        self.rekey(SecureBytes::from_slice(&mixed));
    }

    fn nonce(&self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.iv_seed);
        nonce[4..].copy_from_slice(&self.sequence.to_le_bytes());
        nonce
    }

    fn apply_length_keystream(&self, buf: &mut [u8; LEN_PREFIX]) {
        let nonce = self.nonce();
        let mut cipher = ChaCha20::new(
            chacha20::Key::from_slice(self.length_key.as_slice()),
            chacha20::Nonce::from_slice(&nonce),
        );
        cipher.apply_keystream(buf);
    }

    /// Seal a payload into one wire frame and advance the counter.
    pub fn encrypt_frame(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes = self.nonce();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.key.as_slice()));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), Payload::from(payload))
            .map_err(|_| WalletError::IntegrityFailure("frame encryption failed".into()))?;

        let mut len_bytes: [u8; LEN_PREFIX] =
            (ciphertext.len() as u32).to_le_bytes();
        self.apply_length_keystream(&mut len_bytes);

        let mut frame = Vec::with_capacity(LEN_PREFIX + ciphertext.len());
        frame.extend_from_slice(&len_bytes);
        frame.extend_from_slice(&ciphertext);

        self.sequence += 1;
        self.bytes_since_rekey += frame.len() as u64;
        Ok(frame)
    }

    /// Decrypt the length prefix without consuming the sequence number, so
    /// the caller knows how many bytes to read next.
    pub fn decrypt_length(&self, len_bytes: &[u8; LEN_PREFIX]) -> Result<usize> {
        let mut buf = *len_bytes;
        self.apply_length_keystream(&mut buf);
        let len = u32::from_le_bytes(buf) as usize;
        if len < TAG_LEN || len > MAX_FRAME_LEN {
            return Err(WalletError::IntegrityFailure(format!("implausible frame length {len}")));
        }
        Ok(len)
    }

    /// Open a frame body previously sized by [`decrypt_length`]. A MAC
    /// failure is fatal for the session.
    pub fn decrypt_frame(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes = self.nonce();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.key.as_slice()));
        let payload = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), Payload::from(ciphertext))
            .map_err(|_| WalletError::IntegrityFailure("frame mac failure".into()))?;

        self.sequence += 1;
        self.bytes_since_rekey += (LEN_PREFIX + ciphertext.len()) as u64;
        Ok(payload)
    }

    /// One-shot helper for message-level tests and the in-memory
    /// handshake: splits and decrypts a full frame.
    pub fn decrypt_whole_frame(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < LEN_PREFIX + TAG_LEN {
            return Err(WalletError::IntegrityFailure("truncated frame".into()));
        }
        let len_bytes: [u8; LEN_PREFIX] = frame[..LEN_PREFIX].try_into().unwrap();
        let len = self.decrypt_length(&len_bytes)?;
        if frame.len() != LEN_PREFIX + len {
            return Err(WalletError::IntegrityFailure("frame length mismatch".into()));
        }
        self.decrypt_frame(&frame[LEN_PREFIX..])
    }
}
