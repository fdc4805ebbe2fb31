//! Fortuna-style PRNG: AES-256 in counter mode, reseeded opportunistically
//! from the OS entropy source.
//!
//! This generator feeds IVs, ephemeral packet keys and session ids, so bytes
//! handed to the outside world never come straight off the OS pool. Critical
//! secrets (wallet seeds, identity keys) bypass it and use
//! [`os_random`] directly.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::hash::sha256;
use crate::crypto::secure::SecureBytes;

const RESEED_INTERVAL_BYTES: usize = 1024 * 1024;

/// Fill a buffer straight from the OS entropy source.
pub fn os_random(len: usize) -> SecureBytes {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    SecureBytes::new(buf)
}

struct FortunaState {
    key: [u8; 32],
    counter: u128,
    bytes_since_reseed: usize,
}

impl FortunaState {
    fn reseed(&mut self, extra_entropy: &[u8]) {
        let mut seed_input = Vec::with_capacity(64 + extra_entropy.len());
        seed_input.extend_from_slice(&self.key);
        let mut fresh = [0u8; 32];
        OsRng.fill_bytes(&mut fresh);
        seed_input.extend_from_slice(&fresh);
        seed_input.extend_from_slice(extra_entropy);

        self.key = sha256(&seed_input);
        self.bytes_since_reseed = 0;
    }
}

/// Shared, internally synchronised generator.
pub struct FortunaPrng {
    state: Mutex<FortunaState>,
}

impl FortunaPrng {
    pub fn new() -> Self {
        let mut state = FortunaState { key: [0u8; 32], counter: 1, bytes_since_reseed: 0 };
        state.reseed(&[]);
        FortunaPrng { state: Mutex::new(state) }
    }

    /// Generate `len` bytes, folding optional caller entropy into the next
    /// reseed.
    pub fn generate(&self, len: usize, extra_entropy: &[u8]) -> SecureBytes {
        let mut state = self.state.lock();

        if state.bytes_since_reseed >= RESEED_INTERVAL_BYTES || !extra_entropy.is_empty() {
            state.reseed(extra_entropy);
        }

        let cipher = Aes256::new(GenericArray::from_slice(&state.key));
        let mut out = vec![0u8; len];
        for chunk in out.chunks_mut(16) {
            let mut block = GenericArray::clone_from_slice(&state.counter.to_le_bytes());
            cipher.encrypt_block(&mut block);
            chunk.copy_from_slice(&block[..chunk.len()]);
            state.counter = state.counter.wrapping_add(1);
        }

        state.bytes_since_reseed += len;
        SecureBytes::new(out)
    }

    pub fn random_bytes(&self, len: usize) -> SecureBytes {
        self.generate(len, &[])
    }
}

impl Default for FortunaPrng {
    fn default() -> Self {
        FortunaPrng::new()
    }
}
