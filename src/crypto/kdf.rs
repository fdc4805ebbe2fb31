//! Sequential memory-hard key derivation (Percival's ROMix over SHA-512).
//!
//! Parameters are calibrated once at wallet creation against a wall-clock
//! target and recorded next to the wallet header; derivation is pure after
//! that. The lookup table forces the full memory requirement on every
//! derivation, which is the point.

use std::time::Instant;

use sha2::{Digest, Sha512};
use tracing::debug;

use crate::crypto::hash::hmac256;
use crate::crypto::secure::SecureBytes;
use crate::error::{Result, WalletError};

const HASH_OUTPUT_BYTES: usize = 64;
const KDF_OUTPUT_BYTES: usize = 32;

pub const KDF_MIN_MEMORY: u32 = 128 * 1024;
pub const KDF_MAX_MEMORY: u32 = 32 * 1024 * 1024;
pub const KDF_DEFAULT_TARGET_SECS: f64 = 0.25;

fn sha512(data: &[u8]) -> [u8; HASH_OUTPUT_BYTES] {
    Sha512::digest(data).into()
}

/// ROMix KDF instance: `{memory_bytes, iterations, salt}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfRomix {
    memory_bytes: u32,
    iterations: u32,
    salt: Vec<u8>,
}

impl KdfRomix {
    pub fn new(memory_bytes: u32, iterations: u32, salt: Vec<u8>) -> Result<Self> {
        if memory_bytes > KDF_MAX_MEMORY {
            return Err(WalletError::ResourceExhausted(format!(
                "kdf memory request {memory_bytes} over cap {KDF_MAX_MEMORY}"
            )));
        }
        if memory_bytes < HASH_OUTPUT_BYTES as u32 || iterations == 0 {
            return Err(WalletError::InvalidArgument("degenerate kdf parameters".into()));
        }
        Ok(KdfRomix { memory_bytes, iterations, salt })
    }

    /// Pick parameters so one [`derive`](Self::derive) lands between
    /// `target_secs / 2` and `target_secs` on this machine.
    pub fn calibrate(target_secs: f64, salt: Vec<u8>) -> Result<Self> {
        let target = if target_secs > 0.0 { target_secs } else { KDF_DEFAULT_TARGET_SECS };

        // Grow the table until a single pass costs at least half the target
        // or we hit the memory cap, then stretch with iterations.
        let mut memory = KDF_MIN_MEMORY;
        let mut single_pass;
        loop {
            let probe = KdfRomix { memory_bytes: memory, iterations: 1, salt: salt.clone() };
            let start = Instant::now();
            probe.derive_one_iter(b"calibration probe")?;
            single_pass = start.elapsed().as_secs_f64().max(1e-6);

            if single_pass >= target / 2.0 || memory >= KDF_MAX_MEMORY {
                break;
            }
            memory = (memory * 2).min(KDF_MAX_MEMORY);
        }

        let iterations = ((target / single_pass).floor() as u32).max(1);
        debug!(memory, iterations, "calibrated romix kdf");
        KdfRomix::new(memory, iterations, salt)
    }

    pub fn memory_bytes(&self) -> u32 {
        self.memory_bytes
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Content-derived identifier over the three parameters.
    pub fn id(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(8);
        msg.extend_from_slice(&self.memory_bytes.to_le_bytes());
        msg.extend_from_slice(&self.iterations.to_le_bytes());
        hmac256(&self.salt, &msg)[16..].to_vec()
    }

    fn derive_one_iter(&self, password: &[u8]) -> Result<SecureBytes> {
        let lookups = (self.memory_bytes as usize) / HASH_OUTPUT_BYTES;

        // Seed, then fill the table with its hash chain.
        let mut seed_input = Vec::with_capacity(password.len() + self.salt.len());
        seed_input.extend_from_slice(password);
        seed_input.extend_from_slice(&self.salt);

        let mut table = SecureBytes::zeroed(lookups * HASH_OUTPUT_BYTES);
        let lut = table.as_mut_slice();
        lut[..HASH_OUTPUT_BYTES].copy_from_slice(&sha512(&seed_input));
        for i in 1..lookups {
            let prev_start = (i - 1) * HASH_OUTPUT_BYTES;
            let digest = sha512(&lut[prev_start..prev_start + HASH_OUTPUT_BYTES]);
            lut[i * HASH_OUTPUT_BYTES..(i + 1) * HASH_OUTPUT_BYTES].copy_from_slice(&digest);
        }

        // Sequential random walk: the index depends on the running state, so
        // the whole table must stay resident.
        let mut state = [0u8; HASH_OUTPUT_BYTES];
        state.copy_from_slice(&lut[(lookups - 1) * HASH_OUTPUT_BYTES..]);
        let mut mixed = [0u8; HASH_OUTPUT_BYTES];
        for _ in 0..lookups {
            let index = (u32::from_le_bytes(state[..4].try_into().unwrap()) as usize) % lookups;
            let entry = &lut[index * HASH_OUTPUT_BYTES..(index + 1) * HASH_OUTPUT_BYTES];
            for ((m, s), e) in mixed.iter_mut().zip(state.iter()).zip(entry.iter()) {
                *m = s ^ e;
            }
            state = sha512(&mixed);
        }

        Ok(SecureBytes::from_slice(&state[..KDF_OUTPUT_BYTES]))
    }

    /// Derive a 32-byte key. Pure: same parameters and passphrase always
    /// produce the same key.
    pub fn derive(&self, password: &[u8]) -> Result<SecureBytes> {
        let mut key = self.derive_one_iter(password)?;
        for _ in 1..self.iterations {
            key = self.derive_one_iter(key.as_slice())?;
        }
        Ok(key)
    }
}
