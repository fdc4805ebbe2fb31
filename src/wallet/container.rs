//! In-memory custody of unwrapped master keys.
//!
//! Private-key blobs can only be decrypted through an explicit unlock
//! scope. Unlocking takes a reentrant lock (depth counter under a primitive
//! mutex) and prompts for the passphrase at most once per distinct key id;
//! releasing the outermost scope zeroises everything that was unwrapped.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::crypto::{KdfRomix, SecureBytes};
use crate::error::{Result, WalletError};
use crate::store::encryption_key_id;
use crate::wallet::encryption::{CipherData, EncryptionKeyRecord};

/// Caller-supplied passphrase source. Receives the ids of the keys being
/// requested; `None` means the caller gave up.
pub type PassphrasePrompt = Arc<dyn Fn(&[Vec<u8>]) -> Option<SecureBytes> + Send + Sync>;

const MAX_PASSPHRASE_ATTEMPTS: u32 = 3;

#[derive(Default)]
struct ContainerState {
    lock_depth: u32,
    /// encryption key id → unwrapped key, for the current unlock scope
    decrypted_keys: HashMap<Vec<u8>, SecureBytes>,
}

pub struct DecryptedDataContainer {
    kdfs: HashMap<Vec<u8>, KdfRomix>,
    encryption_keys: HashMap<Vec<u8>, EncryptionKeyRecord>,
    prompt: PassphrasePrompt,
    state: Mutex<ContainerState>,
}

impl DecryptedDataContainer {
    pub fn new(prompt: PassphrasePrompt) -> Self {
        DecryptedDataContainer {
            kdfs: HashMap::new(),
            encryption_keys: HashMap::new(),
            prompt,
            state: Mutex::new(ContainerState::default()),
        }
    }

    pub fn add_kdf(&mut self, kdf: KdfRomix) {
        self.kdfs.insert(kdf.id(), kdf);
    }

    pub fn add_encryption_key(&mut self, record: EncryptionKeyRecord) {
        self.encryption_keys.insert(record.id.clone(), record);
    }

    pub fn kdf(&self, id: &[u8]) -> Option<&KdfRomix> {
        self.kdfs.get(id)
    }

    pub fn encryption_key(&self, id: &[u8]) -> Option<&EncryptionKeyRecord> {
        self.encryption_keys.get(id)
    }

    /// Enter an unlock scope. Reentrant from the same call stack via the
    /// returned guard; nested scopes share the decrypted cache.
    pub fn unlock(&self) -> ContainerLock<'_> {
        let mut state = self.state.lock();
        state.lock_depth += 1;
        drop(state);
        ContainerLock { container: self }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ContainerState) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state)
    }

    /// Unwrap the named master key inside an unlock scope, prompting for
    /// its passphrase if this scope has not seen the key yet.
    fn unwrap_master_key(
        &self,
        state: &mut MutexGuard<'_, ContainerState>,
        key_id: &[u8],
    ) -> Result<SecureBytes> {
        if let Some(cached) = state.decrypted_keys.get(key_id) {
            return Ok(cached.to_owned_secret());
        }

        let record = self.encryption_keys.get(key_id).ok_or_else(|| {
            WalletError::NotFound(format!("encryption key {}", hex::encode(key_id)))
        })?;

        for attempt in 0..MAX_PASSPHRASE_ATTEMPTS {
            let Some(passphrase) = (self.prompt)(&[key_id.to_vec()]) else {
                return Err(WalletError::PermissionDenied("no passphrase supplied".into()));
            };

            for (kdf_id, wrap) in &record.wraps {
                let kdf = self.kdfs.get(kdf_id).ok_or_else(|| {
                    WalletError::NotFound(format!("kdf {}", hex::encode(kdf_id)))
                })?;
                let derived = kdf.derive(passphrase.as_slice())?;

                // the wrap names the id of the passphrase-derived key; a
                // mismatch means a wrong passphrase, not corruption
                let derived_id = match encryption_key_id(derived.as_slice()) {
                    Ok(id) => id,
                    Err(_) => continue,
                };
                if derived_id != wrap.cipher.encryption_key_id {
                    continue;
                }

                let unwrapped =
                    wrap.cipher.decrypt(derived.as_slice(), &wrap.cipher_text)?;
                state.decrypted_keys.insert(key_id.to_vec(), unwrapped.to_owned_secret());
                return Ok(unwrapped);
            }
            debug!(attempt, "passphrase rejected");
        }

        Err(WalletError::PermissionDenied("authentication attempts exceeded".into()))
    }

    /// Decrypt an encrypted blob whose cipher names a master key held here.
    /// Must be called inside an unlock scope.
    pub fn decrypt(&self, cipher_data: &CipherData) -> Result<SecureBytes> {
        let mut state = self.state.lock();
        if state.lock_depth == 0 {
            return Err(WalletError::PermissionDenied(
                "decrypt outside an unlock scope".into(),
            ));
        }

        let master = self.unwrap_master_key(&mut state, &cipher_data.cipher.encryption_key_id)?;
        cipher_data.cipher.decrypt(master.as_slice(), &cipher_data.cipher_text)
    }

    /// As [`decrypt`](Self::decrypt), for padded blobs of arbitrary length.
    pub fn decrypt_padded(&self, cipher_data: &CipherData) -> Result<SecureBytes> {
        let mut state = self.state.lock();
        if state.lock_depth == 0 {
            return Err(WalletError::PermissionDenied(
                "decrypt outside an unlock scope".into(),
            ));
        }

        let master = self.unwrap_master_key(&mut state, &cipher_data.cipher.encryption_key_id)?;
        cipher_data.cipher.decrypt_padded(master.as_slice(), &cipher_data.cipher_text)
    }

    /// Encrypt a secret under the named master key (for new records or
    /// re-wraps). Must be called inside an unlock scope.
    pub fn encrypt(
        &self,
        key_id: &[u8],
        cipher: &crate::wallet::encryption::Cipher,
        cleartext: &[u8],
    ) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        if state.lock_depth == 0 {
            return Err(WalletError::PermissionDenied(
                "encrypt outside an unlock scope".into(),
            ));
        }
        let master = self.unwrap_master_key(&mut state, key_id)?;
        cipher.encrypt(master.as_slice(), cleartext)
    }

    /// Re-wrap a master key under a new passphrase. The previous wrap is
    /// replaced; callers persist the returned record and the old one is
    /// gone once that commit lands. Runs its own unlock scope.
    pub fn rewrap_master_key(
        &mut self,
        key_id: &[u8],
        new_passphrase: &[u8],
        prng: &crate::crypto::FortunaPrng,
    ) -> Result<EncryptionKeyRecord> {
        let master = {
            let mut state = self.state.lock();
            state.lock_depth += 1;
            let result = self.unwrap_master_key(&mut state, key_id);
            state.lock_depth -= 1;
            if state.lock_depth == 0 {
                for (_, mut key) in state.decrypted_keys.drain() {
                    key.wipe();
                }
            }
            result?
        };

        let record = self.encryption_keys.get(key_id).ok_or_else(|| {
            WalletError::NotFound(format!("encryption key {}", hex::encode(key_id)))
        })?;
        let kdf_id = record
            .wraps
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| WalletError::IntegrityFailure("key record has no wraps".into()))?;
        let kdf = self
            .kdfs
            .get(&kdf_id)
            .ok_or_else(|| WalletError::NotFound(format!("kdf {}", hex::encode(&kdf_id))))?;

        let derived = kdf.derive(new_passphrase)?;
        let derived_id = crate::store::encryption_key_id(derived.as_slice())?;
        let cipher = crate::wallet::encryption::Cipher::fresh(kdf_id.clone(), derived_id, prng);
        let cipher_text = cipher.encrypt(derived.as_slice(), master.as_slice())?;

        let mut wraps = std::collections::BTreeMap::new();
        wraps.insert(kdf_id, CipherData { cipher, cipher_text });
        let fresh = EncryptionKeyRecord { id: key_id.to_vec(), wraps };
        self.encryption_keys.insert(key_id.to_vec(), fresh.clone());
        Ok(fresh)
    }

    /// Pre-seed an unwrapped key into the current scope (used at wallet
    /// creation, where the key was just generated).
    pub fn seed_decrypted_key(&self, key_id: Vec<u8>, key: SecureBytes) -> Result<()> {
        self.with_state(|state| {
            if state.lock_depth == 0 {
                return Err(WalletError::PermissionDenied(
                    "seeding a key outside an unlock scope".into(),
                ));
            }
            state.decrypted_keys.insert(key_id, key);
            Ok(())
        })
    }
}

/// RAII unlock scope. Dropping the outermost guard wipes the unwrapped
/// key material.
pub struct ContainerLock<'a> {
    container: &'a DecryptedDataContainer,
}

impl Drop for ContainerLock<'_> {
    fn drop(&mut self) {
        self.container.with_state(|state| {
            state.lock_depth -= 1;
            if state.lock_depth == 0 {
                for (_, mut key) in state.decrypted_keys.drain() {
                    key.wipe();
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::crypto::kdf::KDF_MIN_MEMORY;
    use crate::crypto::os_random;
    use crate::wallet::encryption::Cipher;

    fn build_container(
        passphrase: &'static [u8],
        prompts: Arc<AtomicU32>,
    ) -> (DecryptedDataContainer, Vec<u8>, SecureBytes) {
        let kdf = KdfRomix::new(KDF_MIN_MEMORY, 1, b"salt".to_vec()).unwrap();
        let master = os_random(32);
        let master_id = encryption_key_id(master.as_slice()).unwrap();

        let derived = kdf.derive(passphrase).unwrap();
        let derived_id = encryption_key_id(derived.as_slice()).unwrap();
        let wrap_cipher = Cipher {
            kdf_id: kdf.id(),
            encryption_key_id: derived_id,
            iv: vec![0x31; 16],
        };
        let wrapped = wrap_cipher.encrypt(derived.as_slice(), master.as_slice()).unwrap();

        let mut wraps = BTreeMap::new();
        wraps.insert(kdf.id(), CipherData { cipher: wrap_cipher, cipher_text: wrapped });
        let record = EncryptionKeyRecord { id: master_id.clone(), wraps };

        let prompt: PassphrasePrompt = Arc::new(move |_ids: &[Vec<u8>]| {
            prompts.fetch_add(1, Ordering::SeqCst);
            Some(SecureBytes::from_slice(passphrase))
        });

        let mut container = DecryptedDataContainer::new(prompt);
        container.add_kdf(kdf);
        container.add_encryption_key(record);
        (container, master_id, master)
    }

    fn encrypt_under(master: &SecureBytes, master_id: &[u8], secret: &[u8]) -> CipherData {
        let cipher = Cipher {
            kdf_id: Vec::new(),
            encryption_key_id: master_id.to_vec(),
            iv: vec![0x17; 16],
        };
        let cipher_text = cipher.encrypt(master.as_slice(), secret).unwrap();
        CipherData { cipher, cipher_text }
    }

    #[test]
    fn decrypt_requires_unlock_scope() {
        let prompts = Arc::new(AtomicU32::new(0));
        let (container, master_id, master) = build_container(b"pass", prompts);
        let blob = encrypt_under(&master, &master_id, &[0x42; 32]);

        let err = container.decrypt(&blob).unwrap_err();
        assert!(matches!(err, WalletError::PermissionDenied(_)));

        let _lock = container.unlock();
        assert_eq!(container.decrypt(&blob).unwrap().as_slice(), [0x42; 32]);
    }

    #[test]
    fn prompt_fires_once_per_key_per_scope() {
        let prompts = Arc::new(AtomicU32::new(0));
        let (container, master_id, master) = build_container(b"pass", prompts.clone());
        let blob_a = encrypt_under(&master, &master_id, &[0x01; 32]);
        let blob_b = encrypt_under(&master, &master_id, &[0x02; 32]);

        {
            let _lock = container.unlock();
            container.decrypt(&blob_a).unwrap();
            container.decrypt(&blob_b).unwrap();
            assert_eq!(prompts.load(Ordering::SeqCst), 1);
        }

        // new scope prompts again
        let _lock = container.unlock();
        container.decrypt(&blob_a).unwrap();
        assert_eq!(prompts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn nested_scopes_share_cache() {
        let prompts = Arc::new(AtomicU32::new(0));
        let (container, master_id, master) = build_container(b"pass", prompts.clone());
        let blob = encrypt_under(&master, &master_id, &[0x05; 32]);

        let outer = container.unlock();
        {
            let _inner = container.unlock();
            container.decrypt(&blob).unwrap();
        }
        // inner scope ended but outer keeps the cache warm
        container.decrypt(&blob).unwrap();
        assert_eq!(prompts.load(Ordering::SeqCst), 1);
        drop(outer);
    }

    #[test]
    fn wrong_passphrase_exhausts_attempts() {
        let prompts = Arc::new(AtomicU32::new(0));
        let (container, master_id, master) = {
            let (mut c, id, master) = build_container(b"right", prompts.clone());
            // swap the prompt for one that always answers wrong
            c.prompt = Arc::new(|_ids: &[Vec<u8>]| Some(SecureBytes::from_slice(b"wrong")));
            (c, id, master)
        };
        let blob = encrypt_under(&master, &master_id, &[0x07; 32]);

        let _lock = container.unlock();
        let err = container.decrypt(&blob).unwrap_err();
        assert!(matches!(err, WalletError::PermissionDenied(_)));
    }
}
