//! Paper backups: Easy16 lines over the wallet root (optionally SecurePrint
//! encrypted), and the restore flow that rebuilds a wallet from them.

pub mod easy16;
pub mod secureprint;

use std::path::Path;

use tracing::{info, warn};

use crate::crypto::secp::pubkey_from_privkey;
use crate::crypto::SecureBytes;
use crate::error::{Result, WalletError};
use crate::wallet::asset::AssetEntry;
use crate::wallet::container::PassphrasePrompt;
use crate::wallet::derive::{compute_chaincode_legacy, Bip32Node};
use crate::wallet::{compute_wallet_id, CreateParams, Wallet};

pub use easy16::{decode, encode, repair, BackupType, DecodedBackup};

/// Everything that goes on paper for one wallet.
pub struct WalletBackup {
    pub wallet_id: String,
    pub backup_type: BackupType,
    pub root_clear: Vec<String>,
    pub root_encrypted: Vec<String>,
    pub chaincode_clear: Option<Vec<String>>,
    pub chaincode_encrypted: Option<Vec<String>>,
    pub secureprint_passphrase: String,
}

/// Decisions the restore flow needs from its caller.
#[derive(Debug)]
pub enum RestorePrompt<'a> {
    /// Not enough lines to be a backup.
    FormatError,
    /// Lines failed to decode at all.
    Failure,
    /// Unrepairable checksum errors; per-line results attached.
    ChecksumError(&'a [Option<BackupType>]),
    /// SecurePrint passphrase rejected.
    DecryptError,
    /// The backup kind cannot be restored.
    TypeError,
    /// Confirm the recovered wallet id before anything is written.
    Id { wallet_id: &'a str },
    /// Supply the new wallet passphrase.
    Passphrase,
    /// Supply the new control passphrase.
    Control,
}

pub enum PromptReply {
    Accept,
    Reject,
    Passphrase(SecureBytes),
}

pub type RestoreCallback<'a> = &'a dyn Fn(RestorePrompt<'_>) -> PromptReply;

/// Extracted secret material for a backup.
struct RootData {
    backup_type: BackupType,
    root: SecureBytes,
    chaincode: Option<SecureBytes>,
}

fn root_data_for(wallet: &Wallet) -> Result<RootData> {
    match wallet.root() {
        AssetEntry::LegacyRoot { chaincode, .. } => {
            let _lock = wallet.unlock();
            let root = wallet.decrypted_privkey(&crate::wallet::asset::AssetId::root())?;

            // carry the chaincode only when it is not the deterministic one
            let computed = compute_chaincode_legacy(root.as_slice());
            let secondary = if !chaincode.is_empty() && chaincode.as_slice() != computed.as_slice()
            {
                Some(SecureBytes::from_slice(chaincode))
            } else {
                None
            };
            Ok(RootData { backup_type: BackupType::Legacy, root, chaincode: secondary })
        }
        AssetEntry::Bip32Root { .. } => {
            if wallet.encrypted_seed().is_none() {
                // a root-only backup is representable on paper but not
                // restorable, so refuse to emit one
                return Err(WalletError::Unsupported(
                    "bip32 wallet has no stored seed to back up".into(),
                ));
            }
            let _lock = wallet.unlock();
            let seed = wallet.decrypted_seed()?;
            if seed.len() != 32 {
                return Err(WalletError::InvalidArgument(
                    "only 32-byte seeds fit the paper backup format".into(),
                ));
            }
            Ok(RootData { backup_type: BackupType::Bip32Structured, root: seed, chaincode: None })
        }
        AssetEntry::Multisig { .. } => {
            Err(WalletError::Unsupported("multisig wallet roots are not defined".into()))
        }
        AssetEntry::Single(_) => {
            Err(WalletError::InvalidArgument("wallet root is not a root asset".into()))
        }
    }
}

/// Produce the full paper backup for a wallet: cleartext and SecurePrint
/// lines, plus the derived passphrase.
pub fn get_wallet_backup(wallet: &Wallet) -> Result<WalletBackup> {
    let root_data = root_data_for(wallet)?;
    let chaincode_slice = root_data.chaincode.as_ref().map(|cc| cc.as_slice().to_vec());

    let encrypted =
        secureprint::encrypt(root_data.root.as_slice(), chaincode_slice.as_deref())?;

    let backup = WalletBackup {
        wallet_id: wallet.wallet_id().to_string(),
        backup_type: root_data.backup_type,
        root_clear: encode(root_data.root.as_slice(), root_data.backup_type),
        root_encrypted: encode(&encrypted.encrypted_root, root_data.backup_type),
        chaincode_clear: chaincode_slice
            .as_deref()
            .map(|cc| encode(cc, root_data.backup_type)),
        chaincode_encrypted: encrypted
            .encrypted_chaincode
            .as_deref()
            .map(|cc| encode(cc, root_data.backup_type)),
        secureprint_passphrase: encrypted.passphrase,
    };

    info!(wallet_id = %backup.wallet_id, kind = ?backup.backup_type, "prepared wallet backup");
    Ok(backup)
}

fn prompt_passphrases(
    callback: RestoreCallback<'_>,
) -> Result<(SecureBytes, SecureBytes)> {
    let PromptReply::Passphrase(passphrase) = callback(RestorePrompt::Passphrase) else {
        return Err(WalletError::PermissionDenied("no wallet passphrase supplied".into()));
    };
    let PromptReply::Passphrase(control) = callback(RestorePrompt::Control) else {
        return Err(WalletError::PermissionDenied("no control passphrase supplied".into()));
    };
    Ok((passphrase, control))
}

fn decode_and_repair(
    lines: &[String],
    callback: RestoreCallback<'_>,
) -> Result<(DecodedBackup, BackupType)> {
    let mut decoded = decode(lines).map_err(|e| {
        callback(RestorePrompt::Failure);
        e
    })?;

    if decoded.has_errors() || decoded.uniform_type().is_none() {
        warn!("backup lines carry checksum errors, attempting repair");
        if let Err(e) = repair(&mut decoded) {
            callback(RestorePrompt::ChecksumError(&decoded.checksum_results));
            return Err(e);
        }
    } else {
        decoded.repaired_results =
            decoded.checksum_results.iter().map(|r| r.unwrap()).collect();
    }

    let first = decoded.repaired_results[0];
    if decoded.repaired_results.iter().any(|t| *t != first) {
        callback(RestorePrompt::ChecksumError(&decoded.checksum_results));
        return Err(WalletError::IntegrityFailure("backup lines disagree on kind".into()));
    }

    Ok((decoded, first))
}

/// Rebuild a wallet from backup lines.
///
/// `lines` holds two Easy16 lines for the root, plus two more for a legacy
/// chaincode. A non-empty `secureprint_passphrase` marks the lines as
/// SecurePrint ciphertext. The callback confirms the wallet id and supplies
/// the new passphrases.
pub fn restore_from_backup(
    lines: &[String],
    secureprint_passphrase: Option<&str>,
    dir: &Path,
    lookup: u32,
    kdf_target_secs: Option<f64>,
    callback: RestoreCallback<'_>,
    wallet_prompt: PassphrasePrompt,
) -> Result<Wallet> {
    if lines.len() < 2 {
        callback(RestorePrompt::FormatError);
        return Err(WalletError::InvalidArgument("a backup is at least two lines".into()));
    }

    let (primary_lines, secondary_lines) = lines.split_at(2);
    let (mut primary, primary_type) = decode_and_repair(primary_lines, callback)?;
    let mut secondary = if secondary_lines.is_empty() {
        None
    } else {
        let (decoded, secondary_type) = decode_and_repair(secondary_lines, callback)?;
        if secondary_type != primary_type {
            callback(RestorePrompt::ChecksumError(&decoded.checksum_results));
            return Err(WalletError::IntegrityFailure("backup lines disagree on kind".into()));
        }
        Some(decoded)
    };

    // SecurePrint layer, validated before the KDF runs
    if let Some(passphrase) = secureprint_passphrase {
        let decrypt_block = |decoded: &mut DecodedBackup| -> Result<()> {
            let clear = secureprint::decrypt(decoded.data.as_slice(), passphrase)?;
            decoded.data = clear;
            Ok(())
        };
        if let Err(e) = decrypt_block(&mut primary)
            .and_then(|_| secondary.as_mut().map_or(Ok(()), decrypt_block))
        {
            callback(RestorePrompt::DecryptError);
            return Err(e);
        }
    }

    match primary_type {
        BackupType::Legacy => {
            let root = primary.data;
            let chaincode = secondary.map(|s| s.data);

            let root_pub = pubkey_from_privkey(root.as_slice(), true)?;
            let wallet_id = compute_wallet_id(&root_pub)?;
            if !matches!(callback(RestorePrompt::Id { wallet_id: &wallet_id }), PromptReply::Accept)
            {
                return Err(WalletError::PermissionDenied("wallet id rejected".into()));
            }

            let (passphrase, control) = prompt_passphrases(callback)?;
            let params = CreateParams {
                passphrase: passphrase.as_slice(),
                control_passphrase: control.as_slice(),
                lookup,
                kdf_target_secs,
            };
            Wallet::create_from_legacy_root(
                dir,
                root.as_slice(),
                chaincode.as_ref().map(|cc| cc.as_slice()),
                params,
                wallet_prompt,
            )
        }
        BackupType::Bip32Structured | BackupType::Bip32Virgin => {
            let seed = primary.data;
            let node = Bip32Node::from_seed(seed.as_slice())?;
            let wallet_id = compute_wallet_id(node.neutered()?.pubkey())?;
            if !matches!(callback(RestorePrompt::Id { wallet_id: &wallet_id }), PromptReply::Accept)
            {
                return Err(WalletError::PermissionDenied("wallet id rejected".into()));
            }

            let (passphrase, control) = prompt_passphrases(callback)?;
            let lookup = if primary_type == BackupType::Bip32Virgin { 0 } else { lookup };
            let params = CreateParams {
                passphrase: passphrase.as_slice(),
                control_passphrase: control.as_slice(),
                lookup,
                kdf_target_secs,
            };
            Wallet::create_from_seed_bip32(dir, seed.as_slice(), params, wallet_prompt)
        }
        BackupType::Bip32Root => {
            // the tag is reserved on disk but a root alone cannot rebuild
            // the account structure
            callback(RestorePrompt::TypeError);
            Err(WalletError::Unsupported("bip32 root backups cannot be restored".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_type_indices_are_stable() {
        assert_eq!(BackupType::Legacy as u8, 0);
        assert_eq!(BackupType::Bip32Structured as u8, 1);
        assert_eq!(BackupType::Bip32Root as u8, 2);
        assert_eq!(BackupType::Bip32Virgin as u8, 3);
    }

    #[test]
    fn too_few_lines_is_a_format_error() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let saw_format_error = AtomicBool::new(false);
        let callback = |prompt: RestorePrompt<'_>| {
            if matches!(prompt, RestorePrompt::FormatError) {
                saw_format_error.store(true, Ordering::SeqCst);
            }
            PromptReply::Reject
        };

        let dir = tempfile::TempDir::new().unwrap();
        let prompt: PassphrasePrompt =
            std::sync::Arc::new(|_: &[Vec<u8>]| Some(SecureBytes::from_slice(b"x")));
        let err = restore_from_backup(
            &["one line".to_string()],
            None,
            dir.path(),
            0,
            Some(0.01),
            &callback,
            prompt,
        )
        .unwrap_err();
        assert!(matches!(err, WalletError::InvalidArgument(_)));
        assert!(saw_format_error.load(Ordering::SeqCst));
    }
}
