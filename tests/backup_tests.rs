//! Paper-backup codec: Easy16 lines, single-byte repair, SecurePrint, and
//! the full backup/restore loop.

use std::sync::Arc;

use proptest::prelude::*;
use tempfile::TempDir;

use bitarmor::backup::{
    self, decode, encode, get_wallet_backup, repair, restore_from_backup, BackupType,
    PromptReply, RestorePrompt,
};
use bitarmor::crypto::SecureBytes;
use bitarmor::error::WalletError;
use bitarmor::wallet::container::PassphrasePrompt;
use bitarmor::wallet::{CreateParams, Wallet};

const PASSPHRASE: &[u8] = b"wallet pass";
const CONTROL: &[u8] = b"control pass";

fn wallet_prompt() -> PassphrasePrompt {
    Arc::new(|_ids: &[Vec<u8>]| Some(SecureBytes::from_slice(PASSPHRASE)))
}

fn fast_params<'a>() -> CreateParams<'a> {
    let mut params = CreateParams::new(PASSPHRASE, CONTROL);
    params.lookup = 3;
    params.kdf_target_secs = Some(0.01);
    params
}

fn accepting_callback(prompt: RestorePrompt<'_>) -> PromptReply {
    match prompt {
        RestorePrompt::Id { .. } => PromptReply::Accept,
        RestorePrompt::Passphrase => PromptReply::Passphrase(SecureBytes::from_slice(PASSPHRASE)),
        RestorePrompt::Control => PromptReply::Passphrase(SecureBytes::from_slice(CONTROL)),
        _ => PromptReply::Reject,
    }
}

// Scenario: encode 0x00..0x1f with type 0, corrupt byte 7 of line 1,
// repair must recover the payload and report type 0 for both lines.
#[test]
fn easy16_single_byte_repair() {
    let payload: Vec<u8> = (0u8..32).collect();
    let lines = encode(&payload, BackupType::Legacy);
    assert_eq!(lines.len(), 2);

    let mut decoded = decode(&lines).unwrap();
    decoded.data.as_mut_slice()[7] = 0xFF;
    decoded.checksum_results[0] = None;

    repair(&mut decoded).unwrap();
    assert_eq!(decoded.data.as_slice(), payload.as_slice());
    assert_eq!(decoded.repaired_results, vec![BackupType::Legacy; 2]);
}

#[test]
fn easy16_corrupted_character_repairs_in_place() {
    let payload: Vec<u8> = (0u8..32).collect();
    let lines = encode(&payload, BackupType::Bip32Structured);

    // corrupt one alphabet character on the page
    let mut damaged = lines.clone();
    damaged[1] = damaged[1].replacen('s', "o", 1);
    assert_ne!(damaged[1], lines[1]);

    let mut decoded = decode(&damaged).unwrap();
    assert!(decoded.has_errors());
    repair(&mut decoded).unwrap();
    assert_eq!(decoded.data.as_slice(), payload.as_slice());
}

#[test]
fn easy16_double_corruption_refused() {
    let payload: Vec<u8> = (0u8..32).collect();
    let lines = encode(&payload, BackupType::Legacy);
    let mut decoded = decode(&lines).unwrap();
    decoded.data.as_mut_slice()[3] ^= 0xFF;
    decoded.data.as_mut_slice()[9] ^= 0xFF;
    decoded.checksum_results[0] = None;

    assert!(repair(&mut decoded).is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn easy16_roundtrip(payload in proptest::collection::vec(any::<u8>(), 1..=16),
                        type_index in 0u8..4) {
        let backup_type = BackupType::from_index(type_index).unwrap();
        let lines = encode(&payload, backup_type);
        let decoded = decode(&lines).unwrap();
        prop_assert_eq!(decoded.data.as_slice(), payload.as_slice());
        prop_assert_eq!(decoded.uniform_type(), Some(backup_type));
    }
}

#[test]
fn secureprint_passphrase_checksum_invariant() {
    for filler in 0u8..8 {
        let root = vec![filler; 32];
        let passphrase = backup::secureprint::derive_passphrase(&root, None).unwrap();
        let decoded = bitarmor::encode::base58_decode(&passphrase).unwrap();
        assert_eq!(decoded.len(), 8);
        assert_eq!(bitarmor::crypto::hash256(&decoded[..7])[0], decoded[7]);
    }
}

#[test]
fn backup_restore_roundtrip_bip32() {
    let seed: Vec<u8> = (100u8..132).collect();
    let source_dir = TempDir::new().unwrap();
    let wallet = Wallet::create_from_seed_bip32(
        source_dir.path(),
        &seed,
        fast_params(),
        wallet_prompt(),
    )
    .unwrap();
    let original_id = wallet.wallet_id().to_string();

    let paper = get_wallet_backup(&wallet).unwrap();
    assert_eq!(paper.backup_type, BackupType::Bip32Structured);
    assert_eq!(paper.root_clear.len(), 2);
    assert_eq!(paper.root_encrypted.len(), 2);
    assert!(paper.chaincode_clear.is_none());

    // restore from the cleartext lines
    let restore_dir = TempDir::new().unwrap();
    let restored = restore_from_backup(
        &paper.root_clear,
        None,
        restore_dir.path(),
        3,
        Some(0.01),
        &accepting_callback,
        wallet_prompt(),
    )
    .unwrap();
    assert_eq!(restored.wallet_id(), original_id);

    // and again from the SecurePrint lines with the printed passphrase
    let encrypted_dir = TempDir::new().unwrap();
    let restored = restore_from_backup(
        &paper.root_encrypted,
        Some(&paper.secureprint_passphrase),
        encrypted_dir.path(),
        3,
        Some(0.01),
        &accepting_callback,
        wallet_prompt(),
    )
    .unwrap();
    assert_eq!(restored.wallet_id(), original_id);
}

#[test]
fn backup_restore_roundtrip_legacy_with_chaincode() {
    let root: Vec<u8> = (1u8..33).collect();
    let chaincode = vec![0xC4; 32];

    let source_dir = TempDir::new().unwrap();
    let wallet = Wallet::create_from_legacy_root(
        source_dir.path(),
        &root,
        Some(&chaincode),
        fast_params(),
        wallet_prompt(),
    )
    .unwrap();
    let original_id = wallet.wallet_id().to_string();

    let paper = get_wallet_backup(&wallet).unwrap();
    assert_eq!(paper.backup_type, BackupType::Legacy);
    // the chaincode is not the deterministic one, so it rides along
    let chaincode_lines = paper.chaincode_clear.clone().unwrap();
    assert_eq!(chaincode_lines.len(), 2);

    let mut lines = paper.root_clear.clone();
    lines.extend(chaincode_lines);

    let restore_dir = TempDir::new().unwrap();
    let restored = restore_from_backup(
        &lines,
        None,
        restore_dir.path(),
        3,
        Some(0.01),
        &accepting_callback,
        wallet_prompt(),
    )
    .unwrap();
    assert_eq!(restored.wallet_id(), original_id);
}

#[test]
fn legacy_deterministic_chaincode_omitted_from_backup() {
    let root: Vec<u8> = (7u8..39).collect();
    let dir = TempDir::new().unwrap();
    let wallet = Wallet::create_from_legacy_root(
        dir.path(),
        &root,
        None,
        fast_params(),
        wallet_prompt(),
    )
    .unwrap();

    let paper = get_wallet_backup(&wallet).unwrap();
    assert!(paper.chaincode_clear.is_none());
    assert!(paper.chaincode_encrypted.is_none());
}

#[test]
fn restore_rejects_wrong_secureprint_passphrase() {
    let seed: Vec<u8> = (50u8..82).collect();
    let dir = TempDir::new().unwrap();
    let wallet =
        Wallet::create_from_seed_bip32(dir.path(), &seed, fast_params(), wallet_prompt())
            .unwrap();
    let paper = get_wallet_backup(&wallet).unwrap();

    // corrupt the printed passphrase
    let mut chars: Vec<char> = paper.secureprint_passphrase.chars().collect();
    chars[0] = if chars[0] == '2' { '3' } else { '2' };
    let wrong: String = chars.into_iter().collect();

    use std::sync::atomic::{AtomicBool, Ordering};
    let saw_decrypt_error = AtomicBool::new(false);
    let callback = |prompt: RestorePrompt<'_>| {
        if matches!(prompt, RestorePrompt::DecryptError) {
            saw_decrypt_error.store(true, Ordering::SeqCst);
        }
        accepting_callback(prompt)
    };

    let restore_dir = TempDir::new().unwrap();
    let err = restore_from_backup(
        &paper.root_encrypted,
        Some(&wrong),
        restore_dir.path(),
        3,
        Some(0.01),
        &callback,
        wallet_prompt(),
    )
    .unwrap_err();
    assert!(matches!(err, WalletError::IntegrityFailure(_)));
    assert!(saw_decrypt_error.load(Ordering::SeqCst));
}

#[test]
fn restore_refuses_bip32_root_kind() {
    let payload: Vec<u8> = (10u8..42).collect();
    let lines = encode(&payload, BackupType::Bip32Root);

    use std::sync::atomic::{AtomicBool, Ordering};
    let saw_type_error = AtomicBool::new(false);
    let callback = |prompt: RestorePrompt<'_>| {
        if matches!(prompt, RestorePrompt::TypeError) {
            saw_type_error.store(true, Ordering::SeqCst);
        }
        accepting_callback(prompt)
    };

    let dir = TempDir::new().unwrap();
    let err = restore_from_backup(
        &lines,
        None,
        dir.path(),
        3,
        Some(0.01),
        &callback,
        wallet_prompt(),
    )
    .unwrap_err();
    assert!(matches!(err, WalletError::Unsupported(_)));
    assert!(saw_type_error.load(Ordering::SeqCst));
}

#[test]
fn restore_honors_id_rejection() {
    let payload: Vec<u8> = (60u8..92).collect();
    let lines = encode(&payload, BackupType::Bip32Structured);

    let callback = |prompt: RestorePrompt<'_>| match prompt {
        RestorePrompt::Id { .. } => PromptReply::Reject,
        other => accepting_callback(other),
    };

    let dir = TempDir::new().unwrap();
    let err = restore_from_backup(
        &lines,
        None,
        dir.path(),
        3,
        Some(0.01),
        &callback,
        wallet_prompt(),
    )
    .unwrap_err();
    assert!(matches!(err, WalletError::PermissionDenied(_)));
}
