//! Easy16 paper-backup lines: 16 payload bytes per line, a 2-byte checksum
//! that also encodes the backup kind, and a 16-letter alphabet chosen for
//! unambiguous handwriting.

use crate::crypto::hash::hash256;
use crate::crypto::SecureBytes;
use crate::error::{Result, WalletError};

/// Nibble alphabet, in value order 0..=15.
pub const EASY16_CHARS: [char; 16] =
    ['a', 's', 'd', 'f', 'g', 'h', 'j', 'k', 'w', 'e', 'r', 't', 'u', 'i', 'o', 'n'];

pub const LINE_PAYLOAD_LEN: usize = 16;
const CHECKSUM_LEN: usize = 2;

/// Kinds a checksum can encode, doubling as the hash hint byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackupType {
    /// Legacy chained-derivation root.
    Legacy = 0,
    /// BIP-32 seed restored into the standard account structure.
    Bip32Structured = 1,
    /// Raw BIP-32 root; restore refuses this kind.
    Bip32Root = 2,
    /// BIP-32 seed with no accounts instantiated yet.
    Bip32Virgin = 3,
}

impl BackupType {
    pub const ALL: [BackupType; 4] = [
        BackupType::Legacy,
        BackupType::Bip32Structured,
        BackupType::Bip32Root,
        BackupType::Bip32Virgin,
    ];

    pub fn from_index(index: u8) -> Option<BackupType> {
        BackupType::ALL.into_iter().find(|t| *t as u8 == index)
    }
}

/// `hash256(chunk ‖ type)`; a zero hint hashes the bare chunk.
fn typed_hash(chunk: &[u8], type_byte: u8) -> [u8; 32] {
    if type_byte == 0 {
        hash256(chunk)
    } else {
        let mut data = Vec::with_capacity(chunk.len() + 1);
        data.extend_from_slice(chunk);
        data.push(type_byte);
        hash256(&data)
    }
}

/// Match a chunk's checksum against each eligible type byte.
fn verify_checksum(chunk: &[u8], checksum: &[u8; CHECKSUM_LEN]) -> Option<BackupType> {
    BackupType::ALL
        .into_iter()
        .find(|candidate| typed_hash(chunk, *candidate as u8)[..CHECKSUM_LEN] == checksum[..])
}

fn push_byte(out: &mut String, byte: u8) {
    out.push(EASY16_CHARS[(byte >> 4) as usize]);
    out.push(EASY16_CHARS[(byte & 0x0F) as usize]);
}

fn char_value(c: char) -> Option<u8> {
    EASY16_CHARS.iter().position(|&e| e == c).map(|v| v as u8)
}

/// Encode a payload into Easy16 lines of 16 bytes each (the last line may
/// be short), spaced for reading aloud.
pub fn encode(data: &[u8], backup_type: BackupType) -> Vec<String> {
    data.chunks(LINE_PAYLOAD_LEN)
        .map(|chunk| {
            let mut line = String::new();
            for (i, &byte) in chunk.iter().enumerate() {
                push_byte(&mut line, byte);
                let count = i + 1;
                if count % 2 == 0 {
                    line.push(' ');
                }
                if count % 8 == 0 {
                    line.push(' ');
                }
            }
            let digest = typed_hash(chunk, backup_type as u8);
            for &byte in &digest[..CHECKSUM_LEN] {
                push_byte(&mut line, byte);
            }
            line
        })
        .collect()
}

/// One decoded line: its payload bytes, raw checksum, and the type the
/// checksum matched (`None` on checksum error).
#[derive(Debug)]
pub struct DecodedBackup {
    pub data: SecureBytes,
    pub checksums: Vec<[u8; CHECKSUM_LEN]>,
    pub checksum_results: Vec<Option<BackupType>>,
    /// Filled by [`repair`]; one entry per line once repair succeeds.
    pub repaired_results: Vec<BackupType>,
}

impl DecodedBackup {
    pub fn line_count(&self) -> usize {
        self.checksum_results.len()
    }

    pub fn has_errors(&self) -> bool {
        self.checksum_results.iter().any(|r| r.is_none())
    }

    /// The single type every line agreed on, if any.
    pub fn uniform_type(&self) -> Option<BackupType> {
        let first = self.checksum_results.first().copied().flatten()?;
        self.checksum_results
            .iter()
            .all(|r| *r == Some(first))
            .then_some(first)
    }

    fn line_payload(&self, line: usize) -> &[u8] {
        let start = line * LINE_PAYLOAD_LEN;
        let end = ((line + 1) * LINE_PAYLOAD_LEN).min(self.data.len());
        &self.data.as_slice()[start..end]
    }
}

/// Decode Easy16 lines. Spaces are skipped; characters outside the
/// alphabet contribute zero nibbles and surface as checksum errors.
pub fn decode(lines: &[impl AsRef<str>]) -> Result<DecodedBackup> {
    if lines.is_empty() {
        return Err(WalletError::InvalidArgument("empty easy16 backup".into()));
    }

    let mut data = Vec::with_capacity(lines.len() * LINE_PAYLOAD_LEN);
    let mut checksums = Vec::with_capacity(lines.len());
    let mut checksum_results = Vec::with_capacity(lines.len());

    for (line_index, line) in lines.iter().enumerate() {
        let compact: Vec<char> =
            line.as_ref().chars().filter(|c| !c.is_whitespace()).collect();
        if compact.len() < CHECKSUM_LEN * 2 || compact.len() % 2 != 0 {
            return Err(WalletError::InvalidArgument(format!(
                "easy16 line {line_index} has a bad length"
            )));
        }

        let byte_count = compact.len() / 2 - CHECKSUM_LEN;
        if byte_count > LINE_PAYLOAD_LEN {
            return Err(WalletError::InvalidArgument(format!(
                "easy16 line {line_index} is too long"
            )));
        }
        if byte_count < LINE_PAYLOAD_LEN && line_index != lines.len() - 1 {
            return Err(WalletError::InvalidArgument(format!(
                "easy16 line {line_index} is too short"
            )));
        }

        let decode_pair = |pair: &[char]| -> u8 {
            let high = char_value(pair[0]).unwrap_or(0);
            let low = char_value(pair[1]).unwrap_or(0);
            (high << 4) | low
        };

        let mut payload = Vec::with_capacity(byte_count);
        for pair in compact[..byte_count * 2].chunks(2) {
            payload.push(decode_pair(pair));
        }
        let mut checksum = [0u8; CHECKSUM_LEN];
        for (slot, pair) in checksum.iter_mut().zip(compact[byte_count * 2..].chunks(2)) {
            *slot = decode_pair(pair);
        }

        checksum_results.push(verify_checksum(&payload, &checksum));
        checksums.push(checksum);
        data.extend_from_slice(&payload);
    }

    Ok(DecodedBackup {
        data: SecureBytes::new(data),
        checksums,
        checksum_results,
        repaired_results: Vec::new(),
    })
}

/// All single-byte corrections of `chunk` that satisfy `checksum` under
/// `type_byte`: `(position, value)` pairs.
fn search_checksum(
    chunk: &[u8],
    checksum: &[u8; CHECKSUM_LEN],
    type_byte: u8,
) -> Vec<(usize, u8)> {
    let mut hits = Vec::new();
    let mut scratch = chunk.to_vec();
    for position in 0..chunk.len() {
        let original = scratch[position];
        for candidate in 0..=255u8 {
            if candidate == original {
                continue;
            }
            scratch[position] = candidate;
            if typed_hash(&scratch, type_byte)[..CHECKSUM_LEN] == checksum[..] {
                hits.push((position, candidate));
            }
        }
        scratch[position] = original;
    }
    hits
}

/// Attempt single-byte repair of a faulty decode.
///
/// With at least one good line, its type pins the search; every faulty
/// line must then admit exactly one correction. With no good line, a type
/// is accepted only if it yields a unique correction for every line.
/// Ambiguity refuses rather than guessing.
pub fn repair(backup: &mut DecodedBackup) -> Result<()> {
    if backup.data.is_empty() || backup.checksums.len() != backup.checksum_results.len() {
        return Err(WalletError::InvalidArgument("malformed decode result".into()));
    }

    let known_types: Vec<BackupType> =
        backup.checksum_results.iter().flatten().copied().collect();
    let distinct: std::collections::BTreeSet<BackupType> =
        known_types.iter().copied().collect();

    if distinct.len() > 1 {
        return Err(WalletError::IntegrityFailure(
            "lines disagree on the backup type".into(),
        ));
    }

    if !backup.has_errors() {
        backup.repaired_results =
            backup.checksum_results.iter().map(|r| r.unwrap()).collect();
        return Ok(());
    }

    if let Some(&hint) = distinct.iter().next() {
        // one line vouches for the type; fix the rest under it
        let mut fixes: Vec<(usize, usize, u8)> = Vec::new();
        for line in 0..backup.line_count() {
            if backup.checksum_results[line].is_some() {
                continue;
            }
            let hits = search_checksum(
                backup.line_payload(line),
                &backup.checksums[line],
                hint as u8,
            );
            if hits.len() != 1 {
                return Err(WalletError::ResourceExhausted(format!(
                    "line {line} admits {} corrections",
                    hits.len()
                )));
            }
            fixes.push((line, hits[0].0, hits[0].1));
        }
        for (line, position, value) in fixes {
            backup.data.as_mut_slice()[line * LINE_PAYLOAD_LEN + position] = value;
        }
        backup.repaired_results = vec![hint; backup.line_count()];
        return Ok(());
    }

    // no line survived: search every type over every line, and demand a
    // single type that repairs all of them unambiguously
    let mut viable: Vec<(BackupType, Vec<(usize, u8)>)> = Vec::new();
    'types: for candidate in BackupType::ALL {
        let mut fixes = Vec::with_capacity(backup.line_count());
        for line in 0..backup.line_count() {
            let hits = search_checksum(
                backup.line_payload(line),
                &backup.checksums[line],
                candidate as u8,
            );
            if hits.len() != 1 {
                continue 'types;
            }
            fixes.push(hits[0]);
        }
        viable.push((candidate, fixes));
    }

    if viable.len() != 1 {
        return Err(WalletError::ResourceExhausted(format!(
            "{} backup types could repair these lines",
            viable.len()
        )));
    }

    let (repaired_type, fixes) = viable.into_iter().next().unwrap();
    for (line, (position, value)) in fixes.into_iter().enumerate() {
        backup.data.as_mut_slice()[line * LINE_PAYLOAD_LEN + position] = value;
    }
    backup.repaired_results = vec![repaired_type; backup.line_count()];
    Ok(())
}
