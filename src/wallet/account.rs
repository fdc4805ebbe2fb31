//! Address accounts: an ordered set of assets, the address types a policy
//! admits for them, and the reverse `script-hash → asset` index the rest of
//! the system resolves through.

use std::collections::{BTreeMap, BTreeSet};

use crate::crypto::hash::{hash160, sha256};
use crate::encode::{ByteReader, ByteWriter};
use crate::error::{Result, WalletError};
use crate::store::header::PREFIX_ADDRESS_ACCOUNT;
use crate::wallet::asset::{AssetEntry, AssetId};

pub const ACCOUNT_VERSION: u32 = 1;

/// Admissible output-script shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressType {
    P2PKH,
    P2SH,
    P2WPKH,
    P2WSH,
    /// P2WPKH program nested inside P2SH.
    NestedP2WPKH,
    Multisig,
    NonStandard,
}

impl AddressType {
    fn to_byte(self) -> u8 {
        match self {
            AddressType::P2PKH => 0x01,
            AddressType::P2SH => 0x02,
            AddressType::P2WPKH => 0x03,
            AddressType::P2WSH => 0x04,
            AddressType::NestedP2WPKH => 0x05,
            AddressType::Multisig => 0x06,
            AddressType::NonStandard => 0x07,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        Ok(match byte {
            0x01 => AddressType::P2PKH,
            0x02 => AddressType::P2SH,
            0x03 => AddressType::P2WPKH,
            0x04 => AddressType::P2WSH,
            0x05 => AddressType::NestedP2WPKH,
            0x06 => AddressType::Multisig,
            0x07 => AddressType::NonStandard,
            other => {
                return Err(WalletError::InvalidArgument(format!(
                    "unknown address type {other:#x}"
                )))
            }
        })
    }
}

/// Classify an output script. Unknown shapes map to `NonStandard` rather
/// than failing.
pub fn classify_script(script: &[u8]) -> (AddressType, Vec<u8>) {
    match script {
        // OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
        [0x76, 0xA9, 0x14, hash @ .., 0x88, 0xAC] if hash.len() == 20 => {
            (AddressType::P2PKH, hash.to_vec())
        }
        // OP_HASH160 <20> OP_EQUAL
        [0xA9, 0x14, hash @ .., 0x87] if hash.len() == 20 => (AddressType::P2SH, hash.to_vec()),
        // OP_0 <20>
        [0x00, 0x14, hash @ ..] if hash.len() == 20 => (AddressType::P2WPKH, hash.to_vec()),
        // OP_0 <32>
        [0x00, 0x20, hash @ ..] if hash.len() == 32 => (AddressType::P2WSH, hash.to_vec()),
        // <33|65 byte pubkey> OP_CHECKSIG
        [0x21, pubkey @ .., 0xAC] if pubkey.len() == 33 => {
            (AddressType::P2PKH, hash160(pubkey).to_vec())
        }
        [0x41, pubkey @ .., 0xAC] if pubkey.len() == 65 => {
            (AddressType::P2PKH, hash160(pubkey).to_vec())
        }
        other => (AddressType::NonStandard, hash160(other).to_vec()),
    }
}

/// Script-hash derivations for one public key.
fn script_hashes_for(pubkey: &[u8], address_type: AddressType) -> Option<Vec<u8>> {
    match address_type {
        AddressType::P2PKH | AddressType::P2WPKH => Some(hash160(pubkey).to_vec()),
        AddressType::NestedP2WPKH => {
            let mut program = Vec::with_capacity(22);
            program.push(0x00);
            program.push(0x14);
            program.extend_from_slice(&hash160(pubkey));
            Some(hash160(&program).to_vec())
        }
        AddressType::P2WSH => {
            // single-key witness script: <pubkey> OP_CHECKSIG
            let mut witness_script = Vec::with_capacity(35);
            witness_script.push(pubkey.len() as u8);
            witness_script.extend_from_slice(pubkey);
            witness_script.push(0xAC);
            Some(sha256(&witness_script).to_vec())
        }
        AddressType::P2SH | AddressType::Multisig | AddressType::NonStandard => None,
    }
}

/// Chain-use counters for the account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainIndices {
    pub main: u32,
    pub outer: u32,
    pub change: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountPolicy {
    pub address_types: BTreeSet<AddressType>,
}

impl AccountPolicy {
    pub fn new(address_types: impl IntoIterator<Item = AddressType>) -> Self {
        AccountPolicy { address_types: address_types.into_iter().collect() }
    }
}

pub struct AddressAccount {
    pub account_id: [u8; 4],
    pub policy: AccountPolicy,
    pub indices: ChainIndices,
    asset_ids: Vec<AssetId>,
    /// (script hash, address type) → asset id
    reverse: BTreeMap<(Vec<u8>, AddressType), AssetId>,
    /// asset id → compressed pubkey, for the rare-path linear resolver
    pubkeys: BTreeMap<AssetId, Vec<u8>>,
}

impl AddressAccount {
    pub fn new(account_id: [u8; 4], policy: AccountPolicy) -> Self {
        AddressAccount {
            account_id,
            policy,
            indices: ChainIndices::default(),
            asset_ids: Vec::new(),
            reverse: BTreeMap::new(),
            pubkeys: BTreeMap::new(),
        }
    }

    pub fn asset_ids(&self) -> &[AssetId] {
        &self.asset_ids
    }

    /// Register an asset: instantiate every admissible address type and
    /// populate the reverse index.
    pub fn add_asset(&mut self, entry: &AssetEntry) -> Result<()> {
        let Some(single) = entry.single() else {
            return Err(WalletError::InvalidArgument(
                "only key-bearing assets can join an address account".into(),
            ));
        };
        if single.id.account_id != self.account_id {
            return Err(WalletError::Conflict("asset belongs to another account".into()));
        }
        if self.pubkeys.contains_key(&single.id) {
            return Err(WalletError::Conflict(format!(
                "duplicate asset id {:?}",
                single.id
            )));
        }

        let pubkey = single.pubkey.compressed()?;
        for &address_type in &self.policy.address_types {
            if let Some(script_hash) = script_hashes_for(&pubkey, address_type) {
                self.reverse.insert((script_hash, address_type), single.id.clone());
            }
        }
        self.pubkeys.insert(single.id.clone(), pubkey);
        self.asset_ids.push(single.id.clone());
        Ok(())
    }

    /// Primary resolver surface: script hash plus its classified type.
    pub fn resolve_script_hash(
        &self,
        script_hash: &[u8],
        address_type: AddressType,
    ) -> Option<(AssetId, AddressType)> {
        self.reverse
            .get(&(script_hash.to_vec(), address_type))
            .map(|id| (id.clone(), address_type))
    }

    /// Resolve a bare public key. Tries the hash160 index first, then falls
    /// back to a linear scan (exotic scripts only hit the slow path).
    pub fn resolve_pubkey(&self, pubkey: &[u8]) -> Option<AssetId> {
        let digest = hash160(pubkey).to_vec();
        for address_type in [AddressType::P2PKH, AddressType::P2WPKH] {
            if let Some((id, _)) = self.resolve_script_hash(&digest, address_type) {
                return Some(id);
            }
        }

        self.pubkeys
            .iter()
            .find(|(_, stored)| stored.as_slice() == pubkey)
            .map(|(id, _)| id.clone())
    }

    pub fn data_key(account_id: &[u8; 4]) -> Vec<u8> {
        let mut key = Vec::with_capacity(5);
        key.push(PREFIX_ADDRESS_ACCOUNT);
        key.extend_from_slice(account_id);
        key
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_u32_le(ACCOUNT_VERSION);
        writer.put_bytes(&self.account_id);
        writer.put_var_int(self.policy.address_types.len() as u64);
        for address_type in &self.policy.address_types {
            writer.put_u8(address_type.to_byte());
        }
        writer.put_u32_le(self.indices.main);
        writer.put_u32_le(self.indices.outer);
        writer.put_u32_le(self.indices.change);
        writer.put_var_int(self.asset_ids.len() as u64);
        for id in &self.asset_ids {
            writer.put_bytes(&id.account_id);
            writer.put_u32_be(id.index);
        }
        writer.into_vec()
    }

    /// Rebuild from its record plus the asset entries it references; the
    /// reverse index is derived, never stored.
    pub fn deserialize(
        value: &[u8],
        assets: &BTreeMap<AssetId, AssetEntry>,
    ) -> Result<AddressAccount> {
        let mut reader = ByteReader::new(value);
        let version = reader.get_u32_le()?;
        if version != ACCOUNT_VERSION {
            return Err(WalletError::Unsupported(format!("account version {version}")));
        }

        let account_id: [u8; 4] = reader.get_bytes(4)?.try_into().unwrap();
        let type_count = reader.get_var_int()?;
        let mut address_types = BTreeSet::new();
        for _ in 0..type_count {
            address_types.insert(AddressType::from_byte(reader.get_u8()?)?);
        }
        let indices = ChainIndices {
            main: reader.get_u32_le()?,
            outer: reader.get_u32_le()?,
            change: reader.get_u32_le()?,
        };

        let mut account = AddressAccount::new(account_id, AccountPolicy { address_types });
        account.indices = indices;

        let asset_count = reader.get_var_int()?;
        for _ in 0..asset_count {
            let member_account: [u8; 4] = reader.get_bytes(4)?.try_into().unwrap();
            let index = reader.get_u32_be()?;
            let id = AssetId::new(member_account, index);
            let entry = assets.get(&id).ok_or_else(|| {
                WalletError::NotFound(format!("account references missing asset {id:?}"))
            })?;
            account.add_asset(entry)?;
        }

        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::secp::{generate_privkey, pubkey_from_privkey};
    use crate::wallet::asset::{AssetPublicKey, AssetSingle};

    fn asset(account: [u8; 4], index: u32) -> AssetEntry {
        let privkey = generate_privkey();
        let compressed = pubkey_from_privkey(privkey.as_slice(), true).unwrap();
        AssetEntry::Single(AssetSingle {
            id: AssetId::new(account, index),
            pubkey: AssetPublicKey::from_compressed(compressed).unwrap(),
            privkey: None,
        })
    }

    fn policy() -> AccountPolicy {
        AccountPolicy::new([AddressType::P2PKH, AddressType::P2WPKH, AddressType::NestedP2WPKH])
    }

    const ACCT: [u8; 4] = [0, 0, 0, 1];

    #[test]
    fn classify_standard_scripts() {
        let mut p2pkh = vec![0x76, 0xA9, 0x14];
        p2pkh.extend_from_slice(&[0xAB; 20]);
        p2pkh.extend_from_slice(&[0x88, 0xAC]);
        assert_eq!(classify_script(&p2pkh), (AddressType::P2PKH, vec![0xAB; 20]));

        let mut p2wsh = vec![0x00, 0x20];
        p2wsh.extend_from_slice(&[0xCD; 32]);
        assert_eq!(classify_script(&p2wsh), (AddressType::P2WSH, vec![0xCD; 32]));

        let (kind, _) = classify_script(&[0x6A, 0x04, 1, 2, 3, 4]);
        assert_eq!(kind, AddressType::NonStandard);
    }

    #[test]
    fn every_admissible_type_is_indexed() {
        let entry = asset(ACCT, 0);
        let mut account = AddressAccount::new(ACCT, policy());
        account.add_asset(&entry).unwrap();

        let pubkey = entry.single().unwrap().pubkey.compressed().unwrap();
        let digest = hash160(&pubkey).to_vec();

        assert!(account.resolve_script_hash(&digest, AddressType::P2PKH).is_some());
        assert!(account.resolve_script_hash(&digest, AddressType::P2WPKH).is_some());
        // nested hash differs from the bare key hash
        assert!(account.resolve_script_hash(&digest, AddressType::NestedP2WPKH).is_none());
    }

    #[test]
    fn pubkey_resolver_fast_and_slow_paths() {
        let entry = asset(ACCT, 3);
        let mut account = AddressAccount::new(ACCT, AccountPolicy::new([AddressType::P2WSH]));
        account.add_asset(&entry).unwrap();

        let pubkey = entry.single().unwrap().pubkey.compressed().unwrap();
        // policy has no hash160-indexed type, so this exercises the
        // linear fallback
        assert_eq!(account.resolve_pubkey(&pubkey), Some(entry.id().clone()));
        assert_eq!(account.resolve_pubkey(&[0x02; 33]), None);
    }

    #[test]
    fn duplicate_asset_conflicts() {
        let entry = asset(ACCT, 0);
        let mut account = AddressAccount::new(ACCT, policy());
        account.add_asset(&entry).unwrap();
        assert!(matches!(account.add_asset(&entry).unwrap_err(), WalletError::Conflict(_)));
    }

    #[test]
    fn foreign_account_asset_rejected() {
        let entry = asset([9, 9, 9, 9], 0);
        let mut account = AddressAccount::new(ACCT, policy());
        assert!(matches!(account.add_asset(&entry).unwrap_err(), WalletError::Conflict(_)));
    }

    #[test]
    fn serialization_rebuilds_reverse_index() {
        let mut assets = BTreeMap::new();
        let mut account = AddressAccount::new(ACCT, policy());
        for index in 0..4 {
            let entry = asset(ACCT, index);
            account.add_asset(&entry).unwrap();
            assets.insert(entry.id().clone(), entry);
        }
        account.indices = ChainIndices { main: 1, outer: 3, change: 2 };

        let rebuilt = AddressAccount::deserialize(&account.serialize(), &assets).unwrap();
        assert_eq!(rebuilt.indices, account.indices);
        assert_eq!(rebuilt.asset_ids(), account.asset_ids());
        assert_eq!(rebuilt.reverse, account.reverse);
    }
}
