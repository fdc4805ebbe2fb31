//! Indexed metadata records: comments, authorised peers, peer root keys and
//! root signatures. Each subtype owns a key prefix byte; the record key is
//! always `prefix ‖ account_id(4) ‖ index(u32 BE)`.
//!
//! Serializing to an empty byte string marks the record for deletion on
//! commit.

use std::collections::BTreeSet;

use crate::crypto::secp::check_pubkey;
use crate::encode::{ByteReader, ByteWriter};
use crate::error::{Result, WalletError};
use crate::store::header::{
    PREFIX_META_AUTHPEER, PREFIX_META_COMMENT, PREFIX_META_PEER_ROOT, PREFIX_META_ROOT_SIG,
};

pub const METADATA_VERSION: u32 = 1;

const META_KEY_LEN: usize = 9;

/// Address of one metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MetaKey {
    pub account_id: [u8; 4],
    pub index: u32,
}

impl MetaKey {
    pub fn new(account_id: [u8; 4], index: u32) -> Self {
        MetaKey { account_id, index }
    }

    fn data_key(&self, prefix: u8) -> Vec<u8> {
        let mut key = Vec::with_capacity(META_KEY_LEN);
        key.push(prefix);
        key.extend_from_slice(&self.account_id);
        key.extend_from_slice(&self.index.to_be_bytes());
        key
    }

    fn parse(key: &[u8], expected_prefix: u8) -> Result<Self> {
        if key.len() != META_KEY_LEN || key[0] != expected_prefix {
            return Err(WalletError::InvalidArgument("invalid metadata key".into()));
        }
        Ok(MetaKey {
            account_id: key[1..5].try_into().unwrap(),
            index: u32::from_be_bytes(key[5..9].try_into().unwrap()),
        })
    }
}

fn frame(body: ByteWriter) -> Vec<u8> {
    let mut framed = ByteWriter::with_capacity(body.len() + 5);
    framed.put_var_bytes(body.as_slice());
    framed.into_vec()
}

fn unframe(value: &[u8]) -> Result<ByteReader<'_>> {
    let mut outer = ByteReader::new(value);
    let body = outer.get_var_bytes()?;
    if !outer.is_exhausted() {
        return Err(WalletError::InvalidArgument("trailing bytes in metadata record".into()));
    }
    let mut reader = ByteReader::new(body);
    let version = reader.get_u32_le()?;
    if version != METADATA_VERSION {
        return Err(WalletError::Unsupported(format!("metadata version {version}")));
    }
    Ok(reader)
}

/// Free-text comment attached to an arbitrary wallet key (address, tx hash).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentData {
    pub key: MetaKey,
    pub target: Vec<u8>,
    pub comment: String,
}

impl CommentData {
    pub fn data_key(&self) -> Vec<u8> {
        self.key.data_key(PREFIX_META_COMMENT)
    }

    pub fn serialize(&self) -> Vec<u8> {
        if self.comment.is_empty() {
            return Vec::new();
        }
        let mut body = ByteWriter::new();
        body.put_u32_le(METADATA_VERSION);
        body.put_var_bytes(&self.target);
        body.put_var_bytes(self.comment.as_bytes());
        frame(body)
    }

    pub fn deserialize(key: &[u8], value: &[u8]) -> Result<Self> {
        let meta_key = MetaKey::parse(key, PREFIX_META_COMMENT)?;
        let mut reader = unframe(value)?;
        let target = reader.get_var_bytes()?.to_vec();
        let comment = String::from_utf8(reader.get_var_bytes()?.to_vec())
            .map_err(|_| WalletError::InvalidArgument("comment is not utf-8".into()))?;
        Ok(CommentData { key: meta_key, target, comment })
    }
}

/// A peer authorised to connect: its identity pubkey and the names it may
/// present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPublicData {
    pub key: MetaKey,
    pub public_key: Vec<u8>,
    pub names: BTreeSet<String>,
}

impl PeerPublicData {
    pub fn data_key(&self) -> Vec<u8> {
        self.key.data_key(PREFIX_META_AUTHPEER)
    }

    pub fn serialize(&self) -> Vec<u8> {
        if self.names.is_empty() {
            return Vec::new();
        }
        let mut body = ByteWriter::new();
        body.put_u32_le(METADATA_VERSION);
        body.put_var_bytes(&self.public_key);
        body.put_var_int(self.names.len() as u64);
        for name in &self.names {
            body.put_var_bytes(name.as_bytes());
        }
        frame(body)
    }

    pub fn deserialize(key: &[u8], value: &[u8]) -> Result<Self> {
        let meta_key = MetaKey::parse(key, PREFIX_META_AUTHPEER)?;
        let mut reader = unframe(value)?;
        let public_key = reader.get_var_bytes()?.to_vec();
        if !check_pubkey(&public_key) {
            return Err(WalletError::InvalidArgument("invalid peer pubkey".into()));
        }
        let count = reader.get_var_int()?;
        let mut names = BTreeSet::new();
        for _ in 0..count {
            let name = String::from_utf8(reader.get_var_bytes()?.to_vec())
                .map_err(|_| WalletError::InvalidArgument("peer name is not utf-8".into()))?;
            names.insert(name);
        }
        Ok(PeerPublicData { key: meta_key, public_key, names })
    }
}

/// Root key a peer's identity chain descends from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRootKey {
    pub key: MetaKey,
    pub public_key: Vec<u8>,
    pub description: String,
}

impl PeerRootKey {
    pub fn data_key(&self) -> Vec<u8> {
        self.key.data_key(PREFIX_META_PEER_ROOT)
    }

    pub fn serialize(&self) -> Vec<u8> {
        if self.public_key.is_empty() {
            return Vec::new();
        }
        let mut body = ByteWriter::new();
        body.put_u32_le(METADATA_VERSION);
        body.put_var_bytes(&self.public_key);
        body.put_var_bytes(self.description.as_bytes());
        frame(body)
    }

    pub fn deserialize(key: &[u8], value: &[u8]) -> Result<Self> {
        let meta_key = MetaKey::parse(key, PREFIX_META_PEER_ROOT)?;
        let mut reader = unframe(value)?;
        let public_key = reader.get_var_bytes()?.to_vec();
        if !check_pubkey(&public_key) {
            return Err(WalletError::InvalidArgument("invalid peer root pubkey".into()));
        }
        let description = String::from_utf8(reader.get_var_bytes()?.to_vec())
            .map_err(|_| WalletError::InvalidArgument("description is not utf-8".into()))?;
        Ok(PeerRootKey { key: meta_key, public_key, description })
    }
}

/// Signature binding our identity key to a peer root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRootSignature {
    pub key: MetaKey,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl PeerRootSignature {
    pub fn data_key(&self) -> Vec<u8> {
        self.key.data_key(PREFIX_META_ROOT_SIG)
    }

    pub fn serialize(&self) -> Vec<u8> {
        if self.public_key.is_empty() {
            return Vec::new();
        }
        let mut body = ByteWriter::new();
        body.put_u32_le(METADATA_VERSION);
        body.put_var_bytes(&self.public_key);
        body.put_var_bytes(&self.signature);
        frame(body)
    }

    pub fn deserialize(key: &[u8], value: &[u8]) -> Result<Self> {
        let meta_key = MetaKey::parse(key, PREFIX_META_ROOT_SIG)?;
        let mut reader = unframe(value)?;
        let public_key = reader.get_var_bytes()?.to_vec();
        if !check_pubkey(&public_key) {
            return Err(WalletError::InvalidArgument("invalid signer pubkey".into()));
        }
        // signature validity is checked once the full peer account is loaded
        let signature = reader.get_var_bytes()?.to_vec();
        Ok(PeerRootSignature { key: meta_key, public_key, signature })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::secp::{generate_privkey, pubkey_from_privkey};

    fn pubkey() -> Vec<u8> {
        pubkey_from_privkey(generate_privkey().as_slice(), true).unwrap()
    }

    #[test]
    fn comment_roundtrip_and_delete_marker() {
        let comment = CommentData {
            key: MetaKey::new([0, 0, 0, 1], 4),
            target: vec![0xAA; 20],
            comment: "coffee money".into(),
        };
        let decoded =
            CommentData::deserialize(&comment.data_key(), &comment.serialize()).unwrap();
        assert_eq!(decoded, comment);

        let empty = CommentData { comment: String::new(), ..comment };
        assert!(empty.serialize().is_empty());
    }

    #[test]
    fn auth_peer_roundtrip() {
        let peer = PeerPublicData {
            key: MetaKey::new([0, 0, 0, 2], 0),
            public_key: pubkey(),
            names: ["node.example.org".to_string(), "backup.example.org".to_string()]
                .into_iter()
                .collect(),
        };
        let decoded =
            PeerPublicData::deserialize(&peer.data_key(), &peer.serialize()).unwrap();
        assert_eq!(decoded, peer);
    }

    #[test]
    fn auth_peer_bad_pubkey_rejected() {
        let peer = PeerPublicData {
            key: MetaKey::new([0, 0, 0, 2], 0),
            public_key: vec![0xFF; 33],
            names: ["x".to_string()].into_iter().collect(),
        };
        assert!(PeerPublicData::deserialize(&peer.data_key(), &peer.serialize()).is_err());
    }

    #[test]
    fn peer_root_and_signature_roundtrip() {
        let root = PeerRootKey {
            key: MetaKey::new([0, 0, 0, 3], 1),
            public_key: pubkey(),
            description: "lab server".into(),
        };
        assert_eq!(PeerRootKey::deserialize(&root.data_key(), &root.serialize()).unwrap(), root);

        let sig = PeerRootSignature {
            key: MetaKey::new([0, 0, 0, 3], 2),
            public_key: pubkey(),
            signature: vec![0x55; 64],
        };
        assert_eq!(
            PeerRootSignature::deserialize(&sig.data_key(), &sig.serialize()).unwrap(),
            sig
        );
    }

    #[test]
    fn wrong_prefix_rejected() {
        let comment = CommentData {
            key: MetaKey::new([0, 0, 0, 1], 0),
            target: vec![],
            comment: "x".into(),
        };
        let serialized = comment.serialize();
        let err = PeerRootKey::deserialize(&comment.data_key(), &serialized).unwrap_err();
        assert!(matches!(err, WalletError::InvalidArgument(_)));
    }
}
