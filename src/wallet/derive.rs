//! Deterministic key derivation: BIP-32 nodes and the legacy single-chain
//! scheme that predates them.

use crate::config::Network;
use crate::crypto::hash::{hash160, hash256, hmac256, hmac512};
use crate::crypto::secp::{
    check_privkey, pubkey_from_privkey, pubkey_scalar_multiply, privkey_scalar_multiply,
};
use crate::crypto::SecureBytes;
use crate::encode::{base58check_decode, base58check_encode};
use crate::error::{Result, WalletError};

pub const HARDENED_FLAG: u32 = 0x8000_0000;
pub const CHAINCODE_LEN: usize = 32;

const BIP32_SEED_KEY: &[u8] = b"Bitcoin seed";
const XKEY_LEN: usize = 78;

/// One BIP-32 node: key material, chaincode and position in the tree.
#[derive(Debug)]
pub struct Bip32Node {
    privkey: Option<SecureBytes>,
    pubkey: Vec<u8>, // compressed
    chaincode: SecureBytes,
    depth: u8,
    child_num: u32,
    parent_fingerprint: u32,
}

impl Bip32Node {
    /// Master node from seed entropy.
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        if seed.is_empty() || seed.len() > 64 {
            return Err(WalletError::InvalidArgument("seed must be 1..=64 bytes".into()));
        }
        let stretched = hmac512(BIP32_SEED_KEY, seed);
        let privkey = &stretched[..32];
        if !check_privkey(privkey) {
            return Err(WalletError::InvalidArgument("seed produces invalid master key".into()));
        }
        Ok(Bip32Node {
            pubkey: pubkey_from_privkey(privkey, true)?,
            privkey: Some(SecureBytes::from_slice(privkey)),
            chaincode: SecureBytes::from_slice(&stretched[32..]),
            depth: 0,
            child_num: 0,
            parent_fingerprint: 0,
        })
    }

    pub fn from_privkey(
        depth: u8,
        child_num: u32,
        parent_fingerprint: u32,
        privkey: &[u8],
        chaincode: &[u8],
    ) -> Result<Self> {
        if !check_privkey(privkey) {
            return Err(WalletError::InvalidArgument("invalid private key".into()));
        }
        if chaincode.len() != CHAINCODE_LEN {
            return Err(WalletError::InvalidArgument("chaincode must be 32 bytes".into()));
        }
        Ok(Bip32Node {
            pubkey: pubkey_from_privkey(privkey, true)?,
            privkey: Some(SecureBytes::from_slice(privkey)),
            chaincode: SecureBytes::from_slice(chaincode),
            depth,
            child_num,
            parent_fingerprint,
        })
    }

    pub fn from_pubkey(
        depth: u8,
        child_num: u32,
        parent_fingerprint: u32,
        pubkey: &[u8],
        chaincode: &[u8],
    ) -> Result<Self> {
        if pubkey.len() != 33 {
            return Err(WalletError::InvalidArgument("pubkey must be compressed".into()));
        }
        if chaincode.len() != CHAINCODE_LEN {
            return Err(WalletError::InvalidArgument("chaincode must be 32 bytes".into()));
        }
        Ok(Bip32Node {
            privkey: None,
            pubkey: pubkey.to_vec(),
            chaincode: SecureBytes::from_slice(chaincode),
            depth,
            child_num,
            parent_fingerprint,
        })
    }

    pub fn is_public(&self) -> bool {
        self.privkey.is_none()
    }

    pub fn privkey(&self) -> Option<&SecureBytes> {
        self.privkey.as_ref()
    }

    pub fn pubkey(&self) -> &[u8] {
        &self.pubkey
    }

    pub fn chaincode(&self) -> &[u8] {
        self.chaincode.as_slice()
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn child_num(&self) -> u32 {
        self.child_num
    }

    pub fn parent_fingerprint(&self) -> u32 {
        self.parent_fingerprint
    }

    /// First 4 bytes of hash160 of this node's compressed pubkey.
    pub fn fingerprint(&self) -> u32 {
        let digest = hash160(&self.pubkey);
        u32::from_le_bytes(digest[..4].try_into().unwrap())
    }

    /// Strip the private key.
    pub fn neutered(&self) -> Result<Bip32Node> {
        Bip32Node::from_pubkey(
            self.depth,
            self.child_num,
            self.parent_fingerprint,
            &self.pubkey,
            self.chaincode.as_slice(),
        )
    }

    /// Private child derivation (hardened or not).
    pub fn derive_private(&self, index: u32) -> Result<Bip32Node> {
        let privkey = self.privkey.as_ref().ok_or_else(|| {
            WalletError::InvalidArgument("private derivation needs a private key".into())
        })?;

        let mut data = Vec::with_capacity(37);
        if index & HARDENED_FLAG != 0 {
            data.push(0x00);
            data.extend_from_slice(privkey.as_slice());
        } else {
            data.extend_from_slice(&self.pubkey);
        }
        data.extend_from_slice(&index.to_be_bytes());

        let stretched = hmac512(self.chaincode.as_slice(), &data);
        let tweak = &stretched[..32];

        let sk = secp256k1::SecretKey::from_slice(privkey.as_slice())?;
        let scalar: [u8; 32] = tweak.try_into().unwrap();
        let scalar = secp256k1::Scalar::from_be_bytes(scalar)
            .map_err(|_| WalletError::InvalidArgument("derivation tweak out of range".into()))?;
        let child = sk
            .add_tweak(&scalar)
            .map_err(|_| WalletError::InvalidArgument("derived key is invalid".into()))?;

        Bip32Node::from_privkey(
            self.depth + 1,
            index,
            self.fingerprint(),
            &child.secret_bytes(),
            &stretched[32..],
        )
    }

    /// Public child derivation. Hardened indices fail: the private key is
    /// required for those.
    pub fn derive_public(&self, index: u32) -> Result<Bip32Node> {
        if index & HARDENED_FLAG != 0 {
            return Err(WalletError::InvalidArgument(
                "hardened derivation requires the private key".into(),
            ));
        }

        let mut data = Vec::with_capacity(37);
        data.extend_from_slice(&self.pubkey);
        data.extend_from_slice(&index.to_be_bytes());

        let stretched = hmac512(self.chaincode.as_slice(), &data);
        let tweak: [u8; 32] = stretched[..32].try_into().unwrap();

        let pk = secp256k1::PublicKey::from_slice(&self.pubkey)?;
        let scalar = secp256k1::Scalar::from_be_bytes(tweak)
            .map_err(|_| WalletError::InvalidArgument("derivation tweak out of range".into()))?;
        let secp = secp256k1::Secp256k1::verification_only();
        let child = pk
            .add_exp_tweak(&secp, &scalar)
            .map_err(|_| WalletError::InvalidArgument("derived key is invalid".into()))?;

        Bip32Node::from_pubkey(
            self.depth + 1,
            index,
            self.fingerprint(),
            &child.serialize(),
            &stretched[32..],
        )
    }

    /// Walk a derivation path with private derivation.
    pub fn derive_path(&self, path: &[u32]) -> Result<Bip32Node> {
        let mut node = Bip32Node::from_privkey(
            self.depth,
            self.child_num,
            self.parent_fingerprint,
            self.privkey
                .as_ref()
                .ok_or_else(|| {
                    WalletError::InvalidArgument("private derivation needs a private key".into())
                })?
                .as_slice(),
            self.chaincode.as_slice(),
        )?;
        for &step in path {
            node = node.derive_private(step)?;
        }
        Ok(node)
    }

    /// 78-byte base58check serialization, version bytes per network.
    pub fn encode_base58(&self, network: Network) -> Result<String> {
        let mut record = Vec::with_capacity(XKEY_LEN);
        let version = match (&self.privkey, network) {
            (Some(_), Network::Mainnet) => 0x0488_ADE4u32,
            (Some(_), _) => 0x0435_8394,
            (None, Network::Mainnet) => 0x0488_B21E,
            (None, _) => 0x0435_87CF,
        };
        record.extend_from_slice(&version.to_be_bytes());
        record.push(self.depth);
        record.extend_from_slice(&self.parent_fingerprint.to_le_bytes());
        record.extend_from_slice(&self.child_num.to_be_bytes());
        record.extend_from_slice(self.chaincode.as_slice());
        match &self.privkey {
            Some(privkey) => {
                record.push(0x00);
                record.extend_from_slice(privkey.as_slice());
            }
            None => record.extend_from_slice(&self.pubkey),
        }
        base58check_encode(&record)
    }

    pub fn decode_base58(encoded: &str, network: Network) -> Result<Bip32Node> {
        let record = base58check_decode(encoded)?;
        if record.len() != XKEY_LEN {
            return Err(WalletError::InvalidArgument("xkey must be 78 bytes".into()));
        }

        let version = u32::from_be_bytes(record[..4].try_into().unwrap());
        let (priv_version, pub_version) = match network {
            Network::Mainnet => (0x0488_ADE4u32, 0x0488_B21Eu32),
            _ => (0x0435_8394, 0x0435_87CF),
        };

        let depth = record[4];
        let parent_fingerprint = u32::from_le_bytes(record[5..9].try_into().unwrap());
        let child_num = u32::from_be_bytes(record[9..13].try_into().unwrap());
        let chaincode = &record[13..45];
        let key = &record[45..78];

        if version == priv_version {
            if key[0] != 0x00 {
                return Err(WalletError::InvalidArgument("bad private xkey marker".into()));
            }
            Bip32Node::from_privkey(depth, child_num, parent_fingerprint, &key[1..], chaincode)
        } else if version == pub_version {
            Bip32Node::from_pubkey(depth, child_num, parent_fingerprint, key, chaincode)
        } else {
            Err(WalletError::Unsupported(format!("unknown xkey version {version:#010x}")))
        }
    }
}

/// Legacy deterministic chaincode: HMAC256 of a fixed message keyed by the
/// double hash of the root key.
pub fn compute_chaincode_legacy(private_root: &[u8]) -> SecureBytes {
    let root_hash = hash256(private_root);
    SecureBytes::from_slice(&hmac256(&root_hash, b"Derive Chaincode from Root Key"))
}

fn legacy_multiplier(pubkey_uncompressed: &[u8], chaincode: &[u8]) -> Vec<u8> {
    let pub_hash = hash256(pubkey_uncompressed);
    pub_hash.iter().zip(chaincode.iter()).map(|(a, b)| a ^ b).collect()
}

/// Legacy chained private-key derivation: scalar-multiply by
/// `chaincode XOR hash256(pubkey)`.
pub fn derive_chained_privkey(privkey: &[u8], chaincode: &[u8]) -> Result<SecureBytes> {
    let pubkey = pubkey_from_privkey(privkey, false)?;
    let multiplier = legacy_multiplier(&pubkey, chaincode);
    privkey_scalar_multiply(privkey, &multiplier)
}

/// Legacy chained public-key derivation; matches
/// [`derive_chained_privkey`] on the curve.
pub fn derive_chained_pubkey(pubkey: &[u8], chaincode: &[u8]) -> Result<Vec<u8>> {
    let uncompressed = crate::crypto::secp::uncompress_pubkey(pubkey)?;
    let multiplier = legacy_multiplier(&uncompressed, chaincode);
    pubkey_scalar_multiply(pubkey, &multiplier)
}
