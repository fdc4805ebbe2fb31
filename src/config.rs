//! Process configuration: data directory, network selection and listener
//! settings, sourced from the environment with CLI overrides in the binary.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WalletError};

/// Which chain the process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(WalletError::InvalidArgument(format!("unknown network '{other}'"))),
        }
    }

    /// Version byte prepended to P2PKH address payloads.
    pub fn pubkey_hash_prefix(self) -> u8 {
        match self {
            Network::Mainnet => 0x00,
            Network::Testnet | Network::Regtest => 0x6F,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Network::Mainnet => 9001,
            Network::Testnet => 19001,
            Network::Regtest => 19002,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub network: Network,
    pub listen_port: u16,
    /// Write a one-shot auth cookie file under the data directory.
    pub cookie_file: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var("BITARMOR_DATADIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./bitarmor-data"));
        let network = match std::env::var("BITARMOR_NETWORK") {
            Ok(value) => Network::parse(&value)?,
            Err(_) => Network::Mainnet,
        };
        let listen_port = match std::env::var("BITARMOR_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .map_err(|_| WalletError::InvalidArgument(format!("bad port '{value}'")))?,
            Err(_) => network.default_port(),
        };
        let cookie_file = std::env::var("BITARMOR_COOKIE").map(|v| v == "1").unwrap_or(false);

        Ok(Config { data_dir, network, listen_port, cookie_file })
    }

    /// Load from a TOML file, e.g. `bitarmor.toml` in the data directory.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| WalletError::InvalidArgument(format!("bad config file: {e}")))
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("bitarmor.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_parsing() {
        assert_eq!(Network::parse("mainnet").unwrap(), Network::Mainnet);
        assert_eq!(Network::parse("TEST").unwrap(), Network::Testnet);
        assert!(Network::parse("signet").is_err());
    }

    #[test]
    fn network_prefixes() {
        assert_eq!(Network::Mainnet.pubkey_hash_prefix(), 0x00);
        assert_eq!(Network::Regtest.pubkey_hash_prefix(), 0x6F);
    }

    #[test]
    fn config_file_roundtrip() {
        let config = Config {
            data_dir: "/tmp/ba-test".into(),
            network: Network::Regtest,
            listen_port: 19002,
            cookie_file: true,
        };
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.listen_port, 19002);
        assert_eq!(parsed.network, Network::Regtest);
        assert!(parsed.cookie_file);
    }
}
