//! Bitcoin full-wallet and block-indexing back end.
//!
//! The crate is organised around three subsystems: the encrypted wallet
//! store ([`store`]), the typed asset tree and its paper-backup codec
//! ([`wallet`], [`backup`]), and the authenticated transport ([`transport`]).
//! The block-filter index ([`filter`]) serves address-history candidate
//! lookups for the node side.

pub mod backup;
pub mod config;
pub mod crypto;
pub mod encode;
pub mod error;
pub mod filter;
pub mod store;
pub mod transport;
pub mod wallet;

pub use config::{Config, Network};
pub use error::{Result, WalletError};
