//! Wallet key provider
//!
//! A wallet is one P-256 keypair; the wallet file maps addresses to
//! wallets and is persisted per node id. The chain only ever asks a
//! wallet for its keys and derived address.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::constants;
use crate::crypto::{hash_pub_key, pub_key_hash_to_address, PrivateKey};

/// Wallet persistence errors
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wallet codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("no wallet for address {0}")]
    UnknownAddress(String),
}

/// One keypair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    private: PrivateKey,
    /// Raw 64-byte X||Y public key
    pub public_key: Vec<u8>,
}

impl Wallet {
    /// Generate a fresh random keypair
    pub fn generate() -> Self {
        let private = PrivateKey::generate();
        let public_key = private.public_key();
        Self { private, public_key }
    }

    /// Base58Check address of this wallet's public key hash
    pub fn address(&self) -> String {
        pub_key_hash_to_address(&hash_pub_key(&self.public_key))
    }

    /// The signing key
    pub fn private_key(&self) -> PrivateKey {
        self.private.clone()
    }
}

/// The on-disk address -> wallet mapping for one node
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Wallets {
    wallets: HashMap<String, Wallet>,
}

impl Wallets {
    /// Load the wallet file for `node_id`, or start empty if absent
    pub fn create(node_id: &str) -> Result<Self, WalletError> {
        let path = constants::wallet_path(node_id);
        if !Path::new(&path).exists() {
            return Ok(Self::default());
        }

        let bytes = fs::read(&path)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Generate a wallet, register it, and return its address
    pub fn add_wallet(&mut self) -> String {
        let wallet = Wallet::generate();
        let address = wallet.address();
        self.wallets.insert(address.clone(), wallet);
        address
    }

    /// Look up a wallet by address
    pub fn get_wallet(&self, address: &str) -> Result<&Wallet, WalletError> {
        self.wallets
            .get(address)
            .ok_or_else(|| WalletError::UnknownAddress(address.to_string()))
    }

    /// Every known address
    pub fn all_addresses(&self) -> Vec<String> {
        self.wallets.keys().cloned().collect()
    }

    /// Persist the mapping for `node_id`
    pub fn save(&self, node_id: &str) -> Result<(), WalletError> {
        let path = constants::wallet_path(node_id);
        if let Some(parent) = Path::new(&path).parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bincode::serialize(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::validate_address;

    #[test]
    fn test_generated_address_validates() {
        let wallet = Wallet::generate();
        assert!(validate_address(&wallet.address()));
    }

    #[test]
    fn test_address_is_stable() {
        let wallet = Wallet::generate();
        assert_eq!(wallet.address(), wallet.address());
    }

    #[test]
    fn test_distinct_wallets_distinct_addresses() {
        assert_ne!(Wallet::generate().address(), Wallet::generate().address());
    }

    #[test]
    fn test_wallet_serde_roundtrip() {
        let wallet = Wallet::generate();
        let bytes = bincode::serialize(&wallet).unwrap();
        let restored: Wallet = bincode::deserialize(&bytes).unwrap();

        assert_eq!(wallet.public_key, restored.public_key);
        assert_eq!(wallet.address(), restored.address());
    }

    #[test]
    fn test_wallets_registry() {
        let mut wallets = Wallets::default();
        let address = wallets.add_wallet();

        assert!(wallets.get_wallet(&address).is_ok());
        assert_eq!(wallets.all_addresses(), vec![address]);
        assert!(matches!(
            wallets.get_wallet("unknown"),
            Err(WalletError::UnknownAddress(_))
        ));
    }

    #[test]
    fn test_wallets_serde_roundtrip() {
        let mut wallets = Wallets::default();
        let address = wallets.add_wallet();

        let bytes = bincode::serialize(&wallets).unwrap();
        let restored: Wallets = bincode::deserialize(&bytes).unwrap();
        assert_eq!(
            restored.get_wallet(&address).unwrap().address(),
            address
        );
    }
}
