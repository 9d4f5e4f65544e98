//! Wallet implementation for the ledger
//!
//! A wallet is a key pair whose public key hex doubles as the address.
//! Wallets are stored one JSON file per address.

use crate::core::{Transaction, TransactionError};
use crate::crypto::KeyPair;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Wallet-related errors
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Wallet not found: {0}")]
    NotFound(String),
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] crate::crypto::KeyError),
}

/// Serializable wallet data for persistence
#[derive(Debug, Serialize, Deserialize)]
struct WalletData {
    public_key: String,
    private_key: String,
}

/// A key pair able to sign transfers
pub struct Wallet {
    key_pair: KeyPair,
}

impl Wallet {
    /// Create a new wallet with a fresh key pair
    pub fn new() -> Self {
        Self {
            key_pair: KeyPair::generate(),
        }
    }

    /// Import a wallet from a 64-character hex private key
    pub fn from_private_key(private_key_hex: &str) -> Result<Self, WalletError> {
        let key_pair = KeyPair::from_private_key_hex(private_key_hex)?;
        Ok(Self { key_pair })
    }

    /// Get the wallet's address
    pub fn address(&self) -> String {
        self.key_pair.address()
    }

    /// Get the wallet's public key (hex)
    pub fn public_key(&self) -> String {
        self.key_pair.public_key_hex()
    }

    /// Get the wallet's private key (hex)
    /// WARNING: Keep this secret!
    pub fn private_key(&self) -> String {
        self.key_pair.private_key_hex()
    }

    /// Build and sign a transfer from this wallet
    pub fn create_transfer(&self, recipient: &str, amount: u64) -> Result<Transaction, WalletError> {
        let mut tx = Transaction::new(Some(self.address()), recipient, amount);
        tx.sign(&self.key_pair)?;
        Ok(tx)
    }

    /// Save wallet to file
    pub fn save(&self, path: &Path) -> Result<(), WalletError> {
        let data = WalletData {
            public_key: self.public_key(),
            private_key: self.private_key(),
        };

        let json = serde_json::to_string_pretty(&data)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load wallet from file
    pub fn load(path: &Path) -> Result<Self, WalletError> {
        let json = fs::read_to_string(path)?;
        let data: WalletData = serde_json::from_str(&json)?;

        let wallet = Self::from_private_key(&data.private_key)?;
        if wallet.public_key() != data.public_key {
            return Err(crate::crypto::KeyError::InvalidPublicKey.into());
        }
        Ok(wallet)
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

/// Wallet manager for handling multiple wallets
pub struct WalletManager {
    wallets_dir: PathBuf,
}

impl WalletManager {
    /// Create a new wallet manager
    pub fn new(wallets_dir: &Path) -> Result<Self, WalletError> {
        fs::create_dir_all(wallets_dir)?;
        Ok(Self {
            wallets_dir: wallets_dir.to_path_buf(),
        })
    }

    fn wallet_path(&self, public_key: &str) -> PathBuf {
        self.wallets_dir.join(format!("{}.json", public_key))
    }

    /// Create and save a new wallet
    pub fn create_wallet(&self) -> Result<Wallet, WalletError> {
        let wallet = Wallet::new();
        wallet.save(&self.wallet_path(&wallet.public_key()))?;
        Ok(wallet)
    }

    /// List all wallet addresses
    pub fn list_wallets(&self) -> Result<Vec<String>, WalletError> {
        let mut addresses = Vec::new();

        for entry in fs::read_dir(&self.wallets_dir)? {
            let path = entry?.path();

            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(wallet) = Wallet::load(&path) {
                    addresses.push(wallet.address());
                }
            }
        }

        addresses.sort();
        Ok(addresses)
    }

    /// Load a specific wallet by public key
    pub fn load_wallet(&self, public_key: &str) -> Result<Wallet, WalletError> {
        let path = self.wallet_path(public_key);
        if !path.exists() {
            return Err(WalletError::NotFound(public_key.to_string()));
        }
        Wallet::load(&path)
    }
}
