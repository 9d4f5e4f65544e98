//! Wallet module for key storage and transfer signing

pub mod wallet;

pub use wallet::{Wallet, WalletError, WalletManager};
