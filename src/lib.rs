//! Pow-Ledger: a single-node proof-of-work ledger in Rust
//!
//! This crate provides:
//! - ECDSA digital signatures (secp256k1) with public-key addresses
//! - Merkle trees with inclusion proofs
//! - Signed transfers and mining rewards
//! - Blocks sealed by a leading-zero proof of work
//! - A ledger with threshold mining under a TTL lock, balance bookkeeping
//!   and whole-chain validation
//! - Pluggable chain store, pending pool, balance and lock collaborators
//!   (in-memory, JSON file and sled backends)
//!
//! # Example
//!
//! ```rust
//! use pow_ledger::core::{Blockchain, Collaborators, LedgerConfig};
//! use pow_ledger::wallet::Wallet;
//!
//! let config = LedgerConfig {
//!     difficulty: 1,
//!     ..Default::default()
//! };
//! let ledger = Blockchain::new(config, Collaborators::in_memory()).unwrap();
//!
//! let alice = Wallet::new();
//! ledger.credit(&alice.address(), 100).unwrap();
//!
//! let tx = alice.create_transfer("bob", 40).unwrap();
//! ledger.add_transaction(tx).unwrap();
//!
//! assert_eq!(ledger.balance_of("bob").unwrap(), 40);
//! assert!(ledger.is_chain_valid());
//! ```

pub mod cache;
pub mod cli;
pub mod core;
pub mod crypto;
pub mod mining;
pub mod storage;
pub mod wallet;

// Re-export commonly used types
pub use cache::{BalanceStore, MemoryCache, MiningLock, PendingPool, SledCache};
pub use core::{
    Block, Blockchain, Collaborators, LedgerConfig, LedgerError, Transaction,
    DEFAULT_DIFFICULTY, MINING_REWARD,
};
pub use crypto::{KeyPair, MerkleProof, MerkleTree};
pub use mining::{Miner, MiningOutcome};
pub use storage::{ChainStore, FileChainStore, StorageConfig};
pub use wallet::{Wallet, WalletManager};
