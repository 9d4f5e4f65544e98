//! Core ledger components
//!
//! - Transactions (signed transfers and mining rewards)
//! - Blocks (Merkle-rooted batches with proof of work)
//! - Blockchain (the ledger: intake, mining protocol, validation)

pub mod block;
pub mod blockchain;
pub mod transaction;

pub use block::{Block, BlockError};
pub use blockchain::{
    BalanceMismatch, Blockchain, ChainStats, Collaborators, LedgerConfig, LedgerError,
    DEFAULT_DIFFICULTY, DEFAULT_TRANSACTION_THRESHOLD, GENESIS_ADDRESS, GENESIS_AMOUNT,
    MINER_ADDRESS, MINING_LOCK_KEY, MINING_LOCK_TTL, MINING_REWARD,
};
pub use transaction::{Transaction, TransactionError};
