//! Mining engine for the ledger
//!
//! Assembles a candidate block from a batch of pending transactions plus
//! the reward transaction, and runs the nonce search without touching the
//! chain, so callers only need the chain lock to append the result.

use crate::core::{Block, Transaction};
use crate::crypto::ZERO_HASH;
use chrono::Utc;
use log::info;
use std::time::Instant;

/// Mining statistics
#[derive(Debug, Clone)]
pub struct MiningStats {
    /// Number of hash attempts
    pub hash_attempts: u64,
    /// Time taken in milliseconds
    pub time_ms: u128,
    /// Hash rate (hashes per second)
    pub hash_rate: f64,
}

/// Result of one run of the mining protocol
#[derive(Debug, Clone)]
pub enum MiningOutcome {
    /// A block was mined, appended and persisted
    Mined {
        block: Box<Block>,
        stats: MiningStats,
    },
    /// Another miner holds the lock; nothing was changed
    LockUnavailable,
    /// Not enough pending transactions for a full batch
    BelowThreshold { pending: usize },
}

impl MiningOutcome {
    pub fn is_mined(&self) -> bool {
        matches!(self, MiningOutcome::Mined { .. })
    }

    pub fn block(&self) -> Option<&Block> {
        match self {
            MiningOutcome::Mined { block, .. } => Some(block.as_ref()),
            _ => None,
        }
    }
}

/// Miner for creating new blocks
pub struct Miner {
    /// Miner's address for receiving rewards
    pub address: String,
    /// Reward paid per block
    pub reward: u64,
}

impl Miner {
    /// Create a new miner
    pub fn new(address: &str, reward: u64) -> Self {
        Self {
            address: address.to_string(),
            reward,
        }
    }

    /// The reward transaction appended to every mined batch
    pub fn reward_transaction(&self) -> Transaction {
        Transaction::reward(self.address.as_str(), self.reward)
    }

    /// Mine a block on top of `tip` (index and hash of the current last block)
    ///
    /// The reward transaction is appended after `transactions`. With no tip
    /// the block starts a chain at index 0 on the zero hash.
    pub fn mine_block_detached(
        &self,
        tip: Option<(u64, String)>,
        difficulty: u32,
        mut transactions: Vec<Transaction>,
    ) -> (Block, MiningStats) {
        let start = Instant::now();

        transactions.push(self.reward_transaction());

        let (index, previous_hash) = match tip {
            Some((index, hash)) => (index + 1, hash),
            None => (0, ZERO_HASH.to_string()),
        };

        let mut block = Block::new(index, previous_hash, Utc::now(), transactions, difficulty);

        info!(
            "Mining block {} with {} transactions at difficulty {}...",
            block.index,
            block.tx_count(),
            difficulty
        );

        // CPU-bound, no suspension points
        let attempts = block.mine(difficulty);

        let elapsed = start.elapsed().as_millis();
        let hash_rate = if elapsed > 0 {
            (attempts as f64) / (elapsed as f64 / 1000.0)
        } else {
            attempts as f64
        };

        let stats = MiningStats {
            hash_attempts: attempts,
            time_ms: elapsed,
            hash_rate,
        };

        info!(
            "Block {} mined in {}ms ({} attempts, {:.2} H/s)",
            block.index, elapsed, attempts, hash_rate
        );

        (block, stats)
    }
}
