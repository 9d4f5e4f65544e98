//! Block implementation for the ledger
//!
//! A block holds an ordered batch of transactions, the merkle tree over
//! their content hashes, and the proof-of-work header fields.

use crate::core::transaction::Transaction;
use crate::crypto::{meets_difficulty, sha256_hex, MerkleError, MerkleProof, MerkleTree, ZERO_HASH};
use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;
use thiserror::Error;

// =============================================================================
// Block Errors
// =============================================================================

/// Block validation errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BlockError {
    #[error("Invalid proof of work")]
    InvalidProofOfWork,
    #[error("Invalid merkle root")]
    InvalidMerkleRoot,
    #[error("Invalid block hash")]
    InvalidBlockHash,
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
}

/// A block in the chain
///
/// Blocks are rebuilt from storage rows through [`Block::from_parts`], so
/// only serialization is derived.
#[derive(Debug, Clone, Serialize)]
pub struct Block {
    /// Block index/height
    pub index: u64,
    /// Hash of the previous block
    pub previous_hash: String,
    /// Block creation timestamp
    pub timestamp: DateTime<Utc>,
    /// Required number of leading zero nibbles
    pub difficulty: u32,
    /// Ordered transactions, reward last when mined by the ledger
    pub transactions: Vec<Transaction>,
    /// Merkle root of transaction hashes
    pub merkle_root: String,
    /// Nonce used for proof of work
    pub nonce: u64,
    /// Block hash
    pub hash: String,
    #[serde(skip)]
    merkle_tree: MerkleTree,
}

impl Block {
    /// Create a new block (unmined)
    pub fn new(
        index: u64,
        previous_hash: String,
        timestamp: DateTime<Utc>,
        transactions: Vec<Transaction>,
        difficulty: u32,
    ) -> Self {
        let merkle_tree = Self::build_merkle_tree(&transactions);
        let merkle_root = merkle_tree.root().to_string();

        let mut block = Self {
            index,
            previous_hash,
            timestamp,
            difficulty,
            transactions,
            merkle_root,
            nonce: 0,
            hash: String::new(),
            merkle_tree,
        };
        block.hash = block.calculate_hash();
        block
    }

    /// Create and mine the genesis block crediting `address` with `amount`
    pub fn genesis(address: &str, amount: u64, difficulty: u32) -> Self {
        let reward = Transaction::reward(address, amount);
        let mut block = Self::new(0, ZERO_HASH.to_string(), Utc::now(), vec![reward], difficulty);
        block.mine(difficulty);
        block
    }

    /// Reassemble a block from stored fields
    ///
    /// The stored merkle root, nonce and hash are kept as-is so that
    /// validation can detect tampering.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        index: u64,
        previous_hash: String,
        timestamp: DateTime<Utc>,
        difficulty: u32,
        transactions: Vec<Transaction>,
        merkle_root: String,
        nonce: u64,
        hash: String,
    ) -> Self {
        let merkle_tree = Self::build_merkle_tree(&transactions);
        Self {
            index,
            previous_hash,
            timestamp,
            difficulty,
            transactions,
            merkle_root,
            nonce,
            hash,
            merkle_tree,
        }
    }

    fn build_merkle_tree(transactions: &[Transaction]) -> MerkleTree {
        let leaves: Vec<String> = transactions.iter().map(|tx| tx.hash.clone()).collect();
        MerkleTree::new(&leaves)
    }

    /// Recompute the merkle root from the transactions' current content
    pub fn calculate_merkle_root(&self) -> String {
        let leaves: Vec<String> = self
            .transactions
            .iter()
            .map(Transaction::calculate_hash)
            .collect();
        MerkleTree::new(&leaves).root().to_string()
    }

    /// Calculate the block hash from the current fields
    pub fn calculate_hash(&self) -> String {
        let bodies: Vec<_> = self.transactions.iter().map(Transaction::body).collect();
        // Serializing borrowed strings and integers cannot fail
        let transactions = serde_json::to_string(&bodies).unwrap_or_default();
        let data = format!(
            "{}{}{}{}{}",
            self.previous_hash,
            self.timestamp.timestamp_millis(),
            self.merkle_root,
            self.nonce,
            transactions
        );
        sha256_hex(data.as_bytes())
    }

    /// Mine the block (find a valid nonce)
    ///
    /// Searches nonces in ascending order from the current value and
    /// returns the number of hashes computed.
    pub fn mine(&mut self, difficulty: u32) -> u64 {
        self.difficulty = difficulty;
        self.hash = self.calculate_hash();
        let mut attempts = 1u64;

        while !self.is_valid_pow() {
            self.nonce = self.nonce.wrapping_add(1);
            self.hash = self.calculate_hash();
            attempts += 1;
        }

        attempts
    }

    /// Mine with a budget of at most `max_attempts` hashes
    ///
    /// Returns false if the budget ran out first; the block keeps the last
    /// nonce tried so mining can resume from there.
    pub fn mine_bounded(&mut self, difficulty: u32, max_attempts: u64) -> bool {
        self.difficulty = difficulty;
        self.hash = self.calculate_hash();

        for _ in 1..max_attempts {
            if self.is_valid_pow() {
                return true;
            }
            self.nonce = self.nonce.wrapping_add(1);
            self.hash = self.calculate_hash();
        }

        max_attempts > 0 && self.is_valid_pow()
    }

    /// Check if the proof of work is valid
    pub fn is_valid_pow(&self) -> bool {
        meets_difficulty(&self.hash, self.difficulty)
    }

    /// Verify the block's merkle root
    pub fn verify_merkle_root(&self) -> bool {
        self.calculate_merkle_root() == self.merkle_root
    }

    /// Verify the block hash
    pub fn verify_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    /// Check every transaction, logging the first one that fails
    pub fn has_valid_transactions(&self) -> bool {
        match self.transactions.iter().position(|tx| !tx.is_valid()) {
            Some(pos) => {
                warn!(
                    "Block {} has invalid transaction {} at position {}",
                    self.index, self.transactions[pos].hash, pos
                );
                false
            }
            None => true,
        }
    }

    /// Hash, merkle root, proof of work and transactions in one pass
    pub fn validate(&self) -> Result<(), BlockError> {
        if !self.verify_hash() {
            return Err(BlockError::InvalidBlockHash);
        }

        if !self.verify_merkle_root() {
            return Err(BlockError::InvalidMerkleRoot);
        }

        if !self.is_valid_pow() {
            return Err(BlockError::InvalidProofOfWork);
        }

        if let Some(tx) = self.transactions.iter().find(|tx| !tx.is_valid()) {
            return Err(BlockError::InvalidTransaction(tx.hash.clone()));
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        match self.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!("Block {} is invalid: {}", self.index, e);
                false
            }
        }
    }

    /// The merkle tree built over the transactions at construction
    pub fn merkle_tree(&self) -> &MerkleTree {
        &self.merkle_tree
    }

    /// Inclusion proof for the first transaction with `tx_hash`
    pub fn merkle_proof(&self, tx_hash: &str) -> Result<MerkleProof, MerkleError> {
        self.merkle_tree.proof(tx_hash)
    }

    /// Stamp every transaction with this block's hash
    pub fn link_transactions(&mut self) {
        for tx in &mut self.transactions {
            tx.block_hash = Some(self.hash.clone());
        }
    }

    /// Get number of transactions in this block
    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }
}
