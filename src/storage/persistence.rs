//! Durable chain persistence
//!
//! The ledger talks to its relational backend through [`ChainStore`], which
//! mirrors four tables: blocks, transactions, merkle proofs and the journal
//! of direct credits.
//! [`FileChainStore`] keeps those tables in memory and, when opened on a
//! data directory, rewrites them to a JSON file after every insert.

use crate::core::{Block, Transaction};
use crate::crypto::MerkleProof;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Storage errors shared by every collaborator backend
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Sled error: {0}")]
    SledError(#[from] sled::Error),
    #[error("Duplicate record: {0}")]
    Duplicate(String),
    #[error("Balance of {0} would become negative")]
    Underflow(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

// =============================================================================
// Rows
// =============================================================================

/// A row of the blocks table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub hash: String,
    pub previous_hash: String,
    pub timestamp: DateTime<Utc>,
    pub nonce: u64,
    pub difficulty: u32,
    pub merkle_root: String,
    pub index: u64,
}

impl From<&Block> for BlockRecord {
    fn from(block: &Block) -> Self {
        Self {
            hash: block.hash.clone(),
            previous_hash: block.previous_hash.clone(),
            timestamp: block.timestamp,
            nonce: block.nonce,
            difficulty: block.difficulty,
            merkle_root: block.merkle_root.clone(),
            index: block.index,
        }
    }
}

impl BlockRecord {
    /// Rebuild the block around its stored transactions
    pub fn into_block(self, transactions: Vec<Transaction>) -> Block {
        Block::from_parts(
            self.index,
            self.previous_hash,
            self.timestamp,
            self.difficulty,
            transactions,
            self.merkle_root,
            self.nonce,
            self.hash,
        )
    }
}

/// A row of the transactions table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub hash: String,
    pub from: Option<String>,
    pub to: String,
    pub amount: u64,
    pub timestamp: DateTime<Utc>,
    pub signature: Option<String>,
    pub block_hash: String,
    /// Position inside the block
    pub position: usize,
}

impl TransactionRecord {
    pub fn new(tx: &Transaction, block_hash: &str, position: usize) -> Self {
        Self {
            hash: tx.hash.clone(),
            from: tx.from.clone(),
            to: tx.to.clone(),
            amount: tx.amount,
            timestamp: tx.timestamp,
            signature: tx.signature.clone(),
            block_hash: block_hash.to_string(),
            position,
        }
    }

    pub fn into_transaction(self) -> Transaction {
        Transaction {
            from: self.from,
            to: self.to,
            amount: self.amount,
            timestamp: self.timestamp,
            signature: self.signature,
            hash: self.hash,
            block_hash: Some(self.block_hash),
        }
    }
}

/// A row of the credits journal: funds added outside of any transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditRecord {
    pub address: String,
    pub amount: u64,
    pub timestamp: DateTime<Utc>,
}

impl CreditRecord {
    pub fn new(address: &str, amount: u64) -> Self {
        Self {
            address: address.to_string(),
            amount,
            timestamp: Utc::now(),
        }
    }
}

/// A row of the merkle proofs table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofRecord {
    pub block_hash: String,
    pub transaction_hash: String,
    /// JSON-encoded [`MerkleProof`]
    pub proof_path: String,
}

impl ProofRecord {
    pub fn new(
        block_hash: &str,
        transaction_hash: &str,
        proof: &MerkleProof,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            block_hash: block_hash.to_string(),
            transaction_hash: transaction_hash.to_string(),
            proof_path: serde_json::to_string(proof)?,
        })
    }

    pub fn proof(&self) -> Result<MerkleProof, StoreError> {
        Ok(serde_json::from_str(&self.proof_path)?)
    }
}

// =============================================================================
// ChainStore
// =============================================================================

/// Durable storage for blocks, transactions and merkle proofs
pub trait ChainStore: Send + Sync {
    fn insert_block(&self, block: &BlockRecord) -> Result<(), StoreError>;
    fn insert_transaction(&self, tx: &TransactionRecord) -> Result<(), StoreError>;
    fn insert_proof(&self, proof: &ProofRecord) -> Result<(), StoreError>;
    fn block_by_hash(&self, hash: &str) -> Result<Option<BlockRecord>, StoreError>;
    /// Transactions of a block, ordered by position
    fn transactions_by_block(&self, block_hash: &str)
        -> Result<Vec<TransactionRecord>, StoreError>;
    /// All blocks ordered by index
    fn blocks_ordered(&self) -> Result<Vec<BlockRecord>, StoreError>;
    fn proof(
        &self,
        block_hash: &str,
        transaction_hash: &str,
    ) -> Result<Option<ProofRecord>, StoreError>;
    fn insert_credit(&self, credit: &CreditRecord) -> Result<(), StoreError>;
    /// Every credit in insertion order
    fn credits(&self) -> Result<Vec<CreditRecord>, StoreError>;
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub chain_file: String,
    pub cache_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".ledger_data"),
            chain_file: "chain.json".to_string(),
            cache_dir: "cache".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn chain_path(&self) -> PathBuf {
        self.data_dir.join(&self.chain_file)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join(&self.cache_dir)
    }

    pub fn wallets_path(&self) -> PathBuf {
        self.data_dir.join("wallets")
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChainTables {
    blocks: Vec<BlockRecord>,
    transactions: Vec<TransactionRecord>,
    proofs: Vec<ProofRecord>,
    #[serde(default)]
    credits: Vec<CreditRecord>,
}

/// Table-backed chain store, optionally mirrored to a JSON file
pub struct FileChainStore {
    tables: RwLock<ChainTables>,
    path: Option<PathBuf>,
}

impl FileChainStore {
    /// Open (or create) the store under the configured data directory
    pub fn open(config: &StorageConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.data_dir)?;
        let path = config.chain_path();

        let tables = if path.exists() {
            let reader = BufReader::new(fs::File::open(&path)?);
            serde_json::from_reader(reader)?
        } else {
            ChainTables::default()
        };

        Ok(Self {
            tables: RwLock::new(tables),
            path: Some(path),
        })
    }

    /// A store that never touches the filesystem
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(ChainTables::default()),
            path: None,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, ChainTables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Backend("chain tables lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, ChainTables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Backend("chain tables lock poisoned".to_string()))
    }

    /// Write the tables to disk through a temporary file and atomic rename
    fn flush(&self, tables: &ChainTables) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let temp_path = path.with_extension("tmp");
        let writer = BufWriter::new(fs::File::create(&temp_path)?);
        serde_json::to_writer_pretty(writer, tables)?;
        fs::rename(&temp_path, path)?;

        debug!("Flushed chain tables to {:?}", path);
        Ok(())
    }
}

impl ChainStore for FileChainStore {
    fn insert_block(&self, block: &BlockRecord) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if tables.blocks.iter().any(|b| b.hash == block.hash) {
            return Err(StoreError::Duplicate(block.hash.clone()));
        }
        tables.blocks.push(block.clone());
        self.flush(&tables)
    }

    fn insert_transaction(&self, tx: &TransactionRecord) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        tables.transactions.push(tx.clone());
        self.flush(&tables)
    }

    fn insert_proof(&self, proof: &ProofRecord) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        tables.proofs.push(proof.clone());
        self.flush(&tables)
    }

    fn block_by_hash(&self, hash: &str) -> Result<Option<BlockRecord>, StoreError> {
        Ok(self.read()?.blocks.iter().find(|b| b.hash == hash).cloned())
    }

    fn transactions_by_block(
        &self,
        block_hash: &str,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let mut rows: Vec<TransactionRecord> = self
            .read()?
            .transactions
            .iter()
            .filter(|tx| tx.block_hash == block_hash)
            .cloned()
            .collect();
        rows.sort_by_key(|tx| tx.position);
        Ok(rows)
    }

    fn blocks_ordered(&self) -> Result<Vec<BlockRecord>, StoreError> {
        let mut rows = self.read()?.blocks.clone();
        rows.sort_by_key(|b| b.index);
        Ok(rows)
    }

    fn proof(
        &self,
        block_hash: &str,
        transaction_hash: &str,
    ) -> Result<Option<ProofRecord>, StoreError> {
        Ok(self
            .read()?
            .proofs
            .iter()
            .find(|p| p.block_hash == block_hash && p.transaction_hash == transaction_hash)
            .cloned())
    }

    fn insert_credit(&self, credit: &CreditRecord) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        tables.credits.push(credit.clone());
        self.flush(&tables)
    }

    fn credits(&self) -> Result<Vec<CreditRecord>, StoreError> {
        Ok(self.read()?.credits.clone())
    }
}
