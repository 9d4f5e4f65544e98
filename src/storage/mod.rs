//! Storage module for ledger persistence

pub mod persistence;

pub use persistence::{
    BlockRecord, ChainStore, CreditRecord, FileChainStore, ProofRecord, StorageConfig, StoreError,
    TransactionRecord,
};
