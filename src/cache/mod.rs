//! Key-value cache collaborators
//!
//! The ledger keeps three kinds of shared, mutable state outside its chain:
//! - the pending transaction queue
//! - the per-address balance view
//! - the mining lock
//!
//! Each is a small capability trait so the mining protocol does not care
//! whether an in-process map or an external service sits behind it.

pub mod memory;
pub mod sled_cache;

use crate::core::Transaction;
use crate::storage::StoreError;
use std::time::Duration;

pub use memory::MemoryCache;
pub use sled_cache::SledCache;

/// Transactions accepted but not yet mined, keyed by hash
pub trait PendingPool: Send + Sync {
    /// Store a transaction unless its hash is already pending
    ///
    /// Returns whether it was inserted. An existing entry is left untouched.
    fn put(&self, tx: &Transaction) -> Result<bool, StoreError>;
    /// All pending transactions in insertion order
    fn all(&self) -> Result<Vec<Transaction>, StoreError>;
    /// Remove by hash, returning whether it was present
    fn remove(&self, hash: &str) -> Result<bool, StoreError>;

    fn contains(&self, hash: &str) -> Result<bool, StoreError> {
        Ok(self.all()?.iter().any(|tx| tx.hash == hash))
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.all()?.len())
    }

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

/// Per-address balances
pub trait BalanceStore: Send + Sync {
    /// Current balance, zero for unknown addresses
    fn balance(&self, address: &str) -> Result<u64, StoreError>;
    /// Atomically add `delta` and return the new balance
    ///
    /// Fails with [`StoreError::Underflow`] instead of going negative.
    fn apply_delta(&self, address: &str, delta: i128) -> Result<u64, StoreError>;
    fn set_balance(&self, address: &str, amount: u64) -> Result<(), StoreError>;
    /// Every stored balance, sorted by address
    fn balances(&self) -> Result<Vec<(String, u64)>, StoreError>;
}

/// Identifies the holder of a lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    pub(crate) fn generate() -> Self {
        Self(format!("{:016x}", rand::random::<u64>()))
    }

    pub(crate) fn from_raw(raw: &str) -> Self {
        Self(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Mutual exclusion with a time-to-live
pub trait MiningLock: Send + Sync {
    /// Take the lock unless someone holds an unexpired one
    fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, StoreError>;
    /// Release the lock if `token` still holds it, returning whether it did
    ///
    /// A holder whose lock expired and was taken over cannot release the
    /// new holder's lock.
    fn release(&self, key: &str, token: &LockToken) -> Result<bool, StoreError>;
}

/// Apply a signed delta to a balance, refusing to go below zero or overflow
pub(crate) fn checked_apply(address: &str, current: u64, delta: i128) -> Result<u64, StoreError> {
    let next = current as i128 + delta;
    if next < 0 {
        return Err(StoreError::Underflow(address.to_string()));
    }
    u64::try_from(next)
        .map_err(|_| StoreError::InvalidData(format!("balance overflow for {}", address)))
}
