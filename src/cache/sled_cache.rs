//! Durable cache backend on sled
//!
//! Pending transactions are kept in a sequence-keyed tree so iteration
//! follows insertion order, with a second tree mapping hash to sequence.
//! Both trees change in one sled transaction. Balances are decimal strings.
//! The mining lock stores its expiry in unix milliseconds followed by the
//! holder's token, and is taken and released with compare-and-swap, so two
//! handles on the same database cannot both hold it.

use super::{checked_apply, BalanceStore, LockToken, MiningLock, PendingPool};
use crate::core::Transaction;
use crate::storage::StoreError;
use chrono::Utc;
use log::debug;
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::Transactional;
use std::path::Path;
use std::time::Duration;

const PENDING_TREE: &str = "pending";
const PENDING_INDEX_TREE: &str = "pending_index";
const BALANCES_TREE: &str = "balances";
const LOCKS_TREE: &str = "locks";

/// Pending queue, balances and lock persisted in a sled database
pub struct SledCache {
    db: sled::Db,
    pending: sled::Tree,
    pending_index: sled::Tree,
    balances: sled::Tree,
    locks: sled::Tree,
}

impl SledCache {
    /// Open (or create) the cache database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::from_db(sled::open(path)?)
    }

    /// A throwaway database removed on drop
    pub fn temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            pending: db.open_tree(PENDING_TREE)?,
            pending_index: db.open_tree(PENDING_INDEX_TREE)?,
            balances: db.open_tree(BALANCES_TREE)?,
            locks: db.open_tree(LOCKS_TREE)?,
            db,
        })
    }

    /// Flush dirty pages to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        let bytes = self.db.flush()?;
        debug!("Flushed {} bytes of cache state", bytes);
        Ok(())
    }

    fn parse_balance(address: &str, raw: &[u8]) -> Result<u64, StoreError> {
        std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                StoreError::InvalidData(format!("balance of {} is not numeric", address))
            })
    }

    /// Split a lock value into its expiry and holder token
    fn parse_lock(raw: &[u8]) -> (i64, LockToken) {
        let expiry = raw
            .get(..8)
            .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
            .map(i64::from_be_bytes)
            .unwrap_or(0);
        let token = raw
            .get(8..)
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        (expiry, LockToken::from_raw(&token))
    }
}

fn transaction_error(e: TransactionError<()>) -> StoreError {
    match e {
        TransactionError::Abort(()) => StoreError::Backend("pending transaction aborted".into()),
        TransactionError::Storage(e) => e.into(),
    }
}

impl PendingPool for SledCache {
    fn put(&self, tx: &Transaction) -> Result<bool, StoreError> {
        let value = serde_json::to_vec(tx)?;
        let seq = self.db.generate_id()?.to_be_bytes().to_vec();
        let hash = tx.hash.as_bytes();

        (&self.pending, &self.pending_index)
            .transaction(|(pending, index)| -> ConflictableTransactionResult<bool> {
                if index.get(hash)?.is_some() {
                    return Ok(false);
                }
                pending.insert(seq.clone(), value.clone())?;
                index.insert(hash, seq.clone())?;
                Ok(true)
            })
            .map_err(transaction_error)
    }

    fn all(&self) -> Result<Vec<Transaction>, StoreError> {
        self.pending
            .iter()
            .values()
            .map(|value| -> Result<Transaction, StoreError> {
                Ok(serde_json::from_slice(&value?)?)
            })
            .collect()
    }

    fn remove(&self, hash: &str) -> Result<bool, StoreError> {
        (&self.pending, &self.pending_index)
            .transaction(|(pending, index)| -> ConflictableTransactionResult<bool> {
                match index.remove(hash.as_bytes())? {
                    Some(seq) => {
                        pending.remove(seq)?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            })
            .map_err(transaction_error)
    }

    fn contains(&self, hash: &str) -> Result<bool, StoreError> {
        Ok(self.pending_index.contains_key(hash.as_bytes())?)
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.pending_index.len())
    }
}

impl BalanceStore for SledCache {
    fn balance(&self, address: &str) -> Result<u64, StoreError> {
        match self.balances.get(address.as_bytes())? {
            Some(raw) => Self::parse_balance(address, &raw),
            None => Ok(0),
        }
    }

    fn apply_delta(&self, address: &str, delta: i128) -> Result<u64, StoreError> {
        loop {
            let current = self.balances.get(address.as_bytes())?;
            let balance = match &current {
                Some(raw) => Self::parse_balance(address, raw)?,
                None => 0,
            };
            let next = checked_apply(address, balance, delta)?;

            let swapped = self.balances.compare_and_swap(
                address.as_bytes(),
                current.as_ref(),
                Some(next.to_string().into_bytes()),
            )?;
            if swapped.is_ok() {
                return Ok(next);
            }
        }
    }

    fn set_balance(&self, address: &str, amount: u64) -> Result<(), StoreError> {
        self.balances
            .insert(address.as_bytes(), amount.to_string().into_bytes())?;
        Ok(())
    }

    fn balances(&self) -> Result<Vec<(String, u64)>, StoreError> {
        self.balances
            .iter()
            .map(|entry| -> Result<(String, u64), StoreError> {
                let (key, value) = entry?;
                let address = String::from_utf8_lossy(&key).into_owned();
                let amount = Self::parse_balance(&address, &value)?;
                Ok((address, amount))
            })
            .collect()
    }
}

impl MiningLock for SledCache {
    fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, StoreError> {
        let token = LockToken::generate();
        loop {
            let now = Utc::now().timestamp_millis();
            let current = self.locks.get(key.as_bytes())?;

            if let Some(raw) = &current {
                if Self::parse_lock(raw).0 > now {
                    return Ok(None);
                }
            }

            let expires_at = now + ttl.as_millis() as i64;
            let mut value = expires_at.to_be_bytes().to_vec();
            value.extend_from_slice(token.as_str().as_bytes());

            let swapped =
                self.locks
                    .compare_and_swap(key.as_bytes(), current.as_ref(), Some(value))?;
            if swapped.is_ok() {
                return Ok(Some(token));
            }
        }
    }

    fn release(&self, key: &str, token: &LockToken) -> Result<bool, StoreError> {
        let Some(current) = self.locks.get(key.as_bytes())? else {
            return Ok(false);
        };
        if Self::parse_lock(&current).1 != *token {
            return Ok(false);
        }

        let swapped = self
            .locks
            .compare_and_swap(key.as_bytes(), Some(current), None as Option<&[u8]>)?;
        Ok(swapped.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_round_trip_in_order() {
        let cache = SledCache::temporary().unwrap();
        let first = Transaction::reward("a", 1);
        let second = Transaction::reward("b", 2);
        assert!(cache.put(&first).unwrap());
        assert!(cache.put(&second).unwrap());
        assert!(!cache.put(&first).unwrap());

        let all = cache.all().unwrap();
        assert_eq!(all, vec![first.clone(), second.clone()]);
        assert_eq!(PendingPool::len(&cache).unwrap(), 2);

        assert!(cache.remove(&first.hash).unwrap());
        assert_eq!(cache.all().unwrap(), vec![second]);
    }

    #[test]
    fn test_balances_are_numeric_strings() {
        let cache = SledCache::temporary().unwrap();
        cache.set_balance("alice", 10).unwrap();
        assert_eq!(cache.apply_delta("alice", 5).unwrap(), 15);
        assert!(matches!(
            cache.apply_delta("alice", -16),
            Err(StoreError::Underflow(_))
        ));

        let raw = cache.balances.get("alice").unwrap().unwrap();
        assert_eq!(&raw[..], b"15");
        assert_eq!(cache.balances().unwrap(), vec![("alice".to_string(), 15)]);
    }

    #[test]
    fn test_lock_compare_and_swap() {
        let cache = SledCache::temporary().unwrap();
        let ttl = Duration::from_secs(10);
        let token = cache.try_acquire("mining_lock", ttl).unwrap().unwrap();
        assert!(cache.try_acquire("mining_lock", ttl).unwrap().is_none());
        assert!(cache.release("mining_lock", &token).unwrap());
        assert!(cache.try_acquire("mining_lock", ttl).unwrap().is_some());
    }

    #[test]
    fn test_expired_holder_cannot_release_new_holder() {
        let cache = SledCache::temporary().unwrap();
        let stale = cache
            .try_acquire("mining_lock", Duration::from_millis(0))
            .unwrap()
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let current = cache
            .try_acquire("mining_lock", Duration::from_secs(10))
            .unwrap()
            .unwrap();

        assert!(!cache.release("mining_lock", &stale).unwrap());
        assert!(cache
            .try_acquire("mining_lock", Duration::from_secs(10))
            .unwrap()
            .is_none());
        assert!(cache.release("mining_lock", &current).unwrap());
    }

    #[test]
    fn test_reopen_keeps_state() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("cache");
        let tx = Transaction::reward("miner", 50);
        {
            let cache = SledCache::open(&path).unwrap();
            cache.put(&tx).unwrap();
            cache.set_balance("miner", 50).unwrap();
            cache.flush().unwrap();
        }

        let cache = SledCache::open(&path).unwrap();
        assert_eq!(cache.all().unwrap(), vec![tx]);
        assert_eq!(cache.balance("miner").unwrap(), 50);
    }
}
