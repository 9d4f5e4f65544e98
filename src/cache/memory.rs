//! In-process cache backend
//!
//! All three collaborator roles backed by mutex-guarded maps. Suitable for
//! tests and for a single process owning the ledger.

use super::{checked_apply, BalanceStore, LockToken, MiningLock, PendingPool};
use crate::core::Transaction;
use crate::storage::StoreError;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct PendingState {
    next_seq: u64,
    order: BTreeMap<u64, String>,
    entries: HashMap<String, (u64, Transaction)>,
}

/// Pending queue, balances and lock held in memory
#[derive(Debug, Default)]
pub struct MemoryCache {
    pending: Mutex<PendingState>,
    balances: Mutex<HashMap<String, u64>>,
    locks: Mutex<HashMap<String, (LockToken, Instant)>>,
}

fn guard<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Backend("cache mutex poisoned".to_string()))
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PendingPool for MemoryCache {
    fn put(&self, tx: &Transaction) -> Result<bool, StoreError> {
        let mut state = guard(&self.pending)?;
        if state.entries.contains_key(&tx.hash) {
            return Ok(false);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.insert(seq, tx.hash.clone());
        state.entries.insert(tx.hash.clone(), (seq, tx.clone()));
        Ok(true)
    }

    fn all(&self) -> Result<Vec<Transaction>, StoreError> {
        let state = guard(&self.pending)?;
        Ok(state
            .order
            .values()
            .filter_map(|hash| state.entries.get(hash).map(|(_, tx)| tx.clone()))
            .collect())
    }

    fn remove(&self, hash: &str) -> Result<bool, StoreError> {
        let mut state = guard(&self.pending)?;
        match state.entries.remove(hash) {
            Some((seq, _)) => {
                state.order.remove(&seq);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn contains(&self, hash: &str) -> Result<bool, StoreError> {
        Ok(guard(&self.pending)?.entries.contains_key(hash))
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(guard(&self.pending)?.entries.len())
    }
}

impl BalanceStore for MemoryCache {
    fn balance(&self, address: &str) -> Result<u64, StoreError> {
        Ok(guard(&self.balances)?.get(address).copied().unwrap_or(0))
    }

    fn apply_delta(&self, address: &str, delta: i128) -> Result<u64, StoreError> {
        let mut balances = guard(&self.balances)?;
        let current = balances.get(address).copied().unwrap_or(0);
        let next = checked_apply(address, current, delta)?;
        balances.insert(address.to_string(), next);
        Ok(next)
    }

    fn set_balance(&self, address: &str, amount: u64) -> Result<(), StoreError> {
        guard(&self.balances)?.insert(address.to_string(), amount);
        Ok(())
    }

    fn balances(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let mut all: Vec<(String, u64)> = guard(&self.balances)?
            .iter()
            .map(|(address, amount)| (address.clone(), *amount))
            .collect();
        all.sort();
        Ok(all)
    }
}

impl MiningLock for MemoryCache {
    fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, StoreError> {
        let mut locks = guard(&self.locks)?;
        let now = Instant::now();

        match locks.get(key) {
            Some((_, expires_at)) if *expires_at > now => Ok(None),
            _ => {
                let token = LockToken::generate();
                locks.insert(key.to_string(), (token.clone(), now + ttl));
                Ok(Some(token))
            }
        }
    }

    fn release(&self, key: &str, token: &LockToken) -> Result<bool, StoreError> {
        let mut locks = guard(&self.locks)?;
        match locks.get(key) {
            Some((holder, _)) if holder == token => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
