//! Ledger implementation
//!
//! [`Blockchain`] owns the in-memory chain and orchestrates its
//! collaborators: the durable chain store, the pending pool, the balance
//! view and the mining lock. It is an explicitly constructed value, so
//! several independent ledgers can live in one process.

use crate::cache::{BalanceStore, LockToken, MemoryCache, MiningLock, PendingPool};
use crate::core::block::Block;
use crate::core::transaction::{Transaction, TransactionError};
use crate::crypto::MerkleProof;
use crate::mining::{Miner, MiningOutcome};
use crate::storage::{
    BlockRecord, ChainStore, CreditRecord, FileChainStore, ProofRecord, StoreError,
    TransactionRecord,
};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Default mining difficulty (number of leading zero nibbles)
pub const DEFAULT_DIFFICULTY: u32 = 3;

/// Reward paid to the miner of each block
pub const MINING_REWARD: u64 = 50;

/// Pending transactions needed before a block is mined
pub const DEFAULT_TRANSACTION_THRESHOLD: usize = 2;

/// Amount credited by the genesis block
pub const GENESIS_AMOUNT: u64 = 1_000_000;

/// Recipient of the genesis allocation
pub const GENESIS_ADDRESS: &str = "genesis-address";

/// Default recipient of mining rewards
pub const MINER_ADDRESS: &str = "miner-address";

/// Name of the lock guarding the mining protocol
pub const MINING_LOCK_KEY: &str = "mining_lock";

/// How long a mining lock stays valid if its holder never releases it
pub const MINING_LOCK_TTL: Duration = Duration::from_secs(10);

/// Ledger-level errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Malformed transaction: {0}")]
    MalformedTransaction(String),
    #[error("Invalid signature on transaction {0}")]
    InvalidSignature(String),
    #[error("Transaction {0} is already pending or mined")]
    DuplicateTransaction(String),
    #[error("Invalid amount: {0}")]
    InvalidAmount(u64),
    #[error("Insufficient balance for {address}: have {have}, need {need}")]
    InsufficientBalance {
        address: String,
        have: u64,
        need: u64,
    },
    #[error("Authorization error: {0}")]
    Authorization(#[from] TransactionError),
    #[error("Persistence failure: {0}")]
    PersistenceFailure(#[from] StoreError),
    #[error("Chain integrity error at block {index}: {reason}")]
    ChainIntegrity { index: u64, reason: String },
    #[error("Chain state lock poisoned")]
    StatePoisoned,
}

/// Policy constants for a ledger
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub difficulty: u32,
    pub mining_reward: u64,
    pub transaction_threshold: usize,
    pub miner_address: String,
    pub genesis_address: String,
    pub genesis_amount: u64,
    pub lock_ttl: Duration,
    /// Run the mining protocol from `add_transaction` once the pool is full
    pub auto_mine: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            difficulty: DEFAULT_DIFFICULTY,
            mining_reward: MINING_REWARD,
            transaction_threshold: DEFAULT_TRANSACTION_THRESHOLD,
            miner_address: MINER_ADDRESS.to_string(),
            genesis_address: GENESIS_ADDRESS.to_string(),
            genesis_amount: GENESIS_AMOUNT,
            lock_ttl: MINING_LOCK_TTL,
            auto_mine: true,
        }
    }
}

/// The external services a ledger works against
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ChainStore>,
    pub pool: Arc<dyn PendingPool>,
    pub balances: Arc<dyn BalanceStore>,
    pub lock: Arc<dyn MiningLock>,
}

impl Collaborators {
    /// Use one cache backend for the pool, the balances and the lock
    pub fn with_cache<C>(store: Arc<dyn ChainStore>, cache: Arc<C>) -> Self
    where
        C: PendingPool + BalanceStore + MiningLock + 'static,
    {
        Self {
            store,
            pool: cache.clone(),
            balances: cache.clone(),
            lock: cache,
        }
    }

    /// Everything in process memory
    pub fn in_memory() -> Self {
        Self::with_cache(
            Arc::new(FileChainStore::in_memory()),
            Arc::new(MemoryCache::new()),
        )
    }
}

/// A stored balance that disagrees with the one derived from the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceMismatch {
    pub address: String,
    pub stored: u64,
    pub derived: u64,
}

/// Chain statistics
#[derive(Debug, Clone)]
pub struct ChainStats {
    pub height: u64,
    pub total_blocks: u64,
    pub total_transactions: u64,
    pub pending_transactions: usize,
    pub difficulty: u32,
    pub latest_hash: String,
}

/// Releases the mining lock when dropped, whatever path the protocol took
struct MiningLockGuard<'a> {
    lock: &'a dyn MiningLock,
    key: &'static str,
    token: LockToken,
}

impl Drop for MiningLockGuard<'_> {
    fn drop(&mut self) {
        match self.lock.release(self.key, &self.token) {
            Ok(true) => debug!("Released {}", self.key),
            Ok(false) => warn!("{} expired and was taken over before release", self.key),
            Err(e) => error!("Failed to release {}: {}", self.key, e),
        }
    }
}

/// The ledger
pub struct Blockchain {
    config: LedgerConfig,
    chain: RwLock<Vec<Block>>,
    store: Arc<dyn ChainStore>,
    pool: Arc<dyn PendingPool>,
    balances: Arc<dyn BalanceStore>,
    lock: Arc<dyn MiningLock>,
}

impl Blockchain {
    /// Create a fresh ledger: mine, persist and credit the genesis block
    pub fn new(config: LedgerConfig, collaborators: Collaborators) -> Result<Self, LedgerError> {
        let ledger = Self::with_blocks(config, collaborators, Vec::new());

        let mut genesis = Block::genesis(
            &ledger.config.genesis_address,
            ledger.config.genesis_amount,
            ledger.config.difficulty,
        );
        genesis.link_transactions();

        ledger.persist_block(&genesis)?;
        for tx in &genesis.transactions {
            ledger.balances.apply_delta(&tx.to, tx.amount as i128)?;
        }

        info!(
            "Created genesis block {} crediting {} to {}",
            genesis.hash, ledger.config.genesis_amount, ledger.config.genesis_address
        );
        ledger.write_chain()?.push(genesis);

        Ok(ledger)
    }

    /// Load the chain from the store, or create genesis if it is empty
    ///
    /// A stored chain that fails validation fails the whole load. Balances
    /// are trusted as stored; see [`Blockchain::rebuild_balances`].
    pub fn open(config: LedgerConfig, collaborators: Collaborators) -> Result<Self, LedgerError> {
        let records = collaborators.store.blocks_ordered()?;
        if records.is_empty() {
            return Self::new(config, collaborators);
        }

        let mut blocks = Vec::with_capacity(records.len());
        for record in records {
            let transactions = collaborators
                .store
                .transactions_by_block(&record.hash)?
                .into_iter()
                .map(TransactionRecord::into_transaction)
                .collect();
            blocks.push(record.into_block(transactions));
        }

        validate_blocks(&blocks)?;
        info!("Loaded chain with {} blocks", blocks.len());

        Ok(Self::with_blocks(config, collaborators, blocks))
    }

    fn with_blocks(config: LedgerConfig, collaborators: Collaborators, blocks: Vec<Block>) -> Self {
        Self {
            config,
            chain: RwLock::new(blocks),
            store: collaborators.store,
            pool: collaborators.pool,
            balances: collaborators.balances,
            lock: collaborators.lock,
        }
    }

    fn read_chain(&self) -> Result<RwLockReadGuard<'_, Vec<Block>>, LedgerError> {
        self.chain.read().map_err(|_| LedgerError::StatePoisoned)
    }

    fn write_chain(&self) -> Result<RwLockWriteGuard<'_, Vec<Block>>, LedgerError> {
        self.chain.write().map_err(|_| LedgerError::StatePoisoned)
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    // =========================================================================
    // Intake
    // =========================================================================

    /// Validate a signed transfer, move the funds and queue it for mining
    ///
    /// Returns the transaction hash.
    pub fn add_transaction(&self, tx: Transaction) -> Result<String, LedgerError> {
        let from = match tx.from.as_deref() {
            Some(from) if !from.is_empty() => from.to_string(),
            _ => return Err(LedgerError::MalformedTransaction("missing sender".into())),
        };
        if tx.to.is_empty() {
            return Err(LedgerError::MalformedTransaction("missing recipient".into()));
        }
        if !tx.has_valid_hash() {
            return Err(LedgerError::MalformedTransaction(format!(
                "hash {} does not match content",
                tx.hash
            )));
        }

        if !tx.is_valid() {
            return Err(LedgerError::InvalidSignature(tx.hash.clone()));
        }

        if tx.amount == 0 {
            return Err(LedgerError::InvalidAmount(tx.amount));
        }

        if self.pool.contains(&tx.hash)? || self.contains_transaction(&tx.hash)? {
            return Err(LedgerError::DuplicateTransaction(tx.hash));
        }

        let have = self.balances.balance(&from)?;
        if have < tx.amount {
            return Err(LedgerError::InsufficientBalance {
                address: from,
                have,
                need: tx.amount,
            });
        }

        // A concurrent debit may have landed since the read above
        match self.balances.apply_delta(&from, -(tx.amount as i128)) {
            Ok(_) => {}
            Err(StoreError::Underflow(_)) => {
                return Err(LedgerError::InsufficientBalance {
                    have: self.balances.balance(&from)?,
                    address: from,
                    need: tx.amount,
                });
            }
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = self.balances.apply_delta(&tx.to, tx.amount as i128) {
            self.revert_transfer(&from, None, tx.amount);
            return Err(e.into());
        }
        // The pool has the last word on duplicates submitted concurrently
        match self.pool.put(&tx) {
            Ok(true) => {}
            Ok(false) => {
                self.revert_transfer(&from, Some(&tx.to), tx.amount);
                return Err(LedgerError::DuplicateTransaction(tx.hash));
            }
            Err(e) => {
                self.revert_transfer(&from, Some(&tx.to), tx.amount);
                return Err(e.into());
            }
        }

        info!(
            "Accepted transaction {} ({} -> {}, {})",
            tx.hash, from, tx.to, tx.amount
        );

        if self.config.auto_mine && self.pool.len()? >= self.config.transaction_threshold {
            match self.mine_pending_transactions() {
                Ok(outcome) => debug!("Threshold mining finished: {:?}", outcome),
                Err(e) => warn!("Threshold mining failed: {}", e),
            }
        }

        Ok(tx.hash)
    }

    /// Undo the balance moves of a transfer that could not be queued
    fn revert_transfer(&self, from: &str, to: Option<&str>, amount: u64) {
        if let Some(to) = to {
            if let Err(e) = self.balances.apply_delta(to, -(amount as i128)) {
                error!("Failed to take back {} from {}: {}", amount, to, e);
            }
        }
        if let Err(e) = self.balances.apply_delta(from, amount as i128) {
            error!("Failed to refund {} to {}: {}", amount, from, e);
        }
    }

    /// Whether a transaction with this hash is already in a block
    fn contains_transaction(&self, hash: &str) -> Result<bool, LedgerError> {
        Ok(self
            .read_chain()?
            .iter()
            .any(|block| block.transactions.iter().any(|tx| tx.hash == hash)))
    }

    /// Credit an address directly, outside of any transaction
    ///
    /// The credit is journaled in the chain store so derived balances
    /// account for it.
    pub fn credit(&self, address: &str, amount: u64) -> Result<u64, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let balance = self.balances.apply_delta(address, amount as i128)?;

        if let Err(e) = self.store.insert_credit(&CreditRecord::new(address, amount)) {
            if let Err(undo) = self.balances.apply_delta(address, -(amount as i128)) {
                error!("Failed to undo credit of {} to {}: {}", amount, address, undo);
            }
            return Err(e.into());
        }

        info!("Credited {} to {} (balance {})", amount, address, balance);
        Ok(balance)
    }

    pub fn balance_of(&self, address: &str) -> Result<u64, LedgerError> {
        Ok(self.balances.balance(address)?)
    }

    pub fn pending_transactions(&self) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self.pool.all()?)
    }

    // =========================================================================
    // Mining protocol
    // =========================================================================

    /// Mine one block from the pending pool under the mining lock
    ///
    /// Returns `LockUnavailable` without side effects if another miner
    /// holds the lock. Errors after the lock is taken are logged and
    /// returned; the lock is released on every path.
    pub fn mine_pending_transactions(&self) -> Result<MiningOutcome, LedgerError> {
        let Some(token) = self.lock.try_acquire(MINING_LOCK_KEY, self.config.lock_ttl)? else {
            info!("Mining lock is held elsewhere, skipping this round");
            return Ok(MiningOutcome::LockUnavailable);
        };
        let _guard = MiningLockGuard {
            lock: self.lock.as_ref(),
            key: MINING_LOCK_KEY,
            token,
        };

        let result = self.mine_locked();
        if let Err(e) = &result {
            error!("Mining failed: {}", e);
        }
        result
    }

    /// Run the mining protocol on tokio's blocking pool
    pub fn spawn_mining(self: &Arc<Self>) -> JoinHandle<Result<MiningOutcome, LedgerError>> {
        let ledger = Arc::clone(self);
        tokio::task::spawn_blocking(move || ledger.mine_pending_transactions())
    }

    fn mine_locked(&self) -> Result<MiningOutcome, LedgerError> {
        let threshold = self.config.transaction_threshold;
        let pending = self.pool.all()?;

        if pending.is_empty() || pending.len() < threshold {
            debug!(
                "{} pending transactions, {} needed to mine",
                pending.len(),
                threshold
            );
            return Ok(MiningOutcome::BelowThreshold {
                pending: pending.len(),
            });
        }

        let batch: Vec<Transaction> = pending.into_iter().take(threshold).collect();

        let tip = self
            .read_chain()?
            .last()
            .map(|block| (block.index, block.hash.clone()));

        let miner = Miner::new(&self.config.miner_address, self.config.mining_reward);
        let (mut block, stats) = miner.mine_block_detached(tip, self.config.difficulty, batch);
        block.link_transactions();

        self.append_block(block.clone())?;
        self.persist_block(&block)?;

        for tx in &block.transactions {
            self.pool.remove(&tx.hash)?;
            self.settle(tx)?;
        }

        info!(
            "Block {} appended with {} transactions",
            block.index,
            block.tx_count()
        );

        Ok(MiningOutcome::Mined {
            block: Box::new(block),
            stats,
        })
    }

    /// Apply the balance effect of a mined transaction
    ///
    /// Transfers moved their funds at intake, so only rewards change
    /// balances here.
    fn settle(&self, tx: &Transaction) -> Result<(), LedgerError> {
        if tx.is_reward() {
            self.balances.apply_delta(&tx.to, tx.amount as i128)?;
        } else {
            debug!("Transfer {} already settled at intake", tx.hash);
        }
        Ok(())
    }

    fn append_block(&self, block: Block) -> Result<(), LedgerError> {
        let mut chain = self.write_chain()?;
        if let Some(last) = chain.last() {
            if block.previous_hash != last.hash {
                return Err(LedgerError::ChainIntegrity {
                    index: block.index,
                    reason: "chain tip moved while mining".to_string(),
                });
            }
        }
        chain.push(block);
        Ok(())
    }

    fn persist_block(&self, block: &Block) -> Result<(), StoreError> {
        self.store.insert_block(&BlockRecord::from(block))?;

        for (position, tx) in block.transactions.iter().enumerate() {
            self.store
                .insert_transaction(&TransactionRecord::new(tx, &block.hash, position))?;
            if let Some(proof) = block.merkle_tree().proof_at(position) {
                self.store
                    .insert_proof(&ProofRecord::new(&block.hash, &tx.hash, &proof)?)?;
            }
        }

        debug!("Persisted block {} ({})", block.index, block.hash);
        Ok(())
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Validate every block and every link, reporting the first failure
    pub fn validate_chain(&self) -> Result<(), LedgerError> {
        validate_blocks(&self.read_chain()?)
    }

    /// Whether the whole chain is valid; the reason for a failure is logged
    pub fn is_chain_valid(&self) -> bool {
        match self.validate_chain() {
            Ok(()) => true,
            Err(e) => {
                warn!("Chain validation failed: {}", e);
                false
            }
        }
    }

    // =========================================================================
    // Balance audit
    // =========================================================================

    /// Balances implied by the chain, the transfers still pending and the
    /// journaled credits
    pub fn derive_balances(&self) -> Result<BTreeMap<String, u64>, LedgerError> {
        let mut totals: BTreeMap<String, i128> = BTreeMap::new();
        let mut apply = |tx: &Transaction| {
            if let Some(from) = &tx.from {
                *totals.entry(from.clone()).or_default() -= tx.amount as i128;
            }
            *totals.entry(tx.to.clone()).or_default() += tx.amount as i128;
        };

        for block in self.read_chain()?.iter() {
            block.transactions.iter().for_each(&mut apply);
        }
        self.pool.all()?.iter().for_each(&mut apply);

        for credit in self.store.credits()? {
            *totals.entry(credit.address).or_default() += credit.amount as i128;
        }

        totals
            .into_iter()
            .map(|(address, total)| {
                u64::try_from(total)
                    .map(|amount| (address.clone(), amount))
                    .map_err(|_| {
                        LedgerError::PersistenceFailure(StoreError::InvalidData(format!(
                            "derived balance of {} is {}",
                            address, total
                        )))
                    })
            })
            .collect()
    }

    /// Stored balances that differ from the derived ones
    pub fn audit_balances(&self) -> Result<Vec<BalanceMismatch>, LedgerError> {
        let derived_balances = self.derive_balances()?;
        let stored_balances: BTreeMap<String, u64> =
            self.balances.balances()?.into_iter().collect();

        let mut addresses: Vec<&String> = derived_balances
            .keys()
            .chain(stored_balances.keys())
            .collect();
        addresses.sort();
        addresses.dedup();

        Ok(addresses
            .into_iter()
            .filter_map(|address| {
                let stored = stored_balances.get(address).copied().unwrap_or(0);
                let derived = derived_balances.get(address).copied().unwrap_or(0);
                (stored != derived).then(|| BalanceMismatch {
                    address: address.clone(),
                    stored,
                    derived,
                })
            })
            .collect())
    }

    /// Overwrite the balance view with balances derived from the chain
    ///
    /// Returns the number of addresses that changed.
    pub fn rebuild_balances(&self) -> Result<usize, LedgerError> {
        let mismatches = self.audit_balances()?;
        for mismatch in &mismatches {
            self.balances
                .set_balance(&mismatch.address, mismatch.derived)?;
        }
        info!("Rebuilt balances, {} addresses corrected", mismatches.len());
        Ok(mismatches.len())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn len(&self) -> Result<usize, LedgerError> {
        Ok(self.read_chain()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.len()? == 0)
    }

    /// Snapshot of the whole chain
    pub fn blocks(&self) -> Result<Vec<Block>, LedgerError> {
        Ok(self.read_chain()?.clone())
    }

    pub fn latest_block(&self) -> Result<Option<Block>, LedgerError> {
        Ok(self.read_chain()?.last().cloned())
    }

    pub fn block_by_hash(&self, hash: &str) -> Result<Option<Block>, LedgerError> {
        Ok(self.read_chain()?.iter().find(|b| b.hash == hash).cloned())
    }

    /// Inclusion proof for a transaction, from storage or the in-memory tree
    pub fn transaction_proof(
        &self,
        block_hash: &str,
        tx_hash: &str,
    ) -> Result<Option<MerkleProof>, LedgerError> {
        if let Some(record) = self.store.proof(block_hash, tx_hash)? {
            return Ok(Some(record.proof()?));
        }

        Ok(self
            .block_by_hash(block_hash)?
            .and_then(|block| block.merkle_proof(tx_hash).ok()))
    }

    /// Whether `tx_hash` provably belongs to the block `block_hash`
    pub fn verify_inclusion(&self, block_hash: &str, tx_hash: &str) -> bool {
        let block = match self.block_by_hash(block_hash) {
            Ok(Some(block)) => block,
            _ => return false,
        };
        match self.transaction_proof(block_hash, tx_hash) {
            Ok(Some(proof)) => proof.verify(tx_hash, &block.merkle_root),
            _ => false,
        }
    }

    /// Get chain statistics
    pub fn stats(&self) -> Result<ChainStats, LedgerError> {
        let pending_transactions = self.pool.len()?;
        let chain = self.read_chain()?;
        let total_transactions: usize = chain.iter().map(|b| b.transactions.len()).sum();

        Ok(ChainStats {
            height: (chain.len() as u64).saturating_sub(1),
            total_blocks: chain.len() as u64,
            total_transactions: total_transactions as u64,
            pending_transactions,
            difficulty: self.config.difficulty,
            latest_hash: chain.last().map(|b| b.hash.clone()).unwrap_or_default(),
        })
    }
}

/// Check each block on its own and its link to the previous block
fn validate_blocks(blocks: &[Block]) -> Result<(), LedgerError> {
    for (i, block) in blocks.iter().enumerate() {
        let integrity = |reason: String| LedgerError::ChainIntegrity {
            index: i as u64,
            reason,
        };

        if block.index != i as u64 {
            return Err(integrity(format!("stored index is {}", block.index)));
        }

        block.validate().map_err(|e| integrity(e.to_string()))?;

        if i > 0 && block.previous_hash != blocks[i - 1].hash {
            return Err(integrity("previous hash does not match".to_string()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SledCache;
    use crate::crypto::KeyPair;
    use std::sync::{mpsc, Mutex};
    use std::thread;

    fn test_config() -> LedgerConfig {
        LedgerConfig {
            difficulty: 1,
            auto_mine: false,
            ..Default::default()
        }
    }

    fn ledger() -> Blockchain {
        Blockchain::new(test_config(), Collaborators::in_memory()).unwrap()
    }

    /// Parks the first successful acquirer until the test resumes it
    struct GatedLock {
        inner: MemoryCache,
        acquired: Mutex<Option<mpsc::Sender<()>>>,
        resume: Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl MiningLock for GatedLock {
        fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, StoreError> {
            let token = self.inner.try_acquire(key, ttl)?;
            if token.is_some() {
                let acquired = self.acquired.lock().unwrap().take();
                if let Some(acquired) = acquired {
                    acquired.send(()).unwrap();
                    let resume = self.resume.lock().unwrap().take();
                    if let Some(resume) = resume {
                        resume.recv().unwrap();
                    }
                }
            }
            Ok(token)
        }

        fn release(&self, key: &str, token: &LockToken) -> Result<bool, StoreError> {
            self.inner.release(key, token)
        }
    }

    struct OfflinePool;

    impl PendingPool for OfflinePool {
        fn put(&self, _tx: &Transaction) -> Result<bool, StoreError> {
            Err(StoreError::Backend("pool offline".to_string()))
        }

        fn all(&self) -> Result<Vec<Transaction>, StoreError> {
            Ok(Vec::new())
        }

        fn remove(&self, _hash: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    fn funded_account(ledger: &Blockchain, amount: u64) -> KeyPair {
        let kp = KeyPair::generate();
        ledger.credit(&kp.address(), amount).unwrap();
        kp
    }

    fn transfer(from: &KeyPair, to: &str, amount: u64) -> Transaction {
        let mut tx = Transaction::new(Some(from.address()), to, amount);
        tx.sign(from).unwrap();
        tx
    }

    #[test]
    fn test_genesis_scenario() {
        let ledger = ledger();
        assert_eq!(ledger.len().unwrap(), 1);
        assert_eq!(ledger.balance_of(GENESIS_ADDRESS).unwrap(), 1_000_000);
        assert!(ledger.is_chain_valid());

        let genesis = ledger.latest_block().unwrap().unwrap();
        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.tx_count(), 1);
    }

    #[test]
    fn test_accepted_transfer_moves_balances() {
        let ledger = ledger();
        let alice = funded_account(&ledger, 100);
        let bob = KeyPair::generate().address();

        let hash = ledger.add_transaction(transfer(&alice, &bob, 50)).unwrap();

        assert_eq!(ledger.balance_of(&alice.address()).unwrap(), 50);
        assert_eq!(ledger.balance_of(&bob).unwrap(), 50);
        let pending = ledger.pending_transactions().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].hash, hash);
    }

    #[test]
    fn test_insufficient_balance_rejected() {
        let ledger = ledger();
        let alice = funded_account(&ledger, 10);
        let bob = KeyPair::generate().address();

        let err = ledger.add_transaction(transfer(&alice, &bob, 50)).unwrap_err();

        assert!(matches!(
            err,
            LedgerError::InsufficientBalance { have: 10, need: 50, .. }
        ));
        assert_eq!(ledger.balance_of(&alice.address()).unwrap(), 10);
        assert_eq!(ledger.balance_of(&bob).unwrap(), 0);
        assert!(ledger.pending_transactions().unwrap().is_empty());
    }

    #[test]
    fn test_intake_rejections() {
        let ledger = ledger();
        let alice = funded_account(&ledger, 100);

        let reward = Transaction::reward("someone", 10);
        assert!(matches!(
            ledger.add_transaction(reward),
            Err(LedgerError::MalformedTransaction(_))
        ));

        let no_recipient = transfer(&alice, "", 10);
        assert!(matches!(
            ledger.add_transaction(no_recipient),
            Err(LedgerError::MalformedTransaction(_))
        ));

        let unsigned = Transaction::new(Some(alice.address()), "bob", 10);
        assert!(matches!(
            ledger.add_transaction(unsigned),
            Err(LedgerError::InvalidSignature(_))
        ));

        let zero = transfer(&alice, "bob", 0);
        assert!(matches!(
            ledger.add_transaction(zero),
            Err(LedgerError::InvalidAmount(0))
        ));

        let mut forged = transfer(&alice, "bob", 10);
        forged.amount = 90;
        forged.hash = forged.calculate_hash();
        assert!(matches!(
            ledger.add_transaction(forged),
            Err(LedgerError::InvalidSignature(_))
        ));

        assert_eq!(ledger.balance_of(&alice.address()).unwrap(), 100);
    }

    #[test]
    fn test_threshold_mining_scenario() {
        let ledger = ledger();
        let alice = funded_account(&ledger, 100);
        let bob = KeyPair::generate().address();

        let first = ledger.add_transaction(transfer(&alice, &bob, 10)).unwrap();
        let second = ledger.add_transaction(transfer(&alice, &bob, 20)).unwrap();

        let outcome = ledger.mine_pending_transactions().unwrap();
        let block = outcome.block().expect("block should be mined");

        assert_eq!(block.index, 1);
        assert_eq!(block.tx_count(), DEFAULT_TRANSACTION_THRESHOLD + 1);
        assert_eq!(block.transactions[0].hash, first);
        assert_eq!(block.transactions[1].hash, second);
        assert!(block.transactions[2].is_reward());
        assert!(block.hash.starts_with('0'));

        assert_eq!(ledger.len().unwrap(), 2);
        assert!(ledger.pending_transactions().unwrap().is_empty());
        assert_eq!(ledger.balance_of(MINER_ADDRESS).unwrap(), MINING_REWARD);
        assert_eq!(ledger.balance_of(&alice.address()).unwrap(), 70);
        assert_eq!(ledger.balance_of(&bob).unwrap(), 30);
        assert!(ledger.is_chain_valid());
        assert!(ledger.verify_inclusion(&block.hash, &first));
        assert!(ledger.audit_balances().unwrap().is_empty());
    }

    #[test]
    fn test_replayed_transaction_rejected() {
        let ledger = ledger();
        let alice = funded_account(&ledger, 100);
        let tx = transfer(&alice, "bob", 30);

        ledger.add_transaction(tx.clone()).unwrap();
        assert!(matches!(
            ledger.add_transaction(tx),
            Err(LedgerError::DuplicateTransaction(_))
        ));

        assert_eq!(ledger.balance_of(&alice.address()).unwrap(), 70);
        assert_eq!(ledger.balance_of("bob").unwrap(), 30);
        assert_eq!(ledger.pending_transactions().unwrap().len(), 1);
    }

    #[test]
    fn test_mined_transaction_cannot_be_resubmitted() {
        let ledger = ledger();
        let alice = funded_account(&ledger, 100);
        let first = transfer(&alice, "bob", 10);
        ledger.add_transaction(first.clone()).unwrap();
        ledger.add_transaction(transfer(&alice, "bob", 20)).unwrap();
        assert!(ledger.mine_pending_transactions().unwrap().is_mined());

        assert!(matches!(
            ledger.add_transaction(first),
            Err(LedgerError::DuplicateTransaction(_))
        ));
        assert_eq!(ledger.balance_of(&alice.address()).unwrap(), 70);
        assert!(ledger.pending_transactions().unwrap().is_empty());
    }

    #[test]
    fn test_failed_enqueue_restores_balances() {
        let mut collaborators = Collaborators::in_memory();
        collaborators.pool = Arc::new(OfflinePool);
        let ledger = Blockchain::new(test_config(), collaborators).unwrap();
        let alice = funded_account(&ledger, 100);

        assert!(matches!(
            ledger.add_transaction(transfer(&alice, "bob", 40)),
            Err(LedgerError::PersistenceFailure(StoreError::Backend(_)))
        ));
        assert_eq!(ledger.balance_of(&alice.address()).unwrap(), 100);
        assert_eq!(ledger.balance_of("bob").unwrap(), 0);
    }

    #[test]
    fn test_below_threshold_does_not_mine() {
        let ledger = ledger();
        let alice = funded_account(&ledger, 100);
        ledger.add_transaction(transfer(&alice, "bob", 10)).unwrap();

        let outcome = ledger.mine_pending_transactions().unwrap();
        assert!(matches!(
            outcome,
            MiningOutcome::BelowThreshold { pending: 1 }
        ));
        assert_eq!(ledger.len().unwrap(), 1);

        // The lock was released on the early return
        assert!(ledger
            .lock
            .try_acquire(MINING_LOCK_KEY, MINING_LOCK_TTL)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_only_threshold_transactions_are_batched() {
        let ledger = ledger();
        let alice = funded_account(&ledger, 100);
        for amount in 1..=3 {
            ledger.add_transaction(transfer(&alice, "bob", amount)).unwrap();
        }

        let outcome = ledger.mine_pending_transactions().unwrap();
        assert_eq!(outcome.block().unwrap().tx_count(), 3);
        assert_eq!(ledger.pending_transactions().unwrap().len(), 1);
    }

    #[test]
    fn test_auto_mine_on_threshold() {
        let config = LedgerConfig {
            auto_mine: true,
            ..test_config()
        };
        let ledger = Blockchain::new(config, Collaborators::in_memory()).unwrap();
        let alice = funded_account(&ledger, 100);

        ledger.add_transaction(transfer(&alice, "bob", 5)).unwrap();
        assert_eq!(ledger.len().unwrap(), 1);
        ledger.add_transaction(transfer(&alice, "bob", 6)).unwrap();
        assert_eq!(ledger.len().unwrap(), 2);
        assert!(ledger.pending_transactions().unwrap().is_empty());
    }

    #[test]
    fn test_held_lock_makes_mining_a_no_op() {
        let ledger = ledger();
        let alice = funded_account(&ledger, 100);
        ledger.add_transaction(transfer(&alice, "bob", 1)).unwrap();
        ledger.add_transaction(transfer(&alice, "bob", 2)).unwrap();

        let token = ledger
            .lock
            .try_acquire(MINING_LOCK_KEY, MINING_LOCK_TTL)
            .unwrap()
            .unwrap();
        let outcome = ledger.mine_pending_transactions().unwrap();
        assert!(matches!(outcome, MiningOutcome::LockUnavailable));
        assert_eq!(ledger.len().unwrap(), 1);
        assert_eq!(ledger.pending_transactions().unwrap().len(), 2);

        assert!(ledger.lock.release(MINING_LOCK_KEY, &token).unwrap());
        assert!(ledger.mine_pending_transactions().unwrap().is_mined());
    }

    #[test]
    fn test_contending_miner_sees_lock_unavailable() {
        let (acquired_tx, acquired_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel();
        let mut collaborators = Collaborators::in_memory();
        collaborators.lock = Arc::new(GatedLock {
            inner: MemoryCache::new(),
            acquired: Mutex::new(Some(acquired_tx)),
            resume: Mutex::new(Some(resume_rx)),
        });
        let ledger = Arc::new(Blockchain::new(test_config(), collaborators).unwrap());
        let alice = funded_account(&ledger, 100);
        ledger.add_transaction(transfer(&alice, "bob", 1)).unwrap();
        ledger.add_transaction(transfer(&alice, "bob", 2)).unwrap();

        let winner = {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || ledger.mine_pending_transactions().unwrap())
        };
        acquired_rx.recv().unwrap();

        // The winner holds the lock and has not touched anything yet
        let loser = ledger.mine_pending_transactions().unwrap();
        assert!(matches!(loser, MiningOutcome::LockUnavailable));
        assert_eq!(ledger.len().unwrap(), 1);
        assert_eq!(ledger.pending_transactions().unwrap().len(), 2);

        resume_tx.send(()).unwrap();
        assert!(winner.join().unwrap().is_mined());
        assert_eq!(ledger.len().unwrap(), 2);
        assert!(ledger.pending_transactions().unwrap().is_empty());
        assert!(ledger.is_chain_valid());
    }

    #[test]
    fn test_two_ledgers_sharing_a_lock() {
        let lock = Arc::new(MemoryCache::new());
        let mut collaborators = Collaborators::in_memory();
        collaborators.lock = lock.clone();
        let ledger = Blockchain::new(test_config(), collaborators).unwrap();
        let alice = funded_account(&ledger, 100);
        ledger.add_transaction(transfer(&alice, "bob", 1)).unwrap();
        ledger.add_transaction(transfer(&alice, "bob", 2)).unwrap();

        assert!(lock
            .try_acquire(MINING_LOCK_KEY, MINING_LOCK_TTL)
            .unwrap()
            .is_some());
        assert!(matches!(
            ledger.mine_pending_transactions().unwrap(),
            MiningOutcome::LockUnavailable
        ));
    }

    #[tokio::test]
    async fn test_spawn_mining_on_blocking_pool() {
        let ledger = Arc::new(ledger());
        let alice = funded_account(&ledger, 100);
        ledger.add_transaction(transfer(&alice, "bob", 1)).unwrap();
        ledger.add_transaction(transfer(&alice, "bob", 2)).unwrap();

        let outcome = ledger.spawn_mining().await.unwrap().unwrap();
        assert!(outcome.is_mined());
        assert_eq!(ledger.len().unwrap(), 2);
    }

    #[test]
    fn test_tampered_previous_hash_detected() {
        let ledger = ledger();
        let alice = funded_account(&ledger, 100);
        ledger.add_transaction(transfer(&alice, "bob", 1)).unwrap();
        ledger.add_transaction(transfer(&alice, "bob", 2)).unwrap();
        ledger.mine_pending_transactions().unwrap();
        assert!(ledger.is_chain_valid());

        ledger.chain.write().unwrap()[1].previous_hash = "f".repeat(64);
        assert!(!ledger.is_chain_valid());
        assert!(matches!(
            ledger.validate_chain(),
            Err(LedgerError::ChainIntegrity { index: 1, .. })
        ));
    }

    #[test]
    fn test_tampered_transaction_detected() {
        let ledger = ledger();
        let alice = funded_account(&ledger, 100);
        ledger.add_transaction(transfer(&alice, "bob", 1)).unwrap();
        ledger.add_transaction(transfer(&alice, "bob", 2)).unwrap();
        ledger.mine_pending_transactions().unwrap();

        ledger.chain.write().unwrap()[1].transactions[0].amount = 99;
        assert!(!ledger.is_chain_valid());
    }

    #[test]
    fn test_tampered_genesis_detected() {
        let ledger = ledger();
        ledger.chain.write().unwrap()[0].transactions[0].amount = 5;
        assert!(matches!(
            ledger.validate_chain(),
            Err(LedgerError::ChainIntegrity { index: 0, .. })
        ));
    }

    #[test]
    fn test_open_reloads_persisted_chain() {
        let collaborators = Collaborators::in_memory();
        let ledger = Blockchain::new(test_config(), collaborators.clone()).unwrap();
        let alice = funded_account(&ledger, 100);
        ledger.add_transaction(transfer(&alice, "bob", 1)).unwrap();
        ledger.add_transaction(transfer(&alice, "bob", 2)).unwrap();
        let mined = ledger.mine_pending_transactions().unwrap();
        let block_hash = mined.block().unwrap().hash.clone();

        let reopened = Blockchain::open(test_config(), collaborators).unwrap();
        assert_eq!(reopened.len().unwrap(), 2);
        assert!(reopened.is_chain_valid());
        assert_eq!(
            reopened.latest_block().unwrap().unwrap().hash,
            block_hash
        );
    }

    #[test]
    fn test_open_rejects_corrupted_store() {
        let collaborators = Collaborators::in_memory();
        let ledger = Blockchain::new(test_config(), collaborators.clone()).unwrap();
        let genesis = ledger.latest_block().unwrap().unwrap();

        // A second block that does not link to genesis
        let mut orphan = Block::new(
            1,
            "e".repeat(64),
            chrono::Utc::now(),
            vec![Transaction::reward("x", 1)],
            1,
        );
        orphan.mine(1);
        collaborators
            .store
            .insert_block(&BlockRecord::from(&orphan))
            .unwrap();
        for (position, tx) in orphan.transactions.iter().enumerate() {
            collaborators
                .store
                .insert_transaction(&TransactionRecord::new(tx, &orphan.hash, position))
                .unwrap();
        }
        assert_ne!(orphan.previous_hash, genesis.hash);

        assert!(matches!(
            Blockchain::open(test_config(), collaborators),
            Err(LedgerError::ChainIntegrity { index: 1, .. })
        ));
    }

    #[test]
    fn test_open_on_empty_store_creates_genesis() {
        let ledger = Blockchain::open(test_config(), Collaborators::in_memory()).unwrap();
        assert_eq!(ledger.len().unwrap(), 1);
    }

    #[test]
    fn test_credited_account_audits_clean_after_transfer() {
        let ledger = ledger();
        let alice = funded_account(&ledger, 100);
        ledger.add_transaction(transfer(&alice, "bob", 30)).unwrap();

        assert!(ledger.audit_balances().unwrap().is_empty());
        assert_eq!(ledger.rebuild_balances().unwrap(), 0);
        assert_eq!(ledger.balance_of(&alice.address()).unwrap(), 70);
        assert_eq!(ledger.balance_of("bob").unwrap(), 30);
    }

    #[test]
    fn test_balance_audit_and_rebuild() {
        let ledger = ledger();
        let alice = funded_account(&ledger, 40);

        // Drift written behind the ledger's back
        ledger.balances.set_balance(&alice.address(), 5).unwrap();
        ledger.balances.set_balance("ghost", 7).unwrap();

        let drift = ledger.audit_balances().unwrap();
        assert_eq!(
            drift,
            vec![
                BalanceMismatch {
                    address: alice.address(),
                    stored: 5,
                    derived: 40,
                },
                BalanceMismatch {
                    address: "ghost".to_string(),
                    stored: 7,
                    derived: 0,
                },
            ]
        );

        assert_eq!(ledger.rebuild_balances().unwrap(), 2);
        assert_eq!(ledger.balance_of(&alice.address()).unwrap(), 40);
        assert_eq!(ledger.balance_of("ghost").unwrap(), 0);
        assert!(ledger.audit_balances().unwrap().is_empty());
    }

    #[test]
    fn test_proofs_are_persisted() {
        let ledger = ledger();
        let alice = funded_account(&ledger, 100);
        let tx_hash = ledger.add_transaction(transfer(&alice, "bob", 1)).unwrap();
        ledger.add_transaction(transfer(&alice, "bob", 2)).unwrap();
        let outcome = ledger.mine_pending_transactions().unwrap();
        let block = outcome.block().unwrap();

        let stored = ledger.store.proof(&block.hash, &tx_hash).unwrap().unwrap();
        assert!(stored.proof().unwrap().verify(&tx_hash, &block.merkle_root));
        assert!(!ledger.verify_inclusion(&block.hash, "missing"));
    }

    #[test]
    fn test_sled_backed_ledger() {
        let cache = Arc::new(SledCache::temporary().unwrap());
        let collaborators =
            Collaborators::with_cache(Arc::new(FileChainStore::in_memory()), cache);
        let ledger = Blockchain::new(test_config(), collaborators).unwrap();
        let alice = funded_account(&ledger, 100);
        ledger.add_transaction(transfer(&alice, "bob", 30)).unwrap();
        ledger.add_transaction(transfer(&alice, "bob", 31)).unwrap();

        assert!(ledger.mine_pending_transactions().unwrap().is_mined());
        assert_eq!(ledger.balance_of("bob").unwrap(), 61);
        assert_eq!(ledger.stats().unwrap().total_blocks, 2);
    }
}
