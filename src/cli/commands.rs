//! CLI commands for the ledger
//!
//! Implements all command handlers for the CLI interface.

use crate::cache::SledCache;
use crate::core::{Blockchain, Collaborators, LedgerConfig};
use crate::crypto::is_private_key_hex;
use crate::mining::MiningOutcome;
use crate::storage::{FileChainStore, StorageConfig};
use crate::wallet::{Wallet, WalletManager};
use std::path::PathBuf;
use std::sync::Arc;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Application state
pub struct AppState {
    pub blockchain: Blockchain,
    pub cache: Arc<SledCache>,
    pub wallet_manager: WalletManager,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Open the chain store, cache and wallets under `data_dir`
    pub fn new(data_dir: PathBuf, config: LedgerConfig) -> CliResult<Self> {
        let storage_config = StorageConfig {
            data_dir: data_dir.clone(),
            ..Default::default()
        };

        let store = Arc::new(FileChainStore::open(&storage_config)?);
        let cache = Arc::new(SledCache::open(&storage_config.cache_path())?);
        let wallet_manager = WalletManager::new(&storage_config.wallets_path())?;

        let collaborators = Collaborators::with_cache(store, cache.clone());
        let blockchain = Blockchain::open(config, collaborators)?;

        Ok(Self {
            blockchain,
            cache,
            wallet_manager,
            data_dir,
        })
    }

    /// Flush cache state to disk
    pub fn save(&self) -> CliResult<()> {
        self.cache.flush()?;
        Ok(())
    }
}

/// Create a new wallet
pub fn cmd_wallet_new(state: &AppState) -> CliResult<()> {
    let wallet = state.wallet_manager.create_wallet()?;

    println!("🔐 New wallet created!");
    println!("   📍 Address: {}", wallet.address());
    println!("   🔑 Private Key: {}", wallet.private_key());
    println!("\n   ⚠️  IMPORTANT: Your private key is stored in the wallets directory.");
    println!("   Back up this directory to avoid losing access to your funds!");

    Ok(())
}

/// List all wallets
pub fn cmd_wallet_list(state: &AppState) -> CliResult<()> {
    let addresses = state.wallet_manager.list_wallets()?;

    if addresses.is_empty() {
        println!("📭 No wallets found. Create one with: ledger wallet new");
        return Ok(());
    }

    println!("📋 Wallets:");
    for address in &addresses {
        let balance = state.blockchain.balance_of(address)?;
        println!("   {} - {} coins", address, balance);
    }

    Ok(())
}

/// Sign a transfer with the given private key and submit it
pub fn cmd_send(
    state: &AppState,
    from: &str,
    private_key: &str,
    to: &str,
    amount: u64,
) -> CliResult<String> {
    if !is_private_key_hex(private_key) {
        return Err("private key must be exactly 64 hex characters".into());
    }
    if amount == 0 {
        return Err("amount must be positive".into());
    }

    let wallet = Wallet::from_private_key(private_key)?;
    if wallet.address() != from {
        return Err(format!("private key does not belong to {}", from).into());
    }

    let tx = wallet.create_transfer(to, amount)?;
    let hash = state.blockchain.add_transaction(tx)?;
    state.save()?;

    println!("📤 Transaction accepted:");
    println!("   Hash: {}", hash);
    println!("   From: {}", from);
    println!("   To: {}", to);
    println!("   Amount: {} coins", amount);

    Ok(hash)
}

/// Print every block with its transaction count
pub fn cmd_chain(state: &AppState) -> CliResult<()> {
    let stats = state.blockchain.stats()?;

    println!("⛓️  Blockchain");
    for block in state.blockchain.blocks()? {
        println!(
            "   #{} | {} | {} tx",
            block.index,
            &block.hash[..16],
            block.tx_count()
        );
    }
    println!("   ├─ Total transactions: {}", stats.total_transactions);
    println!("   ├─ Pending: {}", stats.pending_transactions);
    println!("   └─ Difficulty: {}", stats.difficulty);

    Ok(())
}

/// Credit an address directly
pub fn cmd_credit(state: &AppState, address: &str, amount: u64) -> CliResult<()> {
    let balance = state.blockchain.credit(address, amount)?;
    state.save()?;
    println!("💰 Credited {} coins, new balance {}", amount, balance);
    Ok(())
}

/// Show the balance of an address
pub fn cmd_balance(state: &AppState, address: &str) -> CliResult<()> {
    let balance = state.blockchain.balance_of(address)?;
    println!("💰 Balance for {}", address);
    println!("   Total: {} coins", balance);
    Ok(())
}

/// Run one round of the mining protocol
pub fn cmd_mine(state: &AppState) -> CliResult<()> {
    match state.blockchain.mine_pending_transactions()? {
        MiningOutcome::Mined { block, stats } => {
            println!("⛏️  Block {} mined!", block.index);
            println!("   ├─ Hash: {}", &block.hash[..16]);
            println!("   ├─ Transactions: {}", block.tx_count());
            println!("   ├─ Time: {}ms", stats.time_ms);
            println!("   ├─ Attempts: {}", stats.hash_attempts);
            println!("   └─ Hash rate: {:.2} H/s", stats.hash_rate);
        }
        MiningOutcome::LockUnavailable => {
            println!("🔒 Another miner holds the mining lock");
        }
        MiningOutcome::BelowThreshold { pending } => {
            println!(
                "⏳ {} pending transaction(s), {} needed to mine",
                pending,
                state.blockchain.config().transaction_threshold
            );
        }
    }
    state.save()?;

    Ok(())
}

/// Validate the blockchain
pub fn cmd_validate(state: &AppState) -> CliResult<()> {
    println!("🔍 Validating blockchain...");

    match state.blockchain.validate_chain() {
        Ok(()) => {
            println!("✅ Blockchain is valid!");
            println!("   {} blocks verified", state.blockchain.len()?);
        }
        Err(e) => {
            println!("❌ Blockchain validation FAILED!");
            println!("   {}", e);
        }
    }

    Ok(())
}

/// Compare stored balances with the chain, optionally rewriting them
pub fn cmd_audit(state: &AppState, rebuild: bool) -> CliResult<()> {
    let mismatches = state.blockchain.audit_balances()?;

    if mismatches.is_empty() {
        println!("✅ Balances match the chain");
        return Ok(());
    }

    println!("⚠️  {} balance(s) differ from the chain:", mismatches.len());
    for m in &mismatches {
        println!("   {} stored {} derived {}", m.address, m.stored, m.derived);
    }

    if rebuild {
        let changed = state.blockchain.rebuild_balances()?;
        state.save()?;
        println!("🔧 Rebuilt {} balance(s)", changed);
    }

    Ok(())
}

/// Print and check the Merkle inclusion proof of a transaction
pub fn cmd_proof(state: &AppState, block_hash: &str, tx_hash: &str) -> CliResult<bool> {
    let Some(proof) = state.blockchain.transaction_proof(block_hash, tx_hash)? else {
        println!("❌ No proof for {} in block {}", tx_hash, block_hash);
        return Ok(false);
    };

    println!("🌳 Merkle proof (leaf {}):", proof.leaf_index);
    for step in &proof.steps {
        println!("   {:?} {}", step.side, step.hash);
    }

    let included = state.blockchain.verify_inclusion(block_hash, tx_hash);
    if included {
        println!("✅ Transaction is included in the block");
    } else {
        println!("❌ Proof does not match the block's merkle root");
    }

    Ok(included)
}

/// Show pending transactions
pub fn cmd_pending(state: &AppState) -> CliResult<()> {
    let pending = state.blockchain.pending_transactions()?;
    println!("📬 Pending transactions: {}", pending.len());

    for tx in pending.iter().take(10) {
        println!(
            "   └─ {} | {} -> {} | {}",
            &tx.hash[..16],
            tx.from.as_deref().unwrap_or("reward"),
            tx.to,
            tx.amount
        );
    }

    Ok(())
}
