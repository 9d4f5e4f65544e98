//! Proof-of-work ledger CLI
//!
//! A command-line interface for a single-node ledger.

use clap::{Parser, Subcommand};
use pow_ledger::cli::{self, AppState};
use pow_ledger::core::LedgerConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ledger")]
#[command(version = "0.1.0")]
#[command(about = "A single-node proof-of-work ledger", long_about = None)]
struct Cli {
    /// Data directory for chain, cache and wallet storage
    #[arg(short, long, default_value = ".ledger_data")]
    data_dir: PathBuf,

    /// Mining difficulty (number of leading zero hex digits)
    #[arg(long)]
    difficulty: Option<u32>,

    /// Pending transactions needed before a block is mined
    #[arg(long)]
    threshold: Option<usize>,

    /// Address receiving mining rewards
    #[arg(long)]
    miner: Option<String>,

    /// Do not mine automatically when the pending pool is full
    #[arg(long)]
    no_auto_mine: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wallet operations
    Wallet {
        #[command(subcommand)]
        action: WalletCommands,
    },

    /// Send coins to an address
    Send {
        /// Sender's address (public key hex)
        #[arg(short, long)]
        from: String,

        /// Sender's private key (64 hex characters)
        #[arg(short, long)]
        private_key: String,

        /// Recipient's address
        #[arg(short, long)]
        to: String,

        /// Amount to send
        #[arg(short, long)]
        amount: u64,
    },

    /// Show every block with its transaction count
    Chain,

    /// Credit coins to an address
    Credit {
        #[arg(short, long)]
        address: String,

        #[arg(short = 'n', long)]
        amount: u64,
    },

    /// Show the balance of an address
    Balance {
        #[arg(short, long)]
        address: String,
    },

    /// Mine pending transactions
    Mine,

    /// Validate the blockchain
    Validate,

    /// Compare stored balances with the chain
    Audit {
        /// Overwrite stored balances with the derived ones
        #[arg(long)]
        rebuild: bool,
    },

    /// Show the Merkle proof of a transaction
    Proof {
        #[arg(short, long)]
        block: String,

        #[arg(short, long)]
        tx: String,
    },

    /// Show pending transactions
    Pending,
}

#[derive(Subcommand)]
enum WalletCommands {
    /// Create a new wallet
    New,

    /// List all wallets
    List,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = LedgerConfig::default();
    if let Some(difficulty) = cli.difficulty {
        config.difficulty = difficulty;
    }
    if let Some(threshold) = cli.threshold {
        config.transaction_threshold = threshold;
    }
    if let Some(miner) = cli.miner {
        config.miner_address = miner;
    }
    config.auto_mine = !cli.no_auto_mine;

    let state = AppState::new(cli.data_dir, config)?;

    match cli.command {
        Commands::Wallet { action } => match action {
            WalletCommands::New => {
                cli::cmd_wallet_new(&state)?;
            }
            WalletCommands::List => {
                cli::cmd_wallet_list(&state)?;
            }
        },

        Commands::Send {
            from,
            private_key,
            to,
            amount,
        } => {
            cli::cmd_send(&state, &from, &private_key, &to, amount)?;
        }

        Commands::Chain => {
            cli::cmd_chain(&state)?;
        }

        Commands::Credit { address, amount } => {
            cli::cmd_credit(&state, &address, amount)?;
        }

        Commands::Balance { address } => {
            cli::cmd_balance(&state, &address)?;
        }

        Commands::Mine => {
            cli::cmd_mine(&state)?;
        }

        Commands::Validate => {
            cli::cmd_validate(&state)?;
        }

        Commands::Audit { rebuild } => {
            cli::cmd_audit(&state, rebuild)?;
        }

        Commands::Proof { block, tx } => {
            cli::cmd_proof(&state, &block, &tx)?;
        }

        Commands::Pending => {
            cli::cmd_pending(&state)?;
        }
    }

    Ok(())
}
