//! Mining module for block assembly and proof-of-work search

pub mod miner;

pub use miner::{Miner, MiningOutcome, MiningStats};
