//! Cryptographic hashing utilities for the ledger
//!
//! Every digest in the system (transaction hashes, block hashes and
//! merkle nodes) goes through the same SHA-256 function so that proofs
//! stay portable between components.

use sha2::{Digest, Sha256};

/// Hex-encoded all-zero digest, used as the empty merkle root and as the
/// previous hash of the genesis block
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Computes SHA-256 hash and returns it as a hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Counts the leading `'0'` characters of a hex digest
pub fn leading_zero_nibbles(hash_hex: &str) -> usize {
    hash_hex.chars().take_while(|c| *c == '0').count()
}

/// Checks if a hex hash meets the difficulty target
/// The hash must start with at least `difficulty` zero nibbles
pub fn meets_difficulty(hash_hex: &str, difficulty: u32) -> bool {
    leading_zero_nibbles(hash_hex) >= difficulty as usize
}
