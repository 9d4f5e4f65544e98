//! Cryptographic utilities for the ledger
//!
//! This module provides:
//! - SHA-256 hashing and the difficulty predicate
//! - ECDSA key management (secp256k1)
//! - Merkle trees and inclusion proofs

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{leading_zero_nibbles, meets_difficulty, sha256, sha256_hex, ZERO_HASH};
pub use keys::{
    is_private_key_hex, public_key_from_hex, sign_message, verify_signature, KeyError, KeyPair,
    PRIVATE_KEY_HEX_LEN,
};
pub use merkle::{
    hash_pair, verify_proof, MerkleError, MerkleProof, MerkleTree, ProofStep, Side,
};
