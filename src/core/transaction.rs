//! Transaction handling for the ledger
//!
//! An account-model value transfer signed with the sender's secp256k1 key.
//! Reward and genesis transactions have no sender and carry no signature.

use crate::crypto::{public_key_from_hex, sha256_hex, verify_signature, KeyError, KeyPair};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Transaction-related errors
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Signing key does not match sender {0}")]
    Authorization(String),
    #[error("Reward transactions cannot be signed")]
    RewardNotSignable,
    #[error("Crypto error: {0}")]
    CryptoError(#[from] KeyError),
}

// =============================================================================
// Transaction
// =============================================================================

/// A signed value transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender address (public key hex), `None` for rewards
    pub from: Option<String>,
    /// Recipient address
    pub to: String,
    /// Amount transferred
    pub amount: u64,
    /// Creation time, fixed at construction
    pub timestamp: DateTime<Utc>,
    /// Hex compact ECDSA signature over `hash`
    pub signature: Option<String>,
    /// Content hash of (from, to, amount, timestamp)
    pub hash: String,
    /// Hash of the containing block once mined
    #[serde(default)]
    pub block_hash: Option<String>,
}

/// The part of a transaction that is committed to by the block hash
///
/// `block_hash` is left out since it is only known after mining.
#[derive(Serialize)]
pub(crate) struct TransactionBody<'a> {
    from: Option<&'a str>,
    to: &'a str,
    amount: u64,
    timestamp: i64,
    signature: Option<&'a str>,
    hash: &'a str,
}

impl Transaction {
    /// Create a new unsigned transaction stamped with the current time
    pub fn new(from: Option<String>, to: impl Into<String>, amount: u64) -> Self {
        Self::with_timestamp(from, to, amount, Utc::now())
    }

    /// Create a new unsigned transaction with an explicit timestamp
    pub fn with_timestamp(
        from: Option<String>,
        to: impl Into<String>,
        amount: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut tx = Self {
            from,
            to: to.into(),
            amount,
            timestamp,
            signature: None,
            hash: String::new(),
            block_hash: None,
        };
        tx.hash = tx.calculate_hash();
        tx
    }

    /// Create a reward (or genesis) transaction with no sender
    pub fn reward(recipient: impl Into<String>, amount: u64) -> Self {
        Self::new(None, recipient, amount)
    }

    /// Whether this is a reward transaction
    pub fn is_reward(&self) -> bool {
        self.from.is_none()
    }

    /// Recompute the content hash from the current fields
    pub fn calculate_hash(&self) -> String {
        let data = format!(
            "{}|{}|{}|{}",
            self.from.as_deref().unwrap_or(""),
            self.to,
            self.amount,
            self.timestamp.timestamp_millis()
        );
        sha256_hex(data.as_bytes())
    }

    /// Whether the stored hash still matches the content
    pub fn has_valid_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    pub(crate) fn body(&self) -> TransactionBody<'_> {
        TransactionBody {
            from: self.from.as_deref(),
            to: &self.to,
            amount: self.amount,
            timestamp: self.timestamp.timestamp_millis(),
            signature: self.signature.as_deref(),
            hash: &self.hash,
        }
    }

    /// Sign the content hash with the sender's key pair
    pub fn sign(&mut self, key_pair: &KeyPair) -> Result<(), TransactionError> {
        let from = self.from.as_deref().ok_or(TransactionError::RewardNotSignable)?;

        let public_key_hex = key_pair.public_key_hex();
        if from != public_key_hex {
            return Err(TransactionError::Authorization(from.to_string()));
        }

        self.hash = self.calculate_hash();
        let digest = hex::decode(&self.hash).map_err(|_| KeyError::InvalidSignature)?;
        let signature = key_pair.sign(&digest)?;
        self.signature = Some(hex::encode(signature));
        Ok(())
    }

    /// Check the signature against the sender and the recomputed content hash
    ///
    /// Reward transactions are always valid. Malformed keys or signatures
    /// are logged and reported as invalid.
    pub fn is_valid(&self) -> bool {
        let Some(from) = self.from.as_deref() else {
            return true;
        };

        let Some(signature) = self.signature.as_deref() else {
            debug!("Transaction {} has no signature", self.hash);
            return false;
        };

        match self.verify_with(from, signature) {
            Ok(valid) => valid,
            Err(e) => {
                warn!("Transaction {} failed signature check: {}", self.hash, e);
                false
            }
        }
    }

    fn verify_with(&self, from: &str, signature: &str) -> Result<bool, KeyError> {
        let public_key = public_key_from_hex(from)?;
        let signature = hex::decode(signature).map_err(|_| KeyError::InvalidSignature)?;
        let digest =
            hex::decode(self.calculate_hash()).map_err(|_| KeyError::InvalidSignature)?;
        verify_signature(&public_key, &digest, &signature)
    }
}
