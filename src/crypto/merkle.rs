//! Merkle tree implementation for transaction verification
//!
//! Leaves are hex transaction hashes. Each internal node is the SHA-256 of
//! the concatenated hex strings of its children. When a level has an odd
//! number of nodes, the last node is paired with a copy of itself; both
//! tree construction and proof verification rely on that rule.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::hash::{sha256_hex, ZERO_HASH};

/// Merkle tree errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MerkleError {
    #[error("Leaf not found in tree: {0}")]
    NotFound(String),
}

/// Which side of the running hash a sibling sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// One step of an inclusion proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: String,
    pub side: Side,
}

/// Proof that a leaf is included under a merkle root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Position of the leaf in the original list
    pub leaf_index: usize,
    /// Sibling hashes from leaf to root
    pub steps: Vec<ProofStep>,
}

impl MerkleProof {
    /// Verify the proof against a root hash
    pub fn verify(&self, leaf_hash: &str, root_hash: &str) -> bool {
        verify_proof(leaf_hash, &self.steps, root_hash)
    }
}

/// Hash two child nodes into their parent
pub fn hash_pair(left: &str, right: &str) -> String {
    let mut data = String::with_capacity(left.len() + right.len());
    data.push_str(left);
    data.push_str(right);
    sha256_hex(data.as_bytes())
}

/// Recombine `leaf_hash` with each proof step and compare against `root_hash`
pub fn verify_proof(leaf_hash: &str, steps: &[ProofStep], root_hash: &str) -> bool {
    let computed = steps
        .iter()
        .fold(leaf_hash.to_string(), |current, step| match step.side {
            Side::Left => hash_pair(&step.hash, &current),
            Side::Right => hash_pair(&current, &step.hash),
        });
    computed == root_hash
}

/// A merkle tree kept level by level, leaves first and root last
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MerkleTree {
    levels: Vec<Vec<String>>,
}

impl MerkleTree {
    /// Build a merkle tree from an ordered list of leaf hashes
    pub fn new(leaves: &[String]) -> Self {
        if leaves.is_empty() {
            return Self { levels: Vec::new() };
        }

        let mut levels = vec![leaves.to_vec()];

        loop {
            let current = &levels[levels.len() - 1];
            if current.len() <= 1 {
                break;
            }

            let next: Vec<String> = current
                .chunks(2)
                .map(|chunk| match chunk {
                    [left, right] => hash_pair(left, right),
                    [last] => hash_pair(last, last),
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect();

            levels.push(next);
        }

        Self { levels }
    }

    /// The merkle root, or the zero hash for an empty tree
    pub fn root(&self) -> &str {
        self.levels
            .last()
            .and_then(|level| level.first())
            .map(String::as_str)
            .unwrap_or(ZERO_HASH)
    }

    /// Number of leaves the tree was built from
    pub fn leaf_count(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// All levels, leaves first
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Generate a proof for the leaf at the given position
    pub fn proof_at(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaf_count() {
            return None;
        }

        let mut steps = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut idx = index;

        for level in &self.levels[..self.levels.len() - 1] {
            let step = if idx % 2 == 0 {
                // Odd tail pairs with itself
                let sibling = level.get(idx + 1).unwrap_or(&level[idx]);
                ProofStep {
                    hash: sibling.clone(),
                    side: Side::Right,
                }
            } else {
                ProofStep {
                    hash: level[idx - 1].clone(),
                    side: Side::Left,
                }
            };
            steps.push(step);
            idx /= 2;
        }

        Some(MerkleProof {
            leaf_index: index,
            steps,
        })
    }

    /// Generate a proof for the first leaf equal to `leaf_hash`
    pub fn proof(&self, leaf_hash: &str) -> Result<MerkleProof, MerkleError> {
        self.levels
            .first()
            .and_then(|leaves| leaves.iter().position(|leaf| leaf == leaf_hash))
            .and_then(|index| self.proof_at(index))
            .ok_or_else(|| MerkleError::NotFound(leaf_hash.to_string()))
    }

    /// Check a proof against this tree's root
    pub fn verify(&self, leaf_hash: &str, proof: &MerkleProof) -> bool {
        proof.verify(leaf_hash, self.root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| sha256_hex(format!("tx{}", i).as_bytes()))
            .collect()
    }

    #[test]
    fn test_empty_tree_root_is_zero_hash() {
        let tree = MerkleTree::new(&[]);
        assert_eq!(tree.root(), ZERO_HASH);
        assert!(tree.is_empty());
        assert_eq!(
            tree.proof(ZERO_HASH),
            Err(MerkleError::NotFound(ZERO_HASH.to_string()))
        );
    }

    #[test]
    fn test_single_leaf_is_root() {
        let hashes = leaves(1);
        let tree = MerkleTree::new(&hashes);
        assert_eq!(tree.root(), hashes[0]);

        let proof = tree.proof(&hashes[0]).unwrap();
        assert!(proof.steps.is_empty());
        assert!(tree.verify(&hashes[0], &proof));
    }

    #[test]
    fn test_two_leaves() {
        let hashes = leaves(2);
        let tree = MerkleTree::new(&hashes);
        assert_eq!(tree.root(), hash_pair(&hashes[0], &hashes[1]));
    }

    #[test]
    fn test_odd_level_duplicates_last_node() {
        let hashes = leaves(3);
        let tree = MerkleTree::new(&hashes);

        let left = hash_pair(&hashes[0], &hashes[1]);
        let right = hash_pair(&hashes[2], &hashes[2]);
        assert_eq!(tree.root(), hash_pair(&left, &right));

        let proof = tree.proof_at(2).unwrap();
        assert_eq!(
            proof.steps,
            vec![
                ProofStep {
                    hash: hashes[2].clone(),
                    side: Side::Right
                },
                ProofStep {
                    hash: left,
                    side: Side::Left
                },
            ]
        );
    }

    #[test]
    fn test_every_leaf_proves_for_many_sizes() {
        for n in 1..=9 {
            let hashes = leaves(n);
            let tree = MerkleTree::new(&hashes);
            for (i, leaf) in hashes.iter().enumerate() {
                let proof = tree.proof_at(i).unwrap();
                assert!(
                    verify_proof(leaf, &proof.steps, tree.root()),
                    "leaf {} of {} failed",
                    i,
                    n
                );
            }
        }
    }

    #[test]
    fn test_changing_a_leaf_changes_root() {
        let mut hashes = leaves(5);
        let original = MerkleTree::new(&hashes).root().to_string();
        hashes[3] = sha256_hex(b"different");
        assert_ne!(MerkleTree::new(&hashes).root(), original);
    }

    #[test]
    fn test_duplicate_leaves_are_positional() {
        let dup = sha256_hex(b"same");
        let hashes = vec![dup.clone(), sha256_hex(b"other"), dup.clone()];
        let tree = MerkleTree::new(&hashes);

        assert_eq!(tree.proof(&dup).unwrap().leaf_index, 0);
        let last = tree.proof_at(2).unwrap();
        assert!(tree.verify(&dup, &last));
    }

    #[test]
    fn test_verify_rejects_wrong_inputs() {
        let hashes = leaves(4);
        let tree = MerkleTree::new(&hashes);
        let proof = tree.proof_at(1).unwrap();

        assert!(!proof.verify(&hashes[2], tree.root()));
        assert!(!proof.verify(&hashes[1], ZERO_HASH));
        assert!(!verify_proof("garbage", &[], tree.root()));
    }
}
