//! Merkle Tree Commitments
//!
//! Binary SHA-256 Merkle tree over ordered leaves, with inclusion proofs.
//! Leaf and internal hashes are domain-separated by a prefix byte, and a
//! level of odd size duplicates its last node. The padding rule is part of
//! the verification contract: a verifier recomputes with the same rule.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::core::hash::{digest_hex, bytes_hex, empty_digest, Digest};

/// Prefix byte hashed ahead of leaf bytes.
const LEAF_PREFIX: u8 = 0x00;

/// Prefix byte hashed ahead of concatenated child digests.
const NODE_PREFIX: u8 = 0x01;

/// Merkle errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MerkleError {
    /// Requested a proof for a leaf index past the end of the tree.
    #[error("leaf index {index} out of range for {leaves} leaves")]
    OutOfRange {
        /// Requested index.
        index: u64,
        /// Number of leaves in the tree.
        leaves: u64,
    },

    /// Proofs over the empty tree are not permitted.
    #[error("empty tree has no proofs")]
    EmptyTree,
}

/// Which side of the running hash a sibling sits on during verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// Sibling is hashed to the left of the running hash.
    #[serde(rename = "L")]
    Left,
    /// Sibling is hashed to the right of the running hash.
    #[serde(rename = "R")]
    Right,
}

/// One step of a Merkle path: sibling digest plus its side.
///
/// Serializes as a two-element array `[hex, "L"|"R"]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sibling(#[serde(with = "digest_hex")] pub Digest, pub Side);

/// Merkle inclusion proof.
///
/// Carries the raw leaf bytes so a verifier that cannot reconstruct leaves
/// (the grid scheme keeps its seed private) can still fold the path. The
/// root being proven against is supplied externally by the verifier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Index of the leaf this proof is for.
    pub leaf_index: u64,
    /// Raw leaf bytes, hex on the wire.
    #[serde(with = "bytes_hex")]
    pub leaf_value: Vec<u8>,
    /// Sibling path from leaf level to just below the root.
    pub siblings: Vec<Sibling>,
}

/// Binary Merkle tree retaining the raw leaves for proof generation.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    leaves: Vec<Vec<u8>>,
    /// levels[0] holds the leaf hashes, the last level the single root.
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    /// Build a tree from ordered leaf byte strings.
    pub fn from_leaves<T: AsRef<[u8]>>(leaves: &[T]) -> Self {
        let leaves: Vec<Vec<u8>> = leaves.iter().map(|l| l.as_ref().to_vec()).collect();
        let levels = build_levels(&leaves);
        Self { leaves, levels }
    }

    /// Root digest. The empty tree's root is the digest of the empty string.
    pub fn root(&self) -> Digest {
        match self.levels.last().and_then(|level| level.first()) {
            Some(root) => *root,
            None => empty_digest(),
        }
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Generate an inclusion proof for the leaf at `index`.
    pub fn prove(&self, index: usize) -> Result<MerkleProof, MerkleError> {
        if self.leaves.is_empty() {
            return Err(MerkleError::EmptyTree);
        }
        if index >= self.leaves.len() {
            return Err(MerkleError::OutOfRange {
                index: index as u64,
                leaves: self.leaves.len() as u64,
            });
        }

        let mut siblings = Vec::new();
        let mut current = index;

        // Walk every level below the root, emitting the sibling that the
        // verifier must fold in at that level.
        for level in &self.levels[..self.levels.len().saturating_sub(1)] {
            let sibling_index = current ^ 1;
            if sibling_index < level.len() {
                let side = if sibling_index < current {
                    Side::Left
                } else {
                    Side::Right
                };
                siblings.push(Sibling(level[sibling_index], side));
            } else {
                // Odd level: the last node is duplicated as its own sibling.
                siblings.push(Sibling(level[current], Side::Right));
            }
            current /= 2;
        }

        Ok(MerkleProof {
            leaf_index: index as u64,
            leaf_value: self.leaves[index].clone(),
            siblings,
        })
    }

    /// Verify an inclusion proof against an externally supplied root.
    ///
    /// `leaf_count` is the verifier's knowledge of the tree size (for the
    /// grid scheme it follows from the published grid dimensions). A proof
    /// whose path length does not match is rejected before any hashing.
    pub fn verify(root: &Digest, proof: &MerkleProof, leaf_count: usize) -> bool {
        if leaf_count == 0 {
            return false;
        }
        if proof.leaf_index >= leaf_count as u64 {
            return false;
        }
        if proof.siblings.len() != proof_depth(leaf_count) {
            return false;
        }

        let mut current = hash_leaf(&proof.leaf_value);
        for Sibling(sibling, side) in &proof.siblings {
            current = match side {
                Side::Left => hash_nodes(sibling, &current),
                Side::Right => hash_nodes(&current, sibling),
            };
        }

        current == *root
    }
}

/// Number of path steps in any proof over a tree of `leaf_count` leaves.
pub fn proof_depth(leaf_count: usize) -> usize {
    let mut depth = 0;
    let mut width = leaf_count;
    while width > 1 {
        width = width.div_ceil(2);
        depth += 1;
    }
    depth
}

fn build_levels(leaves: &[Vec<u8>]) -> Vec<Vec<Digest>> {
    if leaves.is_empty() {
        return Vec::new();
    }

    let mut levels = vec![leaves.iter().map(|l| hash_leaf(l)).collect::<Vec<_>>()];

    while levels.last().map(Vec::len) != Some(1) {
        let current = levels.last().expect("at least one level");
        let mut next = Vec::with_capacity(current.len().div_ceil(2));
        for pair in current.chunks(2) {
            let left = &pair[0];
            let right = if pair.len() > 1 { &pair[1] } else { left };
            next.push(hash_nodes(left, right));
        }
        levels.push(next);
    }

    levels
}

/// Hash leaf bytes with domain separation.
fn hash_leaf(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash two child digests with domain separation.
fn hash_nodes(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}
