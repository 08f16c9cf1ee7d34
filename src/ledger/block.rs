//! Blocks and Sealing
//!
//! A block binds an ordered batch of transactions to its predecessor. The
//! block hash covers the header fields plus the Merkle root of the
//! transaction digests, and must carry a configured number of leading zero
//! bits. The difficulty is a local tamper cost, not a consensus race, so
//! the default is tiny and zero is permitted.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::canonical::{canonical_bytes, CanonicalError};
use crate::core::hash::{digest_hex, leading_zero_bits, sha256, to_hex, Digest};
use crate::proof::merkle::MerkleTree;
use crate::ledger::transaction::Transaction;

/// One block of the hash chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Position in the chain; the genesis block is index 0.
    pub index: u64,
    /// Hash of the previous block; all zero for genesis.
    #[serde(with = "digest_hex")]
    pub prev_hash: Digest,
    /// Transactions sealed into this block, in append order.
    pub transactions: Vec<Transaction>,
    /// Seal time, integer milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Work counter found during sealing.
    pub nonce: u64,
    /// Header hash meeting the difficulty.
    #[serde(with = "digest_hex")]
    pub hash: Digest,
}

impl Block {
    /// Seal a block: find the nonce whose header hash meets `difficulty_bits`
    /// leading zero bits. Deterministic in contents plus nonce.
    pub fn seal(
        index: u64,
        prev_hash: Digest,
        transactions: Vec<Transaction>,
        timestamp: u64,
        difficulty_bits: u32,
    ) -> Result<Self, CanonicalError> {
        let tx_root = transaction_root(&transactions)?;

        let mut nonce = 0u64;
        let hash = loop {
            let candidate = header_hash(index, &prev_hash, &tx_root, timestamp, nonce)?;
            if leading_zero_bits(&candidate) >= difficulty_bits {
                break candidate;
            }
            nonce += 1;
        };

        Ok(Self {
            index,
            prev_hash,
            transactions,
            timestamp,
            nonce,
            hash,
        })
    }

    /// Recompute the header hash from current contents.
    pub fn compute_hash(&self) -> Result<Digest, CanonicalError> {
        let tx_root = transaction_root(&self.transactions)?;
        header_hash(
            self.index,
            &self.prev_hash,
            &tx_root,
            self.timestamp,
            self.nonce,
        )
    }

    /// Whether the stored hash meets the difficulty.
    pub fn meets_difficulty(&self, difficulty_bits: u32) -> bool {
        leading_zero_bits(&self.hash) >= difficulty_bits
    }
}

/// Merkle root over the digests of an ordered transaction batch.
pub fn transaction_root(transactions: &[Transaction]) -> Result<Digest, CanonicalError> {
    let mut leaves = Vec::with_capacity(transactions.len());
    for tx in transactions {
        leaves.push(tx.digest()?.to_vec());
    }
    Ok(MerkleTree::from_leaves(&leaves).root())
}

fn header_hash(
    index: u64,
    prev_hash: &Digest,
    tx_root: &Digest,
    timestamp: u64,
    nonce: u64,
) -> Result<Digest, CanonicalError> {
    let header = canonical_bytes(&json!({
        "index": index,
        "nonce": nonce,
        "prev_hash": to_hex(prev_hash),
        "timestamp": timestamp,
        "tx_root": to_hex(tx_root),
    }))?;
    Ok(sha256(&header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::ZERO_DIGEST;
    use crate::core::identity::Identity;
    use crate::ledger::transaction::MoveType;

    fn sample_txs() -> Vec<Transaction> {
        let identity = Identity::from_seed(b"block-test").unwrap();
        (1..=3)
            .map(|n| {
                Transaction::signed(
                    &identity,
                    MoveType::Action,
                    json!({"n": n}),
                    1_700_000_000_000 + n,
                    n,
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_seal_meets_difficulty() {
        let block = Block::seal(1, ZERO_DIGEST, sample_txs(), 1_700_000_000_000, 8).unwrap();
        assert!(block.meets_difficulty(8));
        assert_eq!(block.compute_hash().unwrap(), block.hash);
    }

    #[test]
    fn test_zero_difficulty_seals_first_try() {
        let block = Block::seal(1, ZERO_DIGEST, vec![], 1_700_000_000_000, 0).unwrap();
        assert_eq!(block.nonce, 0);
    }

    #[test]
    fn test_sealing_is_deterministic() {
        let a = Block::seal(2, ZERO_DIGEST, sample_txs(), 42, 4).unwrap();
        let b = Block::seal(2, ZERO_DIGEST, sample_txs(), 42, 4).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_tamper_breaks_hash() {
        let mut block = Block::seal(1, ZERO_DIGEST, sample_txs(), 1_700_000_000_000, 2).unwrap();
        block.timestamp += 10_000;
        assert_ne!(block.compute_hash().unwrap(), block.hash);
    }

    #[test]
    fn test_transaction_tamper_breaks_hash() {
        let mut block = Block::seal(1, ZERO_DIGEST, sample_txs(), 1_700_000_000_000, 2).unwrap();
        block.transactions[0].data = json!({"n": 99});
        assert_ne!(block.compute_hash().unwrap(), block.hash);
    }

    #[test]
    fn test_empty_batch_root_is_empty_digest() {
        use crate::core::hash::empty_digest;
        assert_eq!(transaction_root(&[]).unwrap(), empty_digest());
    }

    #[test]
    fn test_serde_roundtrip_hex_digests() {
        let block = Block::seal(1, ZERO_DIGEST, sample_txs(), 5, 2).unwrap();
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["prev_hash"].as_str().unwrap().len(), 64);
        assert_eq!(json["hash"].as_str().unwrap().len(), 64);
        let back: Block = serde_json::from_value(json).unwrap();
        assert_eq!(back, block);
    }
}
