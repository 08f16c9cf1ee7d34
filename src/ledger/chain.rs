//! The Hash-Chained Ledger
//!
//! A locally replicated, append-only log of signed transactions batched
//! into sealed blocks. Not a consensus artifact: each peer keeps its own
//! copy, and `verify` lets anyone replay the chain invariants from scratch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::canonical::CanonicalError;
use crate::core::hash::ZERO_DIGEST;
use crate::core::now_millis;
use crate::ledger::block::Block;
use crate::ledger::transaction::Transaction;

/// Why a block failed verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultReason {
    /// The genesis block is malformed.
    BadGenesis,
    /// A block's index does not match its chain position.
    IndexMismatch,
    /// A block's back-link does not match its predecessor's hash.
    BrokenLink,
    /// A block's stored hash does not match its recomputed hash.
    HashMismatch,
    /// A block's hash does not carry the required leading zero bits.
    DifficultyNotMet,
    /// A block's timestamp regressed beyond the clock-skew tolerance.
    TimestampRegression,
    /// A transaction signature does not verify against its author.
    BadSignature,
    /// A participant nonce repeated or went backwards.
    NonceReplay,
}

impl std::fmt::Display for FaultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::BadGenesis => "bad genesis",
            Self::IndexMismatch => "index mismatch",
            Self::BrokenLink => "broken link",
            Self::HashMismatch => "hash mismatch",
            Self::DifficultyNotMet => "difficulty not met",
            Self::TimestampRegression => "timestamp regression",
            Self::BadSignature => "bad signature",
            Self::NonceReplay => "nonce replay",
        };
        f.write_str(text)
    }
}

/// First verification failure found during replay: the block index at or
/// before which the chain was altered, and why.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("block {index}: {reason}")]
pub struct LedgerFault {
    /// Index of the first bad block.
    pub index: u64,
    /// What failed there.
    pub reason: FaultReason,
}

/// Errors from ledger mutation.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A `(participant, nonce)` pair was appended before, or the nonce went
    /// backwards. Appends are at-most-once.
    #[error("duplicate or regressed nonce {nonce} for participant")]
    DuplicateNonce {
        /// The offending author.
        participant_id: String,
        /// The rejected nonce.
        nonce: u64,
    },

    /// A transaction or header could not be canonically encoded.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

/// Append-only ledger with per-participant nonce tracking.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ledger {
    blocks: Vec<Block>,
    pending: Vec<Transaction>,
    highest_nonce: BTreeMap<String, u64>,
    difficulty_bits: u32,
    clock_skew_tolerance_ms: u64,
}

impl Ledger {
    /// Create a ledger holding only the sealed genesis block.
    pub fn new(difficulty_bits: u32, clock_skew_tolerance_ms: u64) -> Result<Self, LedgerError> {
        let genesis = Block::seal(0, ZERO_DIGEST, Vec::new(), now_millis(), difficulty_bits)?;
        Ok(Self {
            blocks: vec![genesis],
            pending: Vec::new(),
            highest_nonce: BTreeMap::new(),
            difficulty_bits,
            clock_skew_tolerance_ms,
        })
    }

    /// Sealed blocks, genesis first.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// The most recently sealed block.
    pub fn tip(&self) -> &Block {
        self.blocks.last().expect("ledger always has genesis")
    }

    /// Index of the tip block.
    pub fn height(&self) -> u64 {
        self.tip().index
    }

    /// Configured sealing difficulty.
    pub fn difficulty_bits(&self) -> u32 {
        self.difficulty_bits
    }

    /// Queue a transaction for the next block.
    ///
    /// Rejects any nonce that is not strictly greater than the author's
    /// highest appended nonce.
    pub fn append(&mut self, tx: Transaction) -> Result<(), LedgerError> {
        if let Some(&highest) = self.highest_nonce.get(&tx.participant_id) {
            if tx.nonce <= highest {
                return Err(LedgerError::DuplicateNonce {
                    participant_id: tx.participant_id.clone(),
                    nonce: tx.nonce,
                });
            }
        }
        self.highest_nonce
            .insert(tx.participant_id.clone(), tx.nonce);
        self.pending.push(tx);
        Ok(())
    }

    /// Seal the pending batch into a new block. No-op on an empty batch.
    pub fn seal(&mut self) -> Result<Option<&Block>, LedgerError> {
        if self.pending.is_empty() {
            return Ok(None);
        }

        let transactions = std::mem::take(&mut self.pending);
        let index = self.blocks.len() as u64;
        // Sealing against a clock that stepped backwards would trip the
        // monotonicity invariant on our own chain.
        let timestamp = now_millis().max(self.tip().timestamp);
        let block = Block::seal(
            index,
            self.tip().hash,
            transactions,
            timestamp,
            self.difficulty_bits,
        )?;

        tracing::debug!(index, tx_count = block.transactions.len(), "sealed block");
        self.blocks.push(block);
        Ok(self.blocks.last())
    }

    /// Replay the full chain and return the first failing block, if any.
    ///
    /// Checks, per block: chain position, back-link, recomputed hash,
    /// difficulty, timestamp monotonicity within the skew tolerance, every
    /// transaction signature, and per-participant nonce progression.
    pub fn verify(&self) -> Result<(), LedgerFault> {
        let genesis = match self.blocks.first() {
            Some(genesis) => genesis,
            None => {
                return Err(LedgerFault {
                    index: 0,
                    reason: FaultReason::BadGenesis,
                })
            }
        };
        if genesis.index != 0 || genesis.prev_hash != ZERO_DIGEST || !genesis.transactions.is_empty()
        {
            return Err(LedgerFault {
                index: 0,
                reason: FaultReason::BadGenesis,
            });
        }

        let mut seen_nonce: BTreeMap<&str, u64> = BTreeMap::new();

        for (position, block) in self.blocks.iter().enumerate() {
            let index = position as u64;
            let fault = |reason| LedgerFault { index, reason };

            if block.index != index {
                return Err(fault(FaultReason::IndexMismatch));
            }
            if position > 0 && block.prev_hash != self.blocks[position - 1].hash {
                return Err(fault(FaultReason::BrokenLink));
            }

            match block.compute_hash() {
                Ok(computed) if computed == block.hash => {}
                _ => return Err(fault(FaultReason::HashMismatch)),
            }
            if !block.meets_difficulty(self.difficulty_bits) {
                return Err(fault(FaultReason::DifficultyNotMet));
            }

            if position > 0 {
                let previous = self.blocks[position - 1].timestamp;
                if block.timestamp + self.clock_skew_tolerance_ms < previous {
                    return Err(fault(FaultReason::TimestampRegression));
                }
            }

            for tx in &block.transactions {
                if !tx.verify_signature() {
                    return Err(fault(FaultReason::BadSignature));
                }
                let seen = seen_nonce.entry(tx.participant_id.as_str()).or_insert(0);
                if tx.nonce <= *seen {
                    return Err(fault(FaultReason::NonceReplay));
                }
                *seen = tx.nonce;
            }
        }

        Ok(())
    }

    /// Extend the chain with a block received from the peer during sync.
    ///
    /// The block must continue the local tip exactly and pass the same
    /// checks `verify` applies.
    pub fn try_extend(&mut self, block: Block) -> Result<(), LedgerFault> {
        let index = self.blocks.len() as u64;
        let fault = |reason| LedgerFault { index, reason };

        if block.index != index {
            return Err(fault(FaultReason::IndexMismatch));
        }
        if block.prev_hash != self.tip().hash {
            return Err(fault(FaultReason::BrokenLink));
        }
        match block.compute_hash() {
            Ok(computed) if computed == block.hash => {}
            _ => return Err(fault(FaultReason::HashMismatch)),
        }
        if !block.meets_difficulty(self.difficulty_bits) {
            return Err(fault(FaultReason::DifficultyNotMet));
        }
        if block.timestamp + self.clock_skew_tolerance_ms < self.tip().timestamp {
            return Err(fault(FaultReason::TimestampRegression));
        }
        for tx in &block.transactions {
            if !tx.verify_signature() {
                return Err(fault(FaultReason::BadSignature));
            }
            let highest = self.highest_nonce.get(&tx.participant_id).copied().unwrap_or(0);
            if tx.nonce <= highest {
                return Err(fault(FaultReason::NonceReplay));
            }
        }

        for tx in &block.transactions {
            self.highest_nonce
                .insert(tx.participant_id.clone(), tx.nonce);
        }
        self.blocks.push(block);
        Ok(())
    }

    /// All sealed transactions in chain order.
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.blocks.iter().flat_map(|b| b.transactions.iter())
    }

    /// All sealed transactions by one participant, in chain order.
    pub fn transactions_by<'a>(
        &'a self,
        participant_id: &'a str,
    ) -> impl Iterator<Item = &'a Transaction> {
        self.transactions()
            .filter(move |tx| tx.participant_id == participant_id)
    }

    /// Total sealed transaction count.
    pub fn transaction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.transactions.len()).sum()
    }

    /// Highest nonce appended by a participant, zero if none.
    pub fn highest_nonce_of(&self, participant_id: &str) -> u64 {
        self.highest_nonce.get(participant_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::Identity;
    use crate::ledger::transaction::MoveType;
    use serde_json::json;

    fn signed(identity: &Identity, nonce: u64) -> Transaction {
        Transaction::signed(
            identity,
            MoveType::Action,
            json!({"n": nonce}),
            now_millis(),
            nonce,
        )
        .unwrap()
    }

    fn ledger_with_blocks(identity: &Identity, blocks: u64) -> Ledger {
        let mut ledger = Ledger::new(2, 2_000).unwrap();
        for n in 1..=blocks {
            ledger.append(signed(identity, n)).unwrap();
            ledger.seal().unwrap();
        }
        ledger
    }

    #[test]
    fn test_genesis_shape() {
        let ledger = Ledger::new(2, 2_000).unwrap();
        assert_eq!(ledger.blocks().len(), 1);
        assert_eq!(ledger.tip().index, 0);
        assert_eq!(ledger.tip().prev_hash, ZERO_DIGEST);
        assert!(ledger.tip().transactions.is_empty());
        assert!(ledger.verify().is_ok());
    }

    #[test]
    fn test_append_and_seal() {
        let identity = Identity::from_seed(b"chain").unwrap();
        let ledger = ledger_with_blocks(&identity, 3);
        assert_eq!(ledger.height(), 3);
        assert_eq!(ledger.transaction_count(), 3);
        assert!(ledger.verify().is_ok());
    }

    #[test]
    fn test_seal_empty_is_noop() {
        let mut ledger = Ledger::new(2, 2_000).unwrap();
        assert!(ledger.seal().unwrap().is_none());
        assert_eq!(ledger.height(), 0);
    }

    #[test]
    fn test_duplicate_nonce_rejected() {
        let identity = Identity::from_seed(b"chain").unwrap();
        let mut ledger = Ledger::new(2, 2_000).unwrap();
        ledger.append(signed(&identity, 1)).unwrap();
        assert!(matches!(
            ledger.append(signed(&identity, 1)),
            Err(LedgerError::DuplicateNonce { nonce: 1, .. })
        ));
        // Going backwards is rejected the same way.
        ledger.append(signed(&identity, 5)).unwrap();
        assert!(ledger.append(signed(&identity, 3)).is_err());
    }

    #[test]
    fn test_tampered_timestamp_reports_hash_mismatch() {
        let identity = Identity::from_seed(b"chain").unwrap();
        let mut ledger = ledger_with_blocks(&identity, 4);
        ledger.blocks[2].timestamp += 10_000;

        assert_eq!(
            ledger.verify(),
            Err(LedgerFault {
                index: 2,
                reason: FaultReason::HashMismatch
            })
        );
    }

    #[test]
    fn test_tampered_transaction_detected() {
        let identity = Identity::from_seed(b"chain").unwrap();
        let mut ledger = ledger_with_blocks(&identity, 3);
        ledger.blocks[1].transactions[0].data = json!({"n": 999});

        let fault = ledger.verify().unwrap_err();
        assert_eq!(fault.index, 1);
        assert_eq!(fault.reason, FaultReason::HashMismatch);
    }

    #[test]
    fn test_resigned_tampered_transaction_breaks_link() {
        // An attacker who rewrites a block and re-seals it still cannot
        // produce the next block's back-link.
        let identity = Identity::from_seed(b"chain").unwrap();
        let mut ledger = ledger_with_blocks(&identity, 3);

        let mut replaced = ledger.blocks[1].clone();
        replaced.transactions[0].data = json!({"n": 999});
        let resealed = Block::seal(
            replaced.index,
            replaced.prev_hash,
            replaced.transactions,
            replaced.timestamp,
            2,
        )
        .unwrap();
        ledger.blocks[1] = resealed;

        let fault = ledger.verify().unwrap_err();
        assert_eq!(fault.index, 2);
        assert_eq!(fault.reason, FaultReason::BrokenLink);
    }

    #[test]
    fn test_forged_signature_detected() {
        let identity = Identity::from_seed(b"chain").unwrap();
        let other = Identity::from_seed(b"other").unwrap();
        let mut ledger = Ledger::new(2, 2_000).unwrap();

        // Signature from the wrong key, then re-seal so hashes are clean.
        let mut tx = signed(&identity, 1);
        tx.signature = other.sign(&tx.signing_payload().unwrap());
        ledger.highest_nonce.insert(tx.participant_id.clone(), 1);
        let block = Block::seal(1, ledger.tip().hash, vec![tx], now_millis(), 2).unwrap();
        ledger.blocks.push(block);

        let fault = ledger.verify().unwrap_err();
        assert_eq!(fault.index, 1);
        assert_eq!(fault.reason, FaultReason::BadSignature);
    }

    #[test]
    fn test_try_extend_accepts_valid_suffix() {
        let identity = Identity::from_seed(b"chain").unwrap();
        let mut source = ledger_with_blocks(&identity, 2);
        source.append(signed(&identity, 3)).unwrap();
        source.seal().unwrap();

        let mut replica = source.clone();
        replica.blocks.truncate(2);
        replica.highest_nonce.insert(identity.participant_id().to_string(), 1);

        replica.try_extend(source.blocks()[2].clone()).unwrap();
        replica.try_extend(source.blocks()[3].clone()).unwrap();
        assert_eq!(replica.height(), source.height());
        assert!(replica.verify().is_ok());
    }

    #[test]
    fn test_try_extend_rejects_diverging_block() {
        let identity = Identity::from_seed(b"chain").unwrap();
        let mut ledger = ledger_with_blocks(&identity, 2);

        let forged = Block::seal(3, ZERO_DIGEST, vec![], now_millis(), 2).unwrap();
        let fault = ledger.try_extend(forged).unwrap_err();
        assert_eq!(fault.reason, FaultReason::BrokenLink);
    }

    #[test]
    fn test_transactions_by_participant() {
        let alice = Identity::from_seed(b"alice").unwrap();
        let bob = Identity::from_seed(b"bob").unwrap();
        let mut ledger = Ledger::new(0, 2_000).unwrap();
        ledger.append(signed(&alice, 1)).unwrap();
        ledger.append(signed(&bob, 1)).unwrap();
        ledger.append(signed(&alice, 2)).unwrap();
        ledger.seal().unwrap();

        assert_eq!(ledger.transactions_by(alice.participant_id()).count(), 2);
        assert_eq!(ledger.transactions_by(bob.participant_id()).count(), 1);
    }

    #[test]
    fn test_serde_roundtrip_preserves_verification() {
        let identity = Identity::from_seed(b"chain").unwrap();
        let ledger = ledger_with_blocks(&identity, 3);

        let json = serde_json::to_string(&ledger).unwrap();
        let back: Ledger = serde_json::from_str(&json).unwrap();
        assert!(back.verify().is_ok());
        assert_eq!(back.height(), ledger.height());
        assert_eq!(back.tip().hash, ledger.tip().hash);
    }
}
