//! Cheat Taxonomy and Evidence
//!
//! Verification failures are not errors: they become classified evidence
//! objects naming the accused, carrying the offending material, and
//! triggering invalidation. Evidence is self-contained so a third party
//! holding only the ledger and the accused's participant id can re-derive
//! the verdict.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::now_millis;
use crate::ledger::chain::Ledger;
use crate::ledger::transaction::Transaction;
use crate::proof::commitment::{verify_membership, CommitmentPublic, GridCommitment, GRID_SCHEME_TAG};
use crate::proof::merkle::MerkleProof;

/// The closed set of detectable violations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheatKind {
    /// A membership proof failed against the accused's committed root.
    InvalidProof,
    /// A transaction signature did not verify against its claimed author.
    ForgedSignature,
    /// A revealed witness is inconsistent with the original commitment.
    CommitmentMismatch,
    /// The hash chain failed integrity replay.
    LedgerTamper,
    /// A pending action exceeded its deadline.
    TimeoutStall,
    /// An action arrived from a participant out of turn.
    DoubleMove,
    /// An action type outside the declared allowlist.
    InvalidMove,
}

/// Self-contained evidence of one violation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheatEvidence {
    /// What rule was broken.
    pub kind: CheatKind,
    /// Participant id of the accused.
    pub accused: String,
    /// The offending material: transaction, proof, block reference, or
    /// timeout record, shaped per kind.
    pub witness: Value,
    /// When the violation was detected, milliseconds since the epoch.
    pub at: u64,
}

impl CheatEvidence {
    /// Build evidence stamped with the current clock.
    pub fn new(kind: CheatKind, accused: impl Into<String>, witness: Value) -> Self {
        let evidence = Self {
            kind,
            accused: accused.into(),
            witness,
            at: now_millis(),
        };
        tracing::warn!(kind = ?evidence.kind, accused = %short_id(&evidence.accused), "cheat evidence recorded");
        evidence
    }

    /// Evidence for a forged transaction signature.
    pub fn forged_signature(accused: &str, tx: &Transaction) -> Self {
        Self::new(
            CheatKind::ForgedSignature,
            accused,
            json!({ "transaction": tx }),
        )
    }

    /// Evidence for a proof that fails against the accused's root.
    pub fn invalid_proof(
        accused: &str,
        commitment: &CommitmentPublic,
        query: &Value,
        asserted: &Value,
        proof: &MerkleProof,
    ) -> Self {
        Self::new(
            CheatKind::InvalidProof,
            accused,
            json!({
                "commitment": commitment,
                "query": query,
                "asserted": asserted,
                "proof": proof,
            }),
        )
    }

    /// Evidence for a revealed witness that cannot reproduce the root.
    pub fn commitment_mismatch(
        accused: &str,
        commitment: &CommitmentPublic,
        revealed: &Value,
    ) -> Self {
        Self::new(
            CheatKind::CommitmentMismatch,
            accused,
            json!({ "commitment": commitment, "revealed": revealed }),
        )
    }

    /// Re-derive the verdict from the witness material plus the ledger.
    ///
    /// Returns true when the evidence independently checks out. Timeout and
    /// turn violations depend on the observer's clock and turn window and
    /// cannot be re-derived by a third party; replaying the ledger is the
    /// audit path for those.
    pub fn reverify(&self, ledger: &Ledger) -> bool {
        match self.kind {
            CheatKind::ForgedSignature => {
                let Some(tx) = self.witness_transaction() else {
                    return false;
                };
                !tx.verify_signature()
            }
            CheatKind::InvalidProof => {
                let (Some(commitment), Some(proof)) = (
                    self.witness_field::<CommitmentPublic>("commitment"),
                    self.witness_field::<MerkleProof>("proof"),
                ) else {
                    return false;
                };
                let query = self.witness.get("query").cloned().unwrap_or(Value::Null);
                let asserted = self.witness.get("asserted").cloned().unwrap_or(Value::Null);
                !verify_membership(&commitment, &query, &asserted, &proof)
            }
            CheatKind::CommitmentMismatch => {
                let Some(commitment) = self.witness_field::<CommitmentPublic>("commitment") else {
                    return false;
                };
                let Some(revealed) = self.witness.get("revealed") else {
                    return false;
                };
                match commitment.scheme_tag.as_str() {
                    GRID_SCHEME_TAG => {
                        !GridCommitment::verify_revealed_witness(&commitment, revealed)
                    }
                    _ => false,
                }
            }
            CheatKind::LedgerTamper => ledger.verify().is_err(),
            CheatKind::InvalidMove => {
                let Some(tx) = self.witness_transaction() else {
                    return false;
                };
                let Some(allowed) = self.witness.get("allowed").and_then(Value::as_array) else {
                    return false;
                };
                let Some(action_type) = tx.data.get("type").and_then(Value::as_str) else {
                    return false;
                };
                !allowed.iter().any(|a| a.as_str() == Some(action_type))
            }
            CheatKind::TimeoutStall | CheatKind::DoubleMove => false,
        }
    }

    fn witness_transaction(&self) -> Option<Transaction> {
        self.witness_field::<Transaction>("transaction")
    }

    fn witness_field<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        serde_json::from_value(self.witness.get(key)?.clone()).ok()
    }
}

/// Abbreviate a participant id for log lines.
pub(crate) fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
