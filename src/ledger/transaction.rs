//! Signed Transactions
//!
//! Every recorded move is a transaction signed by its author. The signature
//! covers the canonical encoding of every field except the signature itself,
//! so any byte of a replayed transaction that changes invalidates it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::canonical::{canonical_bytes, CanonicalError};
use crate::core::hash::{sha256, Digest};
use crate::core::identity::{self, Identity};

/// Kinds of recorded moves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MoveType {
    /// Publication of a commitment root.
    Commit,
    /// A turn action by the participant whose turn it is.
    Action,
    /// The answer to an action, optionally carrying a proof.
    Response,
    /// A standalone membership proof.
    Proof,
    /// Termination with attached cheat evidence.
    Invalidation,
}

/// A signed move in the ledger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// What kind of move this is.
    pub move_type: MoveType,
    /// Author: hex of the uncompressed public key.
    pub participant_id: String,
    /// Move payload. Must canonicalize (no floats).
    pub data: Value,
    /// Author clock, integer milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Author-local counter, strictly increasing per participant.
    pub nonce: u64,
    /// Hex compact ECDSA signature over the signing payload.
    pub signature: String,
}

impl Transaction {
    /// Build and sign a transaction in one step.
    pub fn signed(
        identity: &Identity,
        move_type: MoveType,
        data: Value,
        timestamp: u64,
        nonce: u64,
    ) -> Result<Self, CanonicalError> {
        let mut tx = Self {
            move_type,
            participant_id: identity.participant_id().to_string(),
            data,
            timestamp,
            nonce,
            signature: String::new(),
        };
        tx.signature = identity.sign(&tx.signing_payload()?);
        Ok(tx)
    }

    /// Canonical bytes the signature covers: every field but `signature`.
    pub fn signing_payload(&self) -> Result<Vec<u8>, CanonicalError> {
        canonical_bytes(&json!({
            "data": self.data,
            "move_type": self.move_type,
            "nonce": self.nonce,
            "participant_id": self.participant_id,
            "timestamp": self.timestamp,
        }))
    }

    /// Check the signature against the author's own participant id.
    pub fn verify_signature(&self) -> bool {
        match self.signing_payload() {
            Ok(payload) => identity::verify(&self.participant_id, &payload, &self.signature),
            Err(_) => false,
        }
    }

    /// Digest of the whole transaction including its signature. These are
    /// the leaves of each block's transaction Merkle root.
    pub fn digest(&self) -> Result<Digest, CanonicalError> {
        Ok(sha256(&canonical_bytes(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(identity: &Identity) -> Transaction {
        Transaction::signed(
            identity,
            MoveType::Action,
            json!({"type": "query_cell", "query": {"x": 3, "y": 3}}),
            1_700_000_000_000,
            1,
        )
        .unwrap()
    }

    #[test]
    fn test_signature_verifies() {
        let identity = Identity::from_seed(b"tx-test").unwrap();
        assert!(tx(&identity).verify_signature());
    }

    #[test]
    fn test_any_field_tamper_breaks_signature() {
        let identity = Identity::from_seed(b"tx-test").unwrap();

        let mut tampered = tx(&identity);
        tampered.data = json!({"type": "query_cell", "query": {"x": 2, "y": 3}});
        assert!(!tampered.verify_signature());

        let mut tampered = tx(&identity);
        tampered.timestamp += 1;
        assert!(!tampered.verify_signature());

        let mut tampered = tx(&identity);
        tampered.nonce += 1;
        assert!(!tampered.verify_signature());

        let mut tampered = tx(&identity);
        tampered.move_type = MoveType::Response;
        assert!(!tampered.verify_signature());
    }

    #[test]
    fn test_claiming_another_author_fails() {
        let alice = Identity::from_seed(b"alice").unwrap();
        let mallory = Identity::from_seed(b"mallory").unwrap();

        let mut stolen = tx(&alice);
        stolen.participant_id = mallory.participant_id().to_string();
        assert!(!stolen.verify_signature());
    }

    #[test]
    fn test_float_data_rejected_at_signing() {
        let identity = Identity::from_seed(b"tx-test").unwrap();
        let result = Transaction::signed(
            &identity,
            MoveType::Action,
            json!({"bad": 0.5}),
            0,
            1,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_digest_changes_with_signature() {
        let identity = Identity::from_seed(b"tx-test").unwrap();
        let original = tx(&identity);
        let mut forged = original.clone();
        forged.signature = identity.sign(b"other payload");
        assert_ne!(original.digest().unwrap(), forged.digest().unwrap());
    }

    #[test]
    fn test_move_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&MoveType::Invalidation).unwrap(),
            r#""INVALIDATION""#
        );
        let back: MoveType = serde_json::from_str(r#""COMMIT""#).unwrap();
        assert_eq!(back, MoveType::Commit);
    }

    #[test]
    fn test_serde_roundtrip() {
        let identity = Identity::from_seed(b"tx-test").unwrap();
        let original = tx(&identity);
        let json = serde_json::to_string(&original).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
        assert!(back.verify_signature());
    }
}
