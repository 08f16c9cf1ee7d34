//! Wire Envelopes
//!
//! Message shapes exchanged between peers. The transport itself lives
//! outside the engine; these types only fix the canonical JSON forms.

use serde::{Deserialize, Serialize};

use crate::ledger::block::Block;
use crate::ledger::transaction::Transaction;
use crate::proof::merkle::MerkleProof;

/// Envelope discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    /// Carries a COMMIT transaction.
    Commit,
    /// Carries an ACTION transaction.
    Action,
    /// Carries a RESPONSE transaction.
    Response,
    /// Carries a PROOF transaction, with the proof alongside.
    Proof,
    /// Carries an INVALIDATION transaction.
    Invalidation,
    /// Requests the ledger suffix past the sender's highest block index.
    SyncReq,
    /// Carries one block of the requested suffix.
    SyncResp,
}

/// One peer-to-peer message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// What this message carries.
    pub kind: EnvelopeKind,
    /// Transaction payload, for move-bearing kinds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tx: Option<Transaction>,
    /// Block payload, for SYNC_RESP.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub block: Option<Block>,
    /// Standalone proof, for PROOF envelopes.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub proof: Option<MerkleProof>,
    /// Requester's highest block index (SYNC_REQ), or the carried block's
    /// index (SYNC_RESP).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from_index: Option<u64>,
}

impl Envelope {
    fn bare(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            tx: None,
            block: None,
            proof: None,
            from_index: None,
        }
    }

    /// Envelope around a move-bearing transaction.
    pub fn transaction(kind: EnvelopeKind, tx: Transaction) -> Self {
        Self {
            tx: Some(tx),
            ..Self::bare(kind)
        }
    }

    /// PROOF envelope: the proof plus its signed wrapper transaction.
    pub fn proof(proof: MerkleProof, wrapper: Transaction) -> Self {
        Self {
            tx: Some(wrapper),
            proof: Some(proof),
            ..Self::bare(EnvelopeKind::Proof)
        }
    }

    /// SYNC_REQ advertising our highest block index.
    pub fn sync_request(highest_index: u64) -> Self {
        Self {
            from_index: Some(highest_index),
            ..Self::bare(EnvelopeKind::SyncReq)
        }
    }

    /// SYNC_RESP carrying one block of the suffix.
    pub fn sync_block(block: Block) -> Self {
        Self {
            from_index: Some(block.index),
            block: Some(block),
            ..Self::bare(EnvelopeKind::SyncResp)
        }
    }

    /// Serialize for the transport.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from the transport.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
