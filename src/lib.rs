//! # Pact
//!
//! Zero-trust protocol engine for two-party peer-to-peer interactions in
//! which neither side trusts the other or the network. Each participant is
//! bound to hidden initial state by a cryptographic commitment, every move
//! is signed, the full interaction lands on a locally replicated
//! hash-chained ledger, and any party (or third-party auditor) can verify
//! revealed facts with succinct Merkle membership proofs or replay the
//! ledger end to end.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         PACT ENGINE                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── canonical.rs- Canonical JSON byte encoding              │
//! │  ├── hash.rs     - SHA-256 digests, difficulty counting      │
//! │  └── identity.rs - secp256k1 identity and signatures         │
//! │                                                              │
//! │  proof/          - Commitments and membership proofs         │
//! │  ├── merkle.rs   - Binary Merkle tree, inclusion proofs      │
//! │  └── commitment.rs- Scheme trait + grid reference scheme     │
//! │                                                              │
//! │  ledger/         - Tamper-evident local history              │
//! │  ├── transaction.rs- Signed moves                            │
//! │  ├── block.rs    - Sealing with proof-of-work tamper cost    │
//! │  └── chain.rs    - Append, seal, integrity replay            │
//! │                                                              │
//! │  protocol/       - The state machine and its services        │
//! │  ├── engine.rs   - Phases, turns, verification, evidence     │
//! │  ├── cheating.rs - Violation taxonomy, evidence objects      │
//! │  ├── enforcement.rs- Deadlines and action allowlist          │
//! │  ├── wire.rs     - Message envelopes                         │
//! │  ├── snapshot.rs - Atomic persistence                        │
//! │  ├── reconnect.rs- Suffix sync and fork handling             │
//! │  └── runtime.rs  - Command-channel owner, monitor, auto-save │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Trust model
//!
//! The transport is adversarial but non-dropping; authenticity and
//! integrity come from the engine, not the channel. The ledger is a
//! personal tamper-evident log, not a consensus artifact: its tiny
//! proof-of-work exists as a tamper cost only.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod ledger;
pub mod proof;
pub mod protocol;

pub use crate::core::canonical::{canonical_bytes, canonical_string, CanonicalError};
pub use crate::core::hash::{sha256, Digest};
pub use crate::core::identity::Identity;
pub use crate::ledger::chain::{FaultReason, Ledger, LedgerFault};
pub use crate::ledger::transaction::{MoveType, Transaction};
pub use crate::proof::commitment::{
    CommitmentPublic, CommitmentScheme, GridCommitment, GridQuery, RevealedCell,
};
pub use crate::proof::merkle::{MerkleProof, MerkleTree, Side};
pub use crate::protocol::cheating::{CheatEvidence, CheatKind};
pub use crate::protocol::engine::{
    replay_ledger, Engine, EngineError, EngineOptions, Phase, ProtocolState, Rejection,
    Revelation, Verdict,
};
pub use crate::protocol::runtime::{spawn, EngineHandle, RuntimeError};
pub use crate::protocol::snapshot::{Snapshot, SnapshotError};
pub use crate::protocol::wire::{Envelope, EnvelopeKind};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
