//! Protocol State Machine
//!
//! The engine owns one peer relationship: commitment exchange, turn-based
//! action/response traffic, proof verification, and termination. Protocol
//! misuse comes back as a `Rejection` and leaves state untouched;
//! cryptographic failures come back as evidence and terminate the session
//! with an INVALIDATION record on the ledger.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::canonical::{canonical_bytes, CanonicalError};
use crate::core::identity::{self, Identity};
use crate::core::now_millis;
use crate::ledger::chain::{Ledger, LedgerError, LedgerFault};
use crate::ledger::transaction::{MoveType, Transaction};
use crate::proof::commitment::{
    decode_leaf, verify_membership, CommitmentError, CommitmentPublic, CommitmentScheme,
    GridCommitment, GRID_SCHEME_TAG,
};
use crate::proof::merkle::MerkleProof;
use crate::protocol::cheating::{short_id, CheatEvidence, CheatKind};
use crate::protocol::enforcement::{Enforcement, EnforcementConfig, PendingAction};

/// Coarse protocol phase. Advances monotonically except for the fall into
/// `Terminated`, which any phase can take on invalidation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Constructed, own commitment not yet published.
    Init,
    /// Own commitment published; waiting on the peer's.
    Committed,
    /// Both commitments set; turn-based traffic permitted.
    Active,
    /// Session over, normally with `invalidated_by` populated.
    Terminated,
}

/// Engine construction options.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Run the enforcement monitor rules.
    pub enable_enforcement: bool,
    /// Allow snapshot auto-save.
    pub enable_persistence: bool,
    /// Where snapshots go when persistence is enabled.
    pub snapshot_path: Option<PathBuf>,
    /// Auto-save cadence; `None` disables the auto-save task.
    pub auto_save_interval_ms: Option<u64>,
    /// Leading zero bits required of every block hash.
    pub difficulty_bits: u32,
    /// Permitted backwards clock drift between consecutive blocks.
    pub clock_skew_tolerance_ms: u64,
    /// Enforcement monitor cadence.
    pub monitor_tick_ms: u64,
    /// Deadline for actions started without an explicit timeout.
    pub default_action_timeout_ms: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            enable_enforcement: true,
            enable_persistence: false,
            snapshot_path: None,
            auto_save_interval_ms: None,
            difficulty_bits: 2,
            clock_skew_tolerance_ms: 2_000,
            monitor_tick_ms: 1_000,
            default_action_timeout_ms: 30_000,
        }
    }
}

/// Observable protocol state. Everything here survives a snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolState {
    /// Current phase.
    pub phase: Phase,
    /// Our participant id.
    pub self_id: String,
    /// The peer's participant id, once their commitment is set.
    pub peer_id: Option<String>,
    /// Our published commitment.
    pub self_commit: Option<CommitmentPublic>,
    /// The peer's published commitment.
    pub peer_commit: Option<CommitmentPublic>,
    /// Whoever may append the next ACTION.
    pub turn: Option<String>,
    /// The action currently awaiting its counterpart, if any.
    pub pending_action: Option<PendingAction>,
    /// Evidence that terminated the session, if it ended that way.
    pub invalidated_by: Option<CheatEvidence>,
}

/// Protocol misuse. State is left unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Rejection {
    /// An ACTION was attempted out of turn.
    #[error("not your turn")]
    NotYourTurn,
    /// A commitment was already set and cannot be overwritten.
    #[error("commitment already set")]
    CommitmentAlreadySet,
    /// The transaction author is not the established peer.
    #[error("unknown peer")]
    UnknownPeer,
    /// The operation does not apply in the current phase.
    #[error("wrong phase")]
    PhaseWrong,
    /// The transaction nonce was already appended.
    #[error("duplicate nonce")]
    DuplicateNonce,
}

/// Engine errors: misuse, or a genuinely exceptional encoding failure.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Protocol misuse; see the reason.
    #[error("rejected: {0}")]
    Rejected(#[from] Rejection),
    /// A value could not be canonically encoded.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    /// The commitment scheme refused the operation.
    #[error(transparent)]
    Commitment(#[from] CommitmentError),
}

/// Result of verifying peer input. Evidence means the session terminated.
#[derive(Clone, Debug)]
pub enum Verdict {
    /// Input checked out and was recorded.
    Accepted,
    /// Input proved a violation; the engine has invalidated the peer.
    Evidence(CheatEvidence),
}

impl Verdict {
    /// Convenience predicate.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

/// A signed post-session witness disclosure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Revelation {
    /// Who is revealing.
    pub participant_id: String,
    /// The full witness, scheme-shaped.
    pub revealed: Value,
    /// When it was produced, milliseconds since the epoch.
    pub timestamp: u64,
    /// Hex compact signature over the canonical form of the other fields.
    pub signature: String,
}

impl Revelation {
    fn signing_payload(&self) -> Result<Vec<u8>, CanonicalError> {
        canonical_bytes(&json!({
            "participant_id": self.participant_id,
            "revealed": self.revealed,
            "timestamp": self.timestamp,
        }))
    }

    /// Check the signature against the revealer's id.
    pub fn verify_signature(&self) -> bool {
        match self.signing_payload() {
            Ok(payload) => identity::verify(&self.participant_id, &payload, &self.signature),
            Err(_) => false,
        }
    }
}

/// Snapshot of engine liveness for operators.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineHealth {
    /// Current phase.
    pub phase: Phase,
    /// Whether the ledger replays cleanly right now.
    pub ledger_valid: bool,
    /// Sealed block count.
    pub blocks: u64,
    /// Sealed transaction count.
    pub transactions: u64,
    /// Whether an action is awaiting its counterpart.
    pub pending_action: bool,
    /// Whether the session ended in invalidation.
    pub invalidated: bool,
}

/// The protocol engine for one peer relationship.
pub struct Engine {
    identity: Identity,
    scheme: Box<dyn CommitmentScheme>,
    ledger: Ledger,
    state: ProtocolState,
    enforcement: Option<Enforcement>,
    options: EngineOptions,
}

impl Engine {
    /// Create an engine in the `Init` phase holding its hidden witness.
    pub fn new(
        identity: Identity,
        scheme: Box<dyn CommitmentScheme>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        let ledger = Ledger::new(options.difficulty_bits, options.clock_skew_tolerance_ms)
            .map_err(map_ledger)?;
        let state = ProtocolState {
            phase: Phase::Init,
            self_id: identity.participant_id().to_string(),
            peer_id: None,
            self_commit: None,
            peer_commit: None,
            turn: None,
            pending_action: None,
            invalidated_by: None,
        };
        let enforcement = options.enable_enforcement.then(|| {
            Enforcement::new(EnforcementConfig {
                tick_ms: options.monitor_tick_ms,
                default_action_timeout_ms: options.default_action_timeout_ms,
            })
        });

        Ok(Self {
            identity,
            scheme,
            ledger,
            state,
            enforcement,
            options,
        })
    }

    /// Rebuild an engine from restored parts. Used by snapshot recovery.
    pub(crate) fn from_restored(
        identity: Identity,
        scheme: Box<dyn CommitmentScheme>,
        ledger: Ledger,
        state: ProtocolState,
        options: EngineOptions,
    ) -> Self {
        let enforcement = options.enable_enforcement.then(|| {
            Enforcement::new(EnforcementConfig {
                tick_ms: options.monitor_tick_ms,
                default_action_timeout_ms: options.default_action_timeout_ms,
            })
        });
        Self {
            identity,
            scheme,
            ledger,
            state,
            enforcement,
            options,
        }
    }

    /// Our participant id.
    pub fn participant_id(&self) -> &str {
        &self.state.self_id
    }

    /// The peer's participant id, once known.
    pub fn peer_id(&self) -> Option<&str> {
        self.state.peer_id.as_deref()
    }

    /// The ledger, read-only.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The protocol state, read-only.
    pub fn state(&self) -> &ProtocolState {
        &self.state
    }

    /// Construction options.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    // =========================================================================
    // COMMITMENT EXCHANGE
    // =========================================================================

    /// Publish our commitment: compute the root, append a signed COMMIT
    /// transaction, and advance `Init` to `Committed`.
    pub fn set_self_commitment(&mut self) -> Result<CommitmentPublic, EngineError> {
        if self.state.self_commit.is_some() {
            return Err(Rejection::CommitmentAlreadySet.into());
        }
        if self.state.phase != Phase::Init {
            return Err(Rejection::PhaseWrong.into());
        }

        let public = self.scheme.public();
        let data = serde_json::to_value(&public).map_err(CanonicalError::from)?;
        let tx = self.sign_tx(MoveType::Commit, data)?;
        self.append_sealed(tx)?;

        self.state.self_commit = Some(public.clone());
        self.state.phase = Phase::Committed;
        info!(id = %short_id(&self.state.self_id), "self commitment published");
        Ok(public)
    }

    /// Our published commitment, if `set_self_commitment` ran.
    pub fn get_self_commitment(&self) -> Option<&CommitmentPublic> {
        self.state.self_commit.as_ref()
    }

    /// The COMMIT transaction we published, for sending to the peer.
    pub fn self_commit_tx(&self) -> Option<&Transaction> {
        self.ledger
            .transactions_by(&self.state.self_id)
            .find(|tx| tx.move_type == MoveType::Commit)
    }

    /// Receive the peer's commitment together with their signed COMMIT
    /// transaction. Once both sides are committed the engine activates and
    /// the first turn goes to the lexicographically smaller participant id.
    pub fn set_peer_commitment(
        &mut self,
        public: CommitmentPublic,
        tx: Transaction,
    ) -> Result<Verdict, EngineError> {
        if self.state.peer_commit.is_some() {
            return Err(Rejection::CommitmentAlreadySet.into());
        }
        if self.state.phase != Phase::Committed {
            return Err(Rejection::PhaseWrong.into());
        }
        if tx.move_type != MoveType::Commit {
            return Err(Rejection::PhaseWrong.into());
        }
        if tx.participant_id == self.state.self_id {
            return Err(Rejection::UnknownPeer.into());
        }

        if !tx.verify_signature() {
            let evidence = CheatEvidence::forged_signature(&tx.participant_id, &tx);
            self.invalidate(evidence.clone())?;
            return Ok(Verdict::Evidence(evidence));
        }

        // The commitment the peer claims must be the one they signed.
        let signed_public: Result<CommitmentPublic, _> = serde_json::from_value(tx.data.clone());
        let consistent = matches!(&signed_public, Ok(signed) if *signed == public);
        if !consistent {
            let evidence = CheatEvidence::commitment_mismatch(
                &tx.participant_id,
                &public,
                &json!({"commit_transaction": tx}),
            );
            self.invalidate(evidence.clone())?;
            return Ok(Verdict::Evidence(evidence));
        }

        let peer_id = tx.participant_id.clone();
        self.append_sealed(tx)?;
        self.state.peer_id = Some(peer_id.clone());
        self.state.peer_commit = Some(public);

        // Both committed: activate, deterministic first mover.
        self.state.phase = Phase::Active;
        let first = if self.state.self_id < peer_id {
            self.state.self_id.clone()
        } else {
            peer_id.clone()
        };
        info!(
            peer = %short_id(&peer_id),
            first_mover = %short_id(&first),
            "peer commitment accepted, session active"
        );
        self.state.turn = Some(first);

        Ok(Verdict::Accepted)
    }

    // =========================================================================
    // TURN TRAFFIC
    // =========================================================================

    /// Record our own ACTION: sign, append, start the response deadline,
    /// and pass the turn to the peer.
    pub fn record_self_action(
        &mut self,
        action_type: &str,
        data: Value,
    ) -> Result<Transaction, EngineError> {
        if self.state.phase != Phase::Active {
            return Err(Rejection::PhaseWrong.into());
        }
        if self.state.turn.as_deref() != Some(self.state.self_id.as_str()) {
            return Err(Rejection::NotYourTurn.into());
        }
        let peer_id = self.require_peer()?.to_string();

        let action_id = Uuid::new_v4().to_string();
        let payload = json!({
            "action_id": action_id,
            "data": data,
            "type": action_type,
        });
        let tx = self.sign_tx(MoveType::Action, payload)?;
        self.append_sealed(tx.clone())?;

        self.state.pending_action = Some(PendingAction {
            id: action_id,
            action_type: action_type.to_string(),
            owed_by: peer_id.clone(),
            data,
            started_at: now_millis(),
            timeout_ms: self.default_timeout_ms(),
        });
        self.state.turn = Some(peer_id);

        Ok(tx)
    }

    /// Verify a peer ACTION: signature, turn, allowlist, nonce; append it
    /// and take the turn if everything holds.
    pub fn verify_peer_action(&mut self, tx: &Transaction) -> Result<Verdict, EngineError> {
        if self.state.phase != Phase::Active {
            return Err(Rejection::PhaseWrong.into());
        }
        let peer_id = self.require_peer()?.to_string();
        if tx.participant_id != peer_id {
            return Err(Rejection::UnknownPeer.into());
        }

        if !tx.verify_signature() {
            let evidence = CheatEvidence::forged_signature(&peer_id, tx);
            self.invalidate(evidence.clone())?;
            return Ok(Verdict::Evidence(evidence));
        }
        if tx.move_type != MoveType::Action {
            return Err(Rejection::PhaseWrong.into());
        }

        if self.state.turn.as_deref() != Some(peer_id.as_str()) {
            // The offending transaction is preserved in the evidence, not
            // appended to the ledger.
            let evidence = CheatEvidence::new(
                CheatKind::DoubleMove,
                &peer_id,
                json!({
                    "transaction": tx,
                    "expected_turn": self.state.turn,
                }),
            );
            self.invalidate(evidence.clone())?;
            return Ok(Verdict::Evidence(evidence));
        }

        let action_type = tx.data.get("type").and_then(Value::as_str).unwrap_or("");
        if let Some(enforcement) = &self.enforcement {
            if !enforcement.action_allowed(action_type) {
                let evidence = CheatEvidence::new(
                    CheatKind::InvalidMove,
                    &peer_id,
                    json!({
                        "transaction": tx,
                        "allowed": enforcement.allowed_actions(),
                    }),
                );
                self.invalidate(evidence.clone())?;
                return Ok(Verdict::Evidence(evidence));
            }
        }

        self.append_sealed(tx.clone())?;

        // We now owe the response; the deadline is ours.
        self.state.pending_action = Some(PendingAction {
            id: tx
                .data
                .get("action_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            action_type: action_type.to_string(),
            owed_by: self.state.self_id.clone(),
            data: tx.data.get("data").cloned().unwrap_or(Value::Null),
            started_at: now_millis(),
            timeout_ms: self.default_timeout_ms(),
        });
        self.state.turn = Some(self.state.self_id.clone());

        Ok(Verdict::Accepted)
    }

    /// Record our RESPONSE to the peer's pending action, optionally
    /// attaching a membership proof for the revealed fact.
    pub fn record_self_response(
        &mut self,
        data: Value,
        proof: Option<&MerkleProof>,
    ) -> Result<Transaction, EngineError> {
        if self.state.phase != Phase::Active {
            return Err(Rejection::PhaseWrong.into());
        }
        self.require_peer()?;

        let mut payload = json!({ "data": data });
        if let Some(proof) = proof {
            payload["proof"] = serde_json::to_value(proof).map_err(CanonicalError::from)?;
        }
        let tx = self.sign_tx(MoveType::Response, payload)?;
        self.append_sealed(tx.clone())?;

        // Our debt is settled.
        if self
            .state
            .pending_action
            .as_ref()
            .is_some_and(|p| p.owed_by == self.state.self_id)
        {
            self.state.pending_action = None;
        }

        Ok(tx)
    }

    /// Verify a peer RESPONSE. If it carries a proof, the proof is checked
    /// against the peer's committed root and the fact the response asserts;
    /// a mismatch is INVALID_PROOF evidence.
    pub fn verify_peer_response(&mut self, tx: &Transaction) -> Result<Verdict, EngineError> {
        if self.state.phase != Phase::Active {
            return Err(Rejection::PhaseWrong.into());
        }
        let peer_id = self.require_peer()?.to_string();
        if tx.participant_id != peer_id {
            return Err(Rejection::UnknownPeer.into());
        }

        if !tx.verify_signature() {
            let evidence = CheatEvidence::forged_signature(&peer_id, tx);
            self.invalidate(evidence.clone())?;
            return Ok(Verdict::Evidence(evidence));
        }
        if tx.move_type != MoveType::Response {
            return Err(Rejection::PhaseWrong.into());
        }

        // The question this response answers, captured before the pending
        // action is cleared.
        let pending_query = self
            .state
            .pending_action
            .as_ref()
            .filter(|p| p.owed_by == peer_id)
            .and_then(|p| p.data.get("query").cloned());

        self.append_sealed(tx.clone())?;
        if self
            .state
            .pending_action
            .as_ref()
            .is_some_and(|p| p.owed_by == peer_id)
        {
            self.state.pending_action = None;
        }

        if let Some(proof_value) = tx.data.get("proof") {
            let asserted = tx.data.get("data").cloned().unwrap_or(Value::Null);
            let peer_commit = self
                .state
                .peer_commit
                .clone()
                .ok_or(Rejection::UnknownPeer)?;

            let proof: Option<MerkleProof> = serde_json::from_value(proof_value.clone()).ok();
            let query = extract_query(&asserted).or(pending_query);

            let valid = match (&proof, &query) {
                (Some(proof), Some(query)) => {
                    verify_membership(&peer_commit, query, &asserted, proof)
                }
                _ => false,
            };

            if !valid {
                let evidence = CheatEvidence::new(
                    CheatKind::InvalidProof,
                    &peer_id,
                    json!({
                        "commitment": peer_commit,
                        "query": query,
                        "asserted": asserted,
                        "proof": proof_value,
                        "transaction": tx,
                    }),
                );
                self.invalidate(evidence.clone())?;
                return Ok(Verdict::Evidence(evidence));
            }
        }

        Ok(Verdict::Accepted)
    }

    // =========================================================================
    // STANDALONE PROOFS
    // =========================================================================

    /// Answer a query with a membership proof, recorded as a signed PROOF
    /// transaction. Returns the proof and its signed wrapper.
    pub fn generate_proof(
        &mut self,
        query: &Value,
    ) -> Result<(MerkleProof, Transaction), EngineError> {
        if self.state.phase != Phase::Active {
            return Err(Rejection::PhaseWrong.into());
        }

        let proof = self.scheme.prove(query)?;
        let mut payload = json!({
            "proof": proof,
            "query": query,
        });
        if let Some(cell) = decode_leaf(&proof.leaf_value) {
            payload["revealed"] =
                serde_json::to_value(cell).map_err(CanonicalError::from)?;
        }

        let tx = self.sign_tx(MoveType::Proof, payload)?;
        self.append_sealed(tx.clone())?;
        Ok((proof, tx))
    }

    /// Verify a peer's standalone proof against a published commitment and
    /// the fact it claims to reveal. The wrapper transaction is recorded on
    /// success; an invalid proof terminates the session.
    pub fn verify_peer_proof(
        &mut self,
        proof: &MerkleProof,
        wrapper: &Transaction,
        peer_commitment: &CommitmentPublic,
        asserted_fact: &Value,
    ) -> Result<Verdict, EngineError> {
        if self.state.phase != Phase::Active {
            return Err(Rejection::PhaseWrong.into());
        }
        let peer_id = self.require_peer()?.to_string();
        if wrapper.participant_id != peer_id {
            return Err(Rejection::UnknownPeer.into());
        }

        if !wrapper.verify_signature() {
            let evidence = CheatEvidence::forged_signature(&peer_id, wrapper);
            self.invalidate(evidence.clone())?;
            return Ok(Verdict::Evidence(evidence));
        }

        let query = wrapper
            .data
            .get("query")
            .cloned()
            .or_else(|| extract_query(asserted_fact))
            .unwrap_or(Value::Null);

        if !verify_membership(peer_commitment, &query, asserted_fact, proof) {
            let evidence = CheatEvidence::invalid_proof(
                &peer_id,
                peer_commitment,
                &query,
                asserted_fact,
                proof,
            );
            self.invalidate(evidence.clone())?;
            return Ok(Verdict::Evidence(evidence));
        }

        self.append_sealed(wrapper.clone())?;
        Ok(Verdict::Accepted)
    }

    // =========================================================================
    // REVELATION
    // =========================================================================

    /// Disclose our full witness, signed, for post-session audit.
    pub fn reveal_commitment(&self) -> Result<Revelation, EngineError> {
        let mut revelation = Revelation {
            participant_id: self.state.self_id.clone(),
            revealed: self.scheme.reveal(),
            timestamp: now_millis(),
            signature: String::new(),
        };
        revelation.signature = self.identity.sign(&revelation.signing_payload()?);
        Ok(revelation)
    }

    /// Check the peer's witness disclosure against the root they committed
    /// at the start. A witness that cannot reproduce the root is
    /// COMMITMENT_MISMATCH evidence.
    pub fn verify_peer_revelation(
        &mut self,
        revelation: &Revelation,
    ) -> Result<Verdict, EngineError> {
        let peer_id = self.require_peer()?.to_string();
        if revelation.participant_id != peer_id {
            return Err(Rejection::UnknownPeer.into());
        }
        let peer_commit = self
            .state
            .peer_commit
            .clone()
            .ok_or(Rejection::UnknownPeer)?;

        if !revelation.verify_signature() {
            let evidence = CheatEvidence::new(
                CheatKind::ForgedSignature,
                &peer_id,
                json!({ "revelation": revelation }),
            );
            self.invalidate(evidence.clone())?;
            return Ok(Verdict::Evidence(evidence));
        }

        let matches = match peer_commit.scheme_tag.as_str() {
            GRID_SCHEME_TAG => {
                GridCommitment::verify_revealed_witness(&peer_commit, &revelation.revealed)
            }
            _ => false,
        };
        if !matches {
            let evidence = CheatEvidence::commitment_mismatch(
                &peer_id,
                &peer_commit,
                &revelation.revealed,
            );
            self.invalidate(evidence.clone())?;
            return Ok(Verdict::Evidence(evidence));
        }

        Ok(Verdict::Accepted)
    }

    // =========================================================================
    // ENFORCEMENT
    // =========================================================================

    /// Declare the action types the application accepts from the peer.
    pub fn set_allowed_actions(&mut self, actions: impl IntoIterator<Item = String>) {
        if let Some(enforcement) = &mut self.enforcement {
            enforcement.set_allowed_actions(actions);
        }
    }

    /// Override the deadline of the currently pending action by id.
    pub fn start_timeout(&mut self, action_id: &str, timeout_ms: u64) -> bool {
        match &mut self.state.pending_action {
            Some(pending) if pending.id == action_id => {
                pending.timeout_ms = timeout_ms;
                pending.started_at = now_millis();
                true
            }
            _ => false,
        }
    }

    /// One monitor tick at an explicit clock reading. Emits and records
    /// timeout evidence when the peer has overstayed a deadline.
    pub fn check_enforcement_at(&mut self, now_ms: u64) -> Result<Option<CheatEvidence>, EngineError> {
        let Some(enforcement) = &self.enforcement else {
            return Ok(None);
        };
        if self.state.phase != Phase::Active {
            return Ok(None);
        }
        let evidence = enforcement.check_timeout(
            self.state.pending_action.as_ref(),
            self.state.peer_id.as_deref(),
            now_ms,
        );
        if let Some(evidence) = evidence {
            self.invalidate(evidence.clone())?;
            return Ok(Some(evidence));
        }
        Ok(None)
    }

    /// One monitor tick against the system clock.
    pub fn check_enforcement(&mut self) -> Result<Option<CheatEvidence>, EngineError> {
        self.check_enforcement_at(now_millis())
    }

    // =========================================================================
    // TERMINATION AND AUDIT
    // =========================================================================

    /// Terminate the session on evidence: append one INVALIDATION
    /// transaction and fall into `Terminated`. Idempotent; the first
    /// evidence wins and later calls change nothing.
    pub fn invalidate(&mut self, evidence: CheatEvidence) -> Result<(), EngineError> {
        if self.state.phase == Phase::Terminated {
            return Ok(());
        }

        let data = json!({ "evidence": evidence });
        let tx = self.sign_tx(MoveType::Invalidation, data)?;
        self.append_sealed(tx)?;

        warn!(
            kind = ?evidence.kind,
            accused = %short_id(&evidence.accused),
            "session invalidated"
        );
        self.state.pending_action = None;
        self.state.invalidated_by = Some(evidence);
        self.state.phase = Phase::Terminated;
        Ok(())
    }

    /// Replay the ledger's structural invariants: links, hashes,
    /// difficulty, timestamps, signatures, nonces.
    pub fn verify_ledger(&self) -> Result<(), LedgerFault> {
        self.ledger.verify()
    }

    /// Full audit replay: structural invariants, then every recorded proof
    /// re-verified against its author's committed root, then ACTION turn
    /// alternation. Works from the ledger alone, so a third party holding
    /// a copy reaches the same verdict. Read-only.
    pub fn replay(&self) -> Result<(), CheatEvidence> {
        replay_ledger(&self.ledger)
    }

    /// Liveness and audit counters.
    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            phase: self.state.phase,
            ledger_valid: self.ledger.verify().is_ok(),
            blocks: self.ledger.blocks().len() as u64,
            transactions: self.ledger.transaction_count() as u64,
            pending_action: self.state.pending_action.is_some(),
            invalidated: self.state.invalidated_by.is_some(),
        }
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn default_timeout_ms(&self) -> u64 {
        self.enforcement
            .as_ref()
            .map(|e| e.config.default_action_timeout_ms)
            .unwrap_or(self.options.default_action_timeout_ms)
    }

    fn require_peer(&self) -> Result<&str, Rejection> {
        self.state.peer_id.as_deref().ok_or(Rejection::UnknownPeer)
    }

    fn sign_tx(&self, move_type: MoveType, data: Value) -> Result<Transaction, EngineError> {
        let nonce = self.ledger.highest_nonce_of(&self.state.self_id) + 1;
        Ok(Transaction::signed(
            &self.identity,
            move_type,
            data,
            now_millis(),
            nonce,
        )?)
    }

    fn append_sealed(&mut self, tx: Transaction) -> Result<(), EngineError> {
        self.ledger.append(tx).map_err(map_ledger)?;
        self.ledger.seal().map_err(map_ledger)?;
        Ok(())
    }
}

fn map_ledger(error: LedgerError) -> EngineError {
    match error {
        LedgerError::DuplicateNonce { .. } => Rejection::DuplicateNonce.into(),
        LedgerError::Canonical(e) => EngineError::Canonical(e),
    }
}

/// Pull `{x, y}` out of a revealed fact, if present.
fn extract_query(value: &Value) -> Option<Value> {
    let x = value.get("x")?.clone();
    let y = value.get("y")?.clone();
    Some(json!({ "x": x, "y": y }))
}

/// Audit a ledger from scratch. Used by the engine and by third parties.
pub fn replay_ledger(ledger: &Ledger) -> Result<(), CheatEvidence> {
    if let Err(fault) = ledger.verify() {
        return Err(CheatEvidence::new(
            CheatKind::LedgerTamper,
            "",
            json!({ "fault": fault }),
        ));
    }

    // Committed roots by author, read off the chain itself.
    let mut commitments: Vec<(String, CommitmentPublic)> = Vec::new();
    for tx in ledger.transactions() {
        if tx.move_type == MoveType::Commit {
            if let Ok(public) = serde_json::from_value::<CommitmentPublic>(tx.data.clone()) {
                commitments.push((tx.participant_id.clone(), public));
            }
        }
    }
    let commitment_of = |id: &str| {
        commitments
            .iter()
            .find(|(owner, _)| owner == id)
            .map(|(_, public)| public)
    };

    // Every recorded proof must still verify against its author's root.
    for tx in ledger.transactions() {
        let (proof_value, asserted) = match tx.move_type {
            MoveType::Response => (
                tx.data.get("proof"),
                tx.data.get("data").cloned().unwrap_or(Value::Null),
            ),
            MoveType::Proof => (
                tx.data.get("proof"),
                tx.data.get("revealed").cloned().unwrap_or(Value::Null),
            ),
            _ => (None, Value::Null),
        };
        let Some(proof_value) = proof_value else {
            continue;
        };
        let Some(commitment) = commitment_of(&tx.participant_id) else {
            continue;
        };

        let proof: Option<MerkleProof> = serde_json::from_value(proof_value.clone()).ok();
        let query = extract_query(&asserted);
        let valid = match (&proof, &query) {
            (Some(proof), Some(query)) => verify_membership(commitment, query, &asserted, proof),
            _ => false,
        };
        if !valid {
            return Err(CheatEvidence::new(
                CheatKind::InvalidProof,
                &tx.participant_id,
                json!({
                    "commitment": commitment,
                    "query": query,
                    "asserted": asserted,
                    "proof": proof_value,
                    "transaction": tx,
                }),
            ));
        }
    }

    // ACTION authors must alternate.
    let mut last_actor: Option<&str> = None;
    for tx in ledger.transactions() {
        if tx.move_type != MoveType::Action {
            continue;
        }
        if last_actor == Some(tx.participant_id.as_str()) {
            return Err(CheatEvidence::new(
                CheatKind::DoubleMove,
                &tx.participant_id,
                json!({ "transaction": tx }),
            ));
        }
        last_actor = Some(tx.participant_id.as_str());
    }

    Ok(())
}
