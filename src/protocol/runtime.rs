//! Cooperative Runtime
//!
//! The engine is intrinsically sequential: one owner task holds it and
//! drains a command channel, so no transition is ever interleaved. The
//! enforcement monitor and the auto-save loop are separate tasks that only
//! ever talk to the owner through that channel. Violations detected by the
//! monitor are broadcast to whoever subscribes.

use std::collections::BTreeSet;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

use crate::ledger::transaction::Transaction;
use crate::proof::commitment::CommitmentPublic;
use crate::proof::merkle::MerkleProof;
use crate::protocol::cheating::CheatEvidence;
use crate::protocol::engine::{Engine, EngineError, EngineHealth, Verdict};
use crate::protocol::snapshot::SnapshotError;

/// Commands the owner task accepts.
enum Command {
    SetPeerCommitment {
        public: CommitmentPublic,
        tx: Transaction,
        reply: oneshot::Sender<Result<Verdict, EngineError>>,
    },
    RecordAction {
        action_type: String,
        data: Value,
        reply: oneshot::Sender<Result<Transaction, EngineError>>,
    },
    VerifyPeerAction {
        tx: Transaction,
        reply: oneshot::Sender<Result<Verdict, EngineError>>,
    },
    RecordResponse {
        data: Value,
        proof: Option<MerkleProof>,
        reply: oneshot::Sender<Result<Transaction, EngineError>>,
    },
    VerifyPeerResponse {
        tx: Transaction,
        reply: oneshot::Sender<Result<Verdict, EngineError>>,
    },
    GenerateProof {
        query: Value,
        reply: oneshot::Sender<Result<(MerkleProof, Transaction), EngineError>>,
    },
    SetAllowedActions {
        actions: BTreeSet<String>,
        reply: oneshot::Sender<()>,
    },
    StartTimeout {
        action_id: String,
        timeout_ms: u64,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<Vec<u8>, SnapshotError>>,
    },
    Health {
        reply: oneshot::Sender<EngineHealth>,
    },
    Tick,
    AutoSave,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Runtime errors seen by handle callers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The owner task has stopped; the engine is gone.
    #[error("engine task stopped")]
    Stopped,
    /// The engine refused or failed the operation.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Persistence failure.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Cloneable handle to a spawned engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    violations: broadcast::Sender<CheatEvidence>,
}

impl EngineHandle {
    /// Receive our peer's commitment.
    pub async fn set_peer_commitment(
        &self,
        public: CommitmentPublic,
        tx: Transaction,
    ) -> Result<Verdict, RuntimeError> {
        self.roundtrip(|reply| Command::SetPeerCommitment { public, tx, reply })
            .await?
            .map_err(RuntimeError::from)
    }

    /// Record our own action.
    pub async fn record_action(
        &self,
        action_type: impl Into<String>,
        data: Value,
    ) -> Result<Transaction, RuntimeError> {
        self.roundtrip(|reply| Command::RecordAction {
            action_type: action_type.into(),
            data,
            reply,
        })
        .await?
        .map_err(RuntimeError::from)
    }

    /// Verify a peer action.
    pub async fn verify_peer_action(&self, tx: Transaction) -> Result<Verdict, RuntimeError> {
        self.roundtrip(|reply| Command::VerifyPeerAction { tx, reply })
            .await?
            .map_err(RuntimeError::from)
    }

    /// Record our response, optionally with a proof.
    pub async fn record_response(
        &self,
        data: Value,
        proof: Option<MerkleProof>,
    ) -> Result<Transaction, RuntimeError> {
        self.roundtrip(|reply| Command::RecordResponse { data, proof, reply })
            .await?
            .map_err(RuntimeError::from)
    }

    /// Verify a peer response.
    pub async fn verify_peer_response(&self, tx: Transaction) -> Result<Verdict, RuntimeError> {
        self.roundtrip(|reply| Command::VerifyPeerResponse { tx, reply })
            .await?
            .map_err(RuntimeError::from)
    }

    /// Produce a membership proof for a query.
    pub async fn generate_proof(
        &self,
        query: Value,
    ) -> Result<(MerkleProof, Transaction), RuntimeError> {
        self.roundtrip(|reply| Command::GenerateProof { query, reply })
            .await?
            .map_err(RuntimeError::from)
    }

    /// Declare the peer action allowlist.
    pub async fn set_allowed_actions(
        &self,
        actions: impl IntoIterator<Item = String>,
    ) -> Result<(), RuntimeError> {
        self.roundtrip(|reply| Command::SetAllowedActions {
            actions: actions.into_iter().collect(),
            reply,
        })
        .await
    }

    /// Re-arm the pending action's deadline.
    pub async fn start_timeout(
        &self,
        action_id: impl Into<String>,
        timeout_ms: u64,
    ) -> Result<bool, RuntimeError> {
        self.roundtrip(|reply| Command::StartTimeout {
            action_id: action_id.into(),
            timeout_ms,
            reply,
        })
        .await
    }

    /// Capture a snapshot of the engine state.
    pub async fn snapshot(&self) -> Result<Vec<u8>, RuntimeError> {
        self.roundtrip(|reply| Command::Snapshot { reply })
            .await?
            .map_err(RuntimeError::from)
    }

    /// Read liveness counters.
    pub async fn health(&self) -> Result<EngineHealth, RuntimeError> {
        self.roundtrip(|reply| Command::Health { reply }).await
    }

    /// Violations detected by the enforcement monitor.
    pub fn subscribe_violations(&self) -> broadcast::Receiver<CheatEvidence> {
        self.violations.subscribe()
    }

    /// Graceful shutdown: flush the snapshot if persistence is on, stop
    /// the monitor and auto-save tasks, and drop the identity keys.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.roundtrip(|reply| Command::Shutdown { reply }).await
    }

    async fn roundtrip<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RuntimeError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| RuntimeError::Stopped)?;
        response.await.map_err(|_| RuntimeError::Stopped)
    }
}

/// Move an engine onto its owner task and start the cooperative monitor
/// and auto-save tasks its options ask for.
pub fn spawn(engine: Engine) -> EngineHandle {
    let (commands, receiver) = mpsc::channel(64);
    let (violations, _) = broadcast::channel(16);

    let options = engine.options().clone();

    if options.enable_enforcement {
        let tick_commands = commands.clone();
        let tick_ms = options.monitor_tick_ms.max(1);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(tick_ms));
            loop {
                ticker.tick().await;
                if tick_commands.send(Command::Tick).await.is_err() {
                    break;
                }
            }
        });
    }

    if options.enable_persistence {
        if let (Some(interval_ms), Some(_)) =
            (options.auto_save_interval_ms, options.snapshot_path.as_ref())
        {
            let save_commands = commands.clone();
            tokio::spawn(async move {
                let mut ticker = interval(Duration::from_millis(interval_ms.max(1)));
                loop {
                    ticker.tick().await;
                    if save_commands.send(Command::AutoSave).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    let violation_feed = violations.clone();
    tokio::spawn(owner_loop(engine, receiver, violation_feed));

    EngineHandle {
        commands,
        violations,
    }
}

async fn owner_loop(
    mut engine: Engine,
    mut receiver: mpsc::Receiver<Command>,
    violations: broadcast::Sender<CheatEvidence>,
) {
    while let Some(command) = receiver.recv().await {
        match command {
            Command::SetPeerCommitment { public, tx, reply } => {
                let _ = reply.send(engine.set_peer_commitment(public, tx));
            }
            Command::RecordAction {
                action_type,
                data,
                reply,
            } => {
                let _ = reply.send(engine.record_self_action(&action_type, data));
            }
            Command::VerifyPeerAction { tx, reply } => {
                let _ = reply.send(engine.verify_peer_action(&tx));
            }
            Command::RecordResponse { data, proof, reply } => {
                let _ = reply.send(engine.record_self_response(data, proof.as_ref()));
            }
            Command::VerifyPeerResponse { tx, reply } => {
                let _ = reply.send(engine.verify_peer_response(&tx));
            }
            Command::GenerateProof { query, reply } => {
                let _ = reply.send(engine.generate_proof(&query));
            }
            Command::SetAllowedActions { actions, reply } => {
                engine.set_allowed_actions(actions);
                let _ = reply.send(());
            }
            Command::StartTimeout {
                action_id,
                timeout_ms,
                reply,
            } => {
                let _ = reply.send(engine.start_timeout(&action_id, timeout_ms));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(engine.snapshot());
            }
            Command::Health { reply } => {
                let _ = reply.send(engine.health());
            }
            Command::Tick => match engine.check_enforcement() {
                Ok(Some(evidence)) => {
                    let _ = violations.send(evidence);
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "enforcement tick failed"),
            },
            Command::AutoSave => {
                if let Err(e) = engine.flush_snapshot() {
                    error!(error = %e, "auto-save failed");
                } else {
                    debug!("auto-save complete");
                }
            }
            Command::Shutdown { reply } => {
                if engine.options().enable_persistence
                    && engine.options().snapshot_path.is_some()
                {
                    if let Err(e) = engine.flush_snapshot() {
                        error!(error = %e, "final snapshot failed");
                    }
                }
                info!("engine shut down");
                let _ = reply.send(());
                break;
            }
        }
    }
    // Dropping the engine here erases the identity's secret key.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::Identity;
    use crate::proof::commitment::{GridCommitment, GridQuery};
    use crate::protocol::cheating::CheatKind;
    use crate::protocol::engine::{EngineOptions, Phase};
    use serde_json::json;

    fn active_pair(options_a: EngineOptions, options_b: EngineOptions) -> (Engine, Engine) {
        let alice_identity = Identity::from_seed(b"rt-alice").unwrap();
        let bob_identity = Identity::from_seed(b"rt-bob").unwrap();
        let mut alice = Engine::new(
            alice_identity,
            Box::new(GridCommitment::new(4, [(0, 0)], b"alpha").unwrap()),
            options_a,
        )
        .unwrap();
        let mut bob = Engine::new(
            bob_identity,
            Box::new(GridCommitment::new(4, [(3, 3)], b"beta").unwrap()),
            options_b,
        )
        .unwrap();

        let alice_public = alice.set_self_commitment().unwrap();
        let bob_public = bob.set_self_commitment().unwrap();
        let alice_tx = alice.self_commit_tx().unwrap().clone();
        let bob_tx = bob.self_commit_tx().unwrap().clone();
        alice.set_peer_commitment(bob_public, bob_tx).unwrap();
        bob.set_peer_commitment(alice_public, alice_tx).unwrap();
        (alice, bob)
    }

    fn mover_first(pair: (Engine, Engine)) -> (Engine, Engine) {
        let (alice, bob) = pair;
        if alice.state().turn.as_deref() == Some(alice.participant_id()) {
            (alice, bob)
        } else {
            (bob, alice)
        }
    }

    #[tokio::test]
    async fn test_command_roundtrip() {
        let (mover, _responder) =
            mover_first(active_pair(EngineOptions::default(), EngineOptions::default()));
        let handle = spawn(mover);

        let health = handle.health().await.unwrap();
        assert_eq!(health.phase, Phase::Active);

        let tx = handle
            .record_action("query_cell", json!({"query": {"x": 1, "y": 1}}))
            .await
            .unwrap();
        assert!(tx.verify_signature());

        let bytes = handle.snapshot().await.unwrap();
        assert!(!bytes.is_empty());

        handle.shutdown().await.unwrap();
        assert!(matches!(
            handle.health().await,
            Err(RuntimeError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_proof_through_handle() {
        let (mover, responder) =
            mover_first(active_pair(EngineOptions::default(), EngineOptions::default()));
        let _ = mover;
        let handle = spawn(responder);

        let (proof, wrapper) = handle
            .generate_proof(json!({"x": 3, "y": 3}))
            .await
            .unwrap();
        assert!(wrapper.verify_signature());
        assert_eq!(proof.leaf_index, 3 * 4 + 3);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_monitor_emits_timeout_violation() {
        let options = EngineOptions {
            monitor_tick_ms: 10,
            default_action_timeout_ms: 30,
            ..Default::default()
        };
        let (mut mover, _responder) = mover_first(active_pair(options.clone(), options));

        mover
            .record_self_action("query_cell", json!({"query": {"x": 0, "y": 0}}))
            .unwrap();

        let handle = spawn(mover);
        let mut violations = handle.subscribe_violations();

        let evidence = tokio::time::timeout(Duration::from_secs(2), violations.recv())
            .await
            .expect("monitor should fire within the window")
            .unwrap();
        assert_eq!(evidence.kind, CheatKind::TimeoutStall);

        let health = handle.health().await.unwrap();
        assert_eq!(health.phase, Phase::Terminated);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_save_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auto.json");
        let options = EngineOptions {
            enable_persistence: true,
            snapshot_path: Some(path.clone()),
            auto_save_interval_ms: Some(10),
            ..Default::default()
        };
        let (mover, _responder) = mover_first(active_pair(options.clone(), options));

        let handle = spawn(mover);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !path.exists() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("auto-save should write within the window");

        handle.shutdown().await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("final.json");
        let options = EngineOptions {
            enable_persistence: true,
            snapshot_path: Some(path.clone()),
            auto_save_interval_ms: None,
            ..Default::default()
        };
        let (mover, _responder) = mover_first(active_pair(options.clone(), options));

        let handle = spawn(mover);
        assert!(!path.exists());
        handle.shutdown().await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_allowlist_through_handle() {
        let (mover, responder) =
            mover_first(active_pair(EngineOptions::default(), EngineOptions::default()));
        let mut mover = mover;
        let tx = mover
            .record_self_action("launch_missile", json!({}))
            .unwrap();

        let handle = spawn(responder);
        handle
            .set_allowed_actions(["query_cell".to_string()])
            .await
            .unwrap();

        let verdict = handle.verify_peer_action(tx).await.unwrap();
        assert!(matches!(verdict, Verdict::Evidence(e) if e.kind == CheatKind::InvalidMove));
        handle.shutdown().await.unwrap();
    }

    #[test]
    fn test_grid_query_helper_type() {
        // Guard the query shape the handle methods expect.
        let query = GridQuery { x: 3, y: 3 };
        assert_eq!(serde_json::to_value(query).unwrap(), json!({"x": 3, "y": 3}));
    }
}
