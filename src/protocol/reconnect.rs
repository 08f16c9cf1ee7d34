//! Reconnection and Ledger Sync
//!
//! After a disconnect each peer holds its own snapshot. On reconnect the
//! peers exchange their highest block index and ship the missing suffix;
//! every incoming block is re-verified before it extends the local chain.
//! A divergence that prefix extension cannot resolve is fatal: either the
//! diverging material fails signature checks, which is ledger tampering by
//! the peer, or the fork is genuinely unresolvable.

use std::path::Path;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::core::identity::Identity;
use crate::ledger::block::Block;
use crate::ledger::chain::{FaultReason, Ledger};
use crate::proof::commitment::CommitmentScheme;
use crate::protocol::cheating::{CheatEvidence, CheatKind};
use crate::protocol::engine::{Engine, EngineOptions};
use crate::protocol::snapshot::{Snapshot, SnapshotError};
use crate::protocol::wire::{Envelope, EnvelopeKind};

/// Sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The envelope is not a well-formed sync message.
    #[error("malformed sync message")]
    BadEnvelope,

    /// The chains fork and neither side's diverging material fails
    /// verification. Cannot be resolved mechanically.
    #[error("unresolvable fork")]
    UnresolvableFork,

    /// The peer's suffix fails verification; evidence attached.
    #[error("tampered chain from peer")]
    Tamper(CheatEvidence),
}

/// Build the SYNC_REQ advertising our highest block index.
pub fn sync_request(ledger: &Ledger) -> Envelope {
    Envelope::sync_request(ledger.height())
}

/// Answer a SYNC_REQ with our suffix, one SYNC_RESP envelope per block.
pub fn sync_response(ledger: &Ledger, request: &Envelope) -> Result<Vec<Envelope>, SyncError> {
    if request.kind != EnvelopeKind::SyncReq {
        return Err(SyncError::BadEnvelope);
    }
    let from = request.from_index.ok_or(SyncError::BadEnvelope)?;

    Ok(ledger
        .blocks()
        .iter()
        .filter(|block| block.index > from)
        .cloned()
        .map(Envelope::sync_block)
        .collect())
}

/// Apply a received suffix to the local ledger. Returns how many blocks
/// extended the chain.
///
/// Blocks at indices we already hold must match byte for byte; a mismatch
/// is classified by re-verifying the incoming block's signatures. Blocks
/// past our tip extend the chain through full verification.
pub fn apply_sync_blocks(
    ledger: &mut Ledger,
    peer_id: &str,
    blocks: impl IntoIterator<Item = Block>,
) -> Result<u64, SyncError> {
    let mut applied = 0;

    for block in blocks {
        if block.index <= ledger.height() {
            let local = &ledger.blocks()[block.index as usize];
            if local.hash == block.hash {
                continue;
            }
            return Err(classify_divergence(peer_id, &block));
        }

        if block.index != ledger.height() + 1 {
            warn!(
                expected = ledger.height() + 1,
                got = block.index,
                "sync suffix has a gap"
            );
            return Err(SyncError::UnresolvableFork);
        }

        let index = block.index;
        match ledger.try_extend(block.clone()) {
            Ok(()) => {
                applied += 1;
                info!(index, "extended chain from peer suffix");
            }
            Err(fault) if fault.reason == FaultReason::BadSignature => {
                return Err(classify_divergence(peer_id, &block));
            }
            Err(fault) => {
                warn!(%fault, "peer suffix failed verification");
                return Err(SyncError::UnresolvableFork);
            }
        }
    }

    Ok(applied)
}

/// A block that contradicts local history: tampering if its contents fail
/// signature verification, an unresolvable fork otherwise.
fn classify_divergence(peer_id: &str, block: &Block) -> SyncError {
    let hash_consistent = matches!(block.compute_hash(), Ok(h) if h == block.hash);
    let signatures_ok = block.transactions.iter().all(|tx| tx.verify_signature());

    if hash_consistent && signatures_ok {
        SyncError::UnresolvableFork
    } else {
        SyncError::Tamper(CheatEvidence::new(
            CheatKind::LedgerTamper,
            peer_id,
            json!({ "block": block }),
        ))
    }
}

/// Reconnect retry schedule: a bounded number of attempts with exponential
/// backoff between them.
#[derive(Clone, Debug)]
pub struct Reconnector {
    /// How many times to try.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each retry.
    pub initial_delay: Duration,
}

impl Default for Reconnector {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(5),
        }
    }
}

impl Reconnector {
    /// Drive a caller-supplied connect attempt until it succeeds or the
    /// schedule is exhausted.
    pub async fn attempt<F, Fut>(&self, mut connect: F) -> bool
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let mut delay = self.initial_delay;
        for attempt in 1..=self.max_attempts {
            info!(attempt, max = self.max_attempts, "reconnection attempt");
            if connect(attempt).await {
                info!("reconnected");
                return true;
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        warn!("reconnection failed after all attempts");
        false
    }
}

/// Resume a session from disk: load the snapshot, re-verify everything,
/// and produce the SYNC_REQ to open tip exchange with the peer.
pub fn resume_from_snapshot(
    path: &Path,
    identity: Identity,
    scheme: Box<dyn CommitmentScheme>,
    options: EngineOptions,
) -> Result<(Engine, Envelope), SnapshotError> {
    let snapshot = Snapshot::load(path)?;
    let engine = Engine::restore(&snapshot.to_bytes()?, identity, scheme, options)?;
    let request = sync_request(engine.ledger());
    Ok((engine, request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::transaction::{MoveType, Transaction};
    use crate::proof::commitment::GridCommitment;
    use serde_json::json;

    fn signed(identity: &Identity, nonce: u64) -> Transaction {
        Transaction::signed(
            identity,
            MoveType::Action,
            json!({"n": nonce}),
            crate::core::now_millis(),
            nonce,
        )
        .unwrap()
    }

    fn grown_ledger(identity: &Identity, blocks: u64) -> Ledger {
        let mut ledger = Ledger::new(2, 2_000).unwrap();
        for n in 1..=blocks {
            ledger.append(signed(identity, n)).unwrap();
            ledger.seal().unwrap();
        }
        ledger
    }

    #[test]
    fn test_suffix_sync_catches_up() {
        let identity = Identity::from_seed(b"sync").unwrap();
        let behind = grown_ledger(&identity, 1);

        // The peer shares the prefix and then grows three more blocks.
        let mut ahead = behind.clone();
        for n in 2..=4 {
            ahead.append(signed(&identity, n)).unwrap();
            ahead.seal().unwrap();
        }

        let mut behind = behind;
        let request = sync_request(&behind);
        let response = sync_response(&ahead, &request).unwrap();
        assert_eq!(response.len(), 3);

        let applied = apply_sync_blocks(
            &mut behind,
            "peer",
            response.into_iter().filter_map(|e| e.block),
        )
        .unwrap();
        assert_eq!(applied, 3);
        assert_eq!(behind.tip().hash, ahead.tip().hash);
        assert!(behind.verify().is_ok());
    }

    #[test]
    fn test_identical_chains_exchange_nothing() {
        let identity = Identity::from_seed(b"sync").unwrap();
        let ledger = grown_ledger(&identity, 2);

        let request = sync_request(&ledger);
        let response = sync_response(&ledger, &request).unwrap();
        assert!(response.is_empty());
    }

    #[test]
    fn test_fork_with_valid_signatures_is_unresolvable() {
        let identity = Identity::from_seed(b"sync").unwrap();
        let shared = grown_ledger(&identity, 1);

        // Both sides extend the shared prefix differently, honestly.
        let mut ours = shared.clone();
        ours.append(signed(&identity, 2)).unwrap();
        ours.seal().unwrap();

        let mut theirs = shared.clone();
        let other_identity = Identity::from_seed(b"other").unwrap();
        theirs.append(signed(&other_identity, 1)).unwrap();
        theirs.seal().unwrap();

        // Ask from the shared prefix to force the diverging block across.
        let from_shared = Envelope::sync_request(shared.height());
        let response = sync_response(&theirs, &from_shared).unwrap();

        let result = apply_sync_blocks(
            &mut ours,
            "peer",
            response.into_iter().filter_map(|e| e.block),
        );
        assert!(matches!(result, Err(SyncError::UnresolvableFork)));
    }

    #[test]
    fn test_tampered_suffix_is_evidence() {
        let identity = Identity::from_seed(b"sync").unwrap();
        let shared = grown_ledger(&identity, 1);

        let mut ours = shared.clone();
        let mut theirs = shared.clone();
        theirs.append(signed(&identity, 2)).unwrap();
        theirs.seal().unwrap();

        // Tamper the suffix block's transaction and fix the hash so only
        // the signature gives it away.
        let mut forged = theirs.blocks()[2].clone();
        forged.transactions[0].data = json!({"n": 999});
        let forged = Block::seal(
            forged.index,
            forged.prev_hash,
            forged.transactions,
            forged.timestamp,
            2,
        )
        .unwrap();

        let result = apply_sync_blocks(&mut ours, "peer", [forged]);
        let Err(SyncError::Tamper(evidence)) = result else {
            panic!("forged suffix must classify as tampering");
        };
        assert_eq!(evidence.kind, CheatKind::LedgerTamper);
        assert_eq!(evidence.accused, "peer");
    }

    #[test]
    fn test_gapped_suffix_is_unresolvable() {
        let identity = Identity::from_seed(b"sync").unwrap();
        let ahead = grown_ledger(&identity, 3);
        let mut behind = Ledger::new(2, 2_000).unwrap();

        // Skipping the peer's early blocks leaves an unfillable gap; their
        // genesis also differs from ours, so index continuity cannot hold.
        let result = apply_sync_blocks(&mut behind, "peer", [ahead.blocks()[3].clone()]);
        assert!(matches!(result, Err(SyncError::UnresolvableFork)));
    }

    #[tokio::test]
    async fn test_reconnector_retries_until_success() {
        let reconnector = Reconnector {
            max_attempts: 4,
            initial_delay: Duration::from_millis(1),
        };

        let mut calls = 0;
        let connected = reconnector
            .attempt(|attempt| {
                calls += 1;
                async move { attempt >= 3 }
            })
            .await;
        assert!(connected);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_reconnector_gives_up() {
        let reconnector = Reconnector {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
        };
        let connected = reconnector.attempt(|_| async { false }).await;
        assert!(!connected);
    }

    #[test]
    fn test_resume_from_snapshot_produces_sync_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let identity = Identity::from_seed(b"resume").unwrap();
        let scheme = GridCommitment::new(4, [(2, 2)], b"seed").unwrap();
        let mut engine = Engine::new(
            identity,
            Box::new(scheme),
            EngineOptions::default(),
        )
        .unwrap();
        engine.set_self_commitment().unwrap();
        Snapshot::capture(&engine).save_atomic(&path).unwrap();

        let identity = Identity::from_seed(b"resume").unwrap();
        let scheme = GridCommitment::new(4, [(2, 2)], b"seed").unwrap();
        let (restored, request) = resume_from_snapshot(
            &path,
            identity,
            Box::new(scheme),
            EngineOptions::default(),
        )
        .unwrap();

        assert_eq!(request.kind, EnvelopeKind::SyncReq);
        assert_eq!(request.from_index, Some(restored.ledger().height()));
        assert_eq!(restored.ledger().height(), engine.ledger().height());
    }
}
