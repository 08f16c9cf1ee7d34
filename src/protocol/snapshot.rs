//! State Persistence
//!
//! A snapshot is one canonical JSON object holding the ledger, the
//! protocol state, and the public identity. Private keys are never
//! serialized; recovery loads them from the caller's secret store.
//! Writes go to a temporary sibling file and are renamed into place, so a
//! reader observes either the old snapshot or the new one, never a
//! truncation.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::core::canonical::{canonical_bytes, CanonicalError};
use crate::core::identity::Identity;
use crate::ledger::chain::Ledger;
use crate::proof::commitment::CommitmentScheme;
use crate::protocol::engine::{Engine, EngineOptions, ProtocolState};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Persistence errors.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The snapshot bytes do not parse, fail ledger replay, or disagree
    /// with the supplied secret material. Never silently repaired.
    #[error("corrupt state")]
    CorruptState,

    /// The snapshot was written by an incompatible format version.
    #[error("snapshot version {found} unsupported (expected {SNAPSHOT_VERSION})")]
    VersionMismatch {
        /// Version found in the file.
        found: u32,
    },

    /// No snapshot path was configured.
    #[error("no snapshot path configured")]
    NoPath,

    /// Filesystem failure, surfaced unchanged.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The snapshot could not be canonically encoded.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

/// On-disk snapshot shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    /// Format version.
    pub version: u32,
    /// Full ledger, blocks and pending batch.
    pub ledger: Ledger,
    /// Protocol state at capture time.
    pub protocol: ProtocolState,
    /// Hex public key of the snapshot owner.
    pub identity_public: String,
}

impl Snapshot {
    /// Capture an engine's persistent state.
    pub fn capture(engine: &Engine) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            ledger: engine.ledger().clone(),
            protocol: engine.state().clone(),
            identity_public: engine.participant_id().to_string(),
        }
    }

    /// Canonical bytes of the snapshot.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(canonical_bytes(self)?)
    }

    /// Parse snapshot bytes without yet trusting them.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let snapshot: Snapshot =
            serde_json::from_slice(bytes).map_err(|_| SnapshotError::CorruptState)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::VersionMismatch {
                found: snapshot.version,
            });
        }
        Ok(snapshot)
    }

    /// Write atomically: temporary sibling first, then rename into place.
    pub fn save_atomic(&self, path: &Path) -> Result<(), SnapshotError> {
        let tmp = tmp_path(path);
        fs::write(&tmp, self.to_bytes()?)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "snapshot written");
        Ok(())
    }

    /// Read a snapshot file.
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

impl Engine {
    /// Serialize this engine's persistent state.
    pub fn snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        Snapshot::capture(self).to_bytes()
    }

    /// Write the snapshot to the configured path, atomically.
    pub fn flush_snapshot(&self) -> Result<(), SnapshotError> {
        let path = self
            .options()
            .snapshot_path
            .clone()
            .ok_or(SnapshotError::NoPath)?;
        Snapshot::capture(self).save_atomic(&path)?;
        info!(path = %path.display(), "snapshot flushed");
        Ok(())
    }

    /// Rebuild an engine from snapshot bytes plus the separately stored
    /// secret material. The ledger is re-verified before anything is
    /// trusted; any failure surfaces as `CorruptState`.
    pub fn restore(
        bytes: &[u8],
        identity: Identity,
        scheme: Box<dyn CommitmentScheme>,
        options: EngineOptions,
    ) -> Result<Engine, SnapshotError> {
        let snapshot = Snapshot::from_bytes(bytes)?;

        if snapshot.identity_public != identity.participant_id()
            || snapshot.protocol.self_id != identity.participant_id()
        {
            return Err(SnapshotError::CorruptState);
        }
        if let Some(self_commit) = &snapshot.protocol.self_commit {
            // The reloaded witness must still produce the committed root.
            if scheme.commit_root() != self_commit.root {
                return Err(SnapshotError::CorruptState);
            }
        }
        if snapshot.ledger.verify().is_err() {
            return Err(SnapshotError::CorruptState);
        }

        info!(
            blocks = snapshot.ledger.blocks().len(),
            phase = ?snapshot.protocol.phase,
            "state restored from snapshot"
        );
        Ok(Engine::from_restored(
            identity,
            scheme,
            snapshot.ledger,
            snapshot.protocol,
            options,
        ))
    }
}
