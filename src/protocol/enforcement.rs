//! Enforcement Monitor
//!
//! Local, deterministic rule enforcement: pending-action deadlines and the
//! application-declared action allowlist. Detection reads only the observed
//! state plus a caller-supplied clock; no network I/O happens here. Turn
//! ordering itself is checked at append time by the engine.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::protocol::cheating::{CheatEvidence, CheatKind};

/// An action awaiting its counterpart, with a deadline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    /// Unique action identifier.
    pub id: String,
    /// Application action type.
    pub action_type: String,
    /// Participant id that owes the next move for this action.
    pub owed_by: String,
    /// Application payload of the action, kept so the eventual response
    /// can be checked against what was asked.
    pub data: Value,
    /// When the wait started, milliseconds since the epoch.
    pub started_at: u64,
    /// How long the owing participant has, in milliseconds.
    pub timeout_ms: u64,
}

impl PendingAction {
    /// Whether the deadline has passed at the given clock reading.
    pub fn expired_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.started_at) > self.timeout_ms
    }
}

/// Enforcement configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnforcementConfig {
    /// Monitor cadence in milliseconds.
    pub tick_ms: u64,
    /// Deadline applied to actions started without an explicit timeout.
    pub default_action_timeout_ms: u64,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            default_action_timeout_ms: 30_000,
        }
    }
}

/// Rule enforcement state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Enforcement {
    /// Monitor settings.
    pub config: EnforcementConfig,
    allowed_actions: BTreeSet<String>,
}

impl Enforcement {
    /// Create with the given config and an empty (permissive) allowlist.
    pub fn new(config: EnforcementConfig) -> Self {
        Self {
            config,
            allowed_actions: BTreeSet::new(),
        }
    }

    /// Declare the set of action types the application accepts. An empty
    /// set means no restriction.
    pub fn set_allowed_actions(&mut self, actions: impl IntoIterator<Item = String>) {
        self.allowed_actions = actions.into_iter().collect();
    }

    /// Whether an action type passes the allowlist.
    pub fn action_allowed(&self, action_type: &str) -> bool {
        self.allowed_actions.is_empty() || self.allowed_actions.contains(action_type)
    }

    /// The declared allowlist.
    pub fn allowed_actions(&self) -> &BTreeSet<String> {
        &self.allowed_actions
    }

    /// Inspect a pending action at the given clock reading.
    ///
    /// Emits `TIMEOUT_STALL` naming the peer when the peer owes the move
    /// and the deadline has passed. A deadline we owe is the peer's to
    /// complain about, never ours.
    pub fn check_timeout(
        &self,
        pending: Option<&PendingAction>,
        peer_id: Option<&str>,
        now_ms: u64,
    ) -> Option<CheatEvidence> {
        let pending = pending?;
        let peer_id = peer_id?;
        if pending.owed_by != peer_id || !pending.expired_at(now_ms) {
            return None;
        }

        Some(CheatEvidence::new(
            CheatKind::TimeoutStall,
            peer_id,
            json!({
                "action_id": pending.id,
                "action_type": pending.action_type,
                "started_at": pending.started_at,
                "timeout_ms": pending.timeout_ms,
                "observed_at": now_ms,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(owed_by: &str) -> PendingAction {
        PendingAction {
            id: "action-1".into(),
            action_type: "query_cell".into(),
            owed_by: owed_by.into(),
            data: json!({"query": {"x": 0, "y": 0}}),
            started_at: 10_000,
            timeout_ms: 5_000,
        }
    }

    #[test]
    fn test_expiry_boundary() {
        let action = pending("bob");
        assert!(!action.expired_at(15_000)); // exactly at the deadline
        assert!(action.expired_at(15_001));
    }

    #[test]
    fn test_timeout_names_the_peer() {
        let enforcement = Enforcement::new(EnforcementConfig::default());
        let action = pending("bob");

        let evidence = enforcement
            .check_timeout(Some(&action), Some("bob"), 16_000)
            .unwrap();
        assert_eq!(evidence.kind, CheatKind::TimeoutStall);
        assert_eq!(evidence.accused, "bob");
        assert_eq!(evidence.witness["action_id"], "action-1");
    }

    #[test]
    fn test_no_evidence_before_deadline() {
        let enforcement = Enforcement::new(EnforcementConfig::default());
        let action = pending("bob");
        assert!(enforcement
            .check_timeout(Some(&action), Some("bob"), 12_000)
            .is_none());
    }

    #[test]
    fn test_own_deadline_is_not_a_violation() {
        let enforcement = Enforcement::new(EnforcementConfig::default());
        let action = pending("alice"); // we owe this one
        assert!(enforcement
            .check_timeout(Some(&action), Some("bob"), 60_000)
            .is_none());
    }

    #[test]
    fn test_allowlist() {
        let mut enforcement = Enforcement::new(EnforcementConfig::default());
        // Empty allowlist permits everything.
        assert!(enforcement.action_allowed("anything"));

        enforcement.set_allowed_actions(["query_cell".to_string(), "pass".to_string()]);
        assert!(enforcement.action_allowed("query_cell"));
        assert!(!enforcement.action_allowed("launch_missile"));
    }
}
