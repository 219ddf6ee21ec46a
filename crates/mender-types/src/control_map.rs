//! Deployment-policy documents consulted before gated checkpoints (§3, §4.2).

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The storage key the control-map pool is persisted under.
pub const CONTROL_MAPS_KEY: &str = "update-control-maps";

/// The closed set of checkpoints control maps may gate (§4.2, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Checkpoint {
    ArtifactInstallEnter,
    ArtifactRebootEnter,
    ArtifactCommitEnter,
}

impl Checkpoint {
    pub fn as_wire_name(&self) -> &'static str {
        match self {
            Checkpoint::ArtifactInstallEnter => "ArtifactInstall_Enter",
            Checkpoint::ArtifactRebootEnter => "ArtifactReboot_Enter",
            Checkpoint::ArtifactCommitEnter => "ArtifactCommit_Enter",
        }
    }

    pub fn substate_while_paused(&self) -> &'static str {
        match self {
            Checkpoint::ArtifactInstallEnter => "pause_before_installing",
            Checkpoint::ArtifactRebootEnter => "pause_before_rebooting",
            Checkpoint::ArtifactCommitEnter => "pause_before_committing",
        }
    }
}

/// One of the four actions a control map may dictate at a checkpoint.
///
/// Precedence (highest wins) is `Fail` > `Pause` > `ForceContinue` >
/// `Continue` — encoded in [`Action::precedence`], used by the pool's
/// reduction step (§4.2 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Continue,
    ForceContinue,
    Pause,
    Fail,
}

impl Action {
    fn precedence(&self) -> u8 {
        match self {
            Action::Continue => 0,
            Action::ForceContinue => 1,
            Action::Pause => 2,
            Action::Fail => 3,
        }
    }

    /// The most severe action among a non-empty slice, by precedence.
    pub fn dominant(actions: &[Action]) -> Action {
        actions
            .iter()
            .copied()
            .max_by(|a, b| a.precedence().cmp(&b.precedence()))
            .unwrap_or(Action::Continue)
    }
}

impl PartialOrd for Action {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.precedence().cmp(&other.precedence()))
    }
}
impl Ord for Action {
    fn cmp(&self, other: &Self) -> Ordering {
        self.precedence().cmp(&other.precedence())
    }
}

/// The `{action, on_map_expire, on_action_executed}` triplet for one
/// checkpoint.
///
/// `on_map_expire` may never be `Pause` (a map cannot hand the daemon an
/// unresolvable wait once it can no longer be refreshed); this is enforced by
/// [`UpdateControlMap::validate`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ActionTriplet {
    pub action: Action,
    pub on_map_expire: Action,
    pub on_action_executed: Action,
}

/// Per-checkpoint action triplets for one control map.
pub type CheckpointActions = BTreeMap<Checkpoint, ActionTriplet>;

/// A UUID-shaped control-map identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ControlMapId(pub String);

impl std::fmt::Display for ControlMapId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A policy document scoped to one deployment ID (or a priority-ordered
/// policy stack), dictating per-checkpoint action (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateControlMap {
    pub id: ControlMapId,
    pub priority: i64,
    pub states: CheckpointActions,
    pub inserted_at: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
    #[serde(default)]
    pub expired: bool,
}

impl UpdateControlMap {
    pub fn new(
        id: ControlMapId,
        priority: i64,
        states: CheckpointActions,
        inserted_at: DateTime<Utc>,
        expiry_time: DateTime<Utc>,
    ) -> Self {
        Self { id, priority, states, inserted_at, expiry_time, expired: false }
    }

    /// Reject maps whose `on_map_expire` is `Pause` for any checkpoint
    /// (§3 refinement).
    pub fn validate(&self) -> Result<(), String> {
        for (checkpoint, triplet) in &self.states {
            if triplet.on_map_expire == Action::Pause {
                return Err(format!(
                    "control map {} has on_map_expire = pause at {:?}, which is not allowed",
                    self.id, checkpoint
                ));
            }
        }
        Ok(())
    }

    /// The (ID, priority) identity used for pool-replacement semantics.
    pub fn identity(&self) -> (ControlMapId, i64) {
        (self.id.clone(), self.priority)
    }

    /// `insert_time + (expiry - insert_time) / 2` (§4.2).
    pub fn half_time(&self) -> DateTime<Utc> {
        let half = (self.expiry_time - self.inserted_at) / 2;
        self.inserted_at + half
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_time
    }
}
