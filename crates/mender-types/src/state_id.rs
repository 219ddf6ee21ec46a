//! The state enumeration and its hook-name classifier (§3 `State`, §4.3).

use serde::{Deserialize, Serialize};

/// One of the ≈30 nodes in the deployment state graph (§4.5).
///
/// Re-entry after a crash reads this tag from the most recent `StateData`
/// and dispatches to the matching handler — see `mender-core::machine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateId {
    Init,
    Idle,
    AuthorizeWait,
    Authorize,
    CheckWait,
    UpdateCheck,
    InventoryUpdate,
    UpdateFetch,
    FetchStoreRetryWait,
    UpdateStore,
    UpdateAfterStore,
    UpdateInstall,
    UpdateReboot,
    UpdateVerifyReboot,
    UpdateAfterReboot,
    UpdateCommit,
    UpdateAfterFirstCommit,
    UpdateAfterCommit,
    UpdateCleanup,
    UpdateError,
    UpdateRollback,
    UpdateRollbackReboot,
    UpdateVerifyRollbackReboot,
    UpdateAfterRollbackReboot,
    UpdateStatusReport,
    UpdateStatusReportRetry,
    ReportError,
    /// Terminal marker for the standalone driver (§4.7); the daemon loop
    /// (§4.6) never reaches this — it returns to `Idle` instead.
    Final,
}

/// The three hook phases a transition may expose (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Enter,
    Leave,
    Error,
}

impl Phase {
    pub fn as_wire_name(&self) -> &'static str {
        match self {
            Phase::Enter => "Enter",
            Phase::Leave => "Leave",
            Phase::Error => "Error",
        }
    }
}

/// The hook-name classifier for one state (§3 `Transition`).
///
/// `hook_base` is the `<state>` component of the `<state>_<phase>_NN` script
/// filename convention (§4.3, §6); `installer_op` is the bare operation name
/// the matching `Installer` method logs (§4.7's hook-log contract interleaves
/// both).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub hook_base: &'static str,
    pub installer_op: Option<&'static str>,
    pub is_gated_checkpoint: bool,
}

impl StateId {
    /// The transition classifier for this state, or `None` for states with
    /// no hook boundary (pure wait/dispatch states).
    pub fn transition(&self) -> Option<Transition> {
        let t = |hook_base, installer_op, is_gated_checkpoint| {
            Some(Transition { hook_base, installer_op, is_gated_checkpoint })
        };
        match self {
            StateId::Idle => t("Idle", None, false),
            StateId::UpdateStore => t("Download", Some("Download"), false),
            StateId::UpdateInstall => t("ArtifactInstall", Some("ArtifactInstall"), true),
            StateId::UpdateReboot => t("ArtifactReboot", Some("Reboot"), true),
            StateId::UpdateCommit => t("ArtifactCommit", Some("ArtifactCommit"), true),
            StateId::UpdateAfterFirstCommit => t("ArtifactCommit", Some("ArtifactCommit"), false),
            StateId::UpdateRollback => t("ArtifactRollback", Some("ArtifactRollback"), false),
            StateId::UpdateRollbackReboot => t("ArtifactRollbackReboot", Some("RollbackReboot"), false),
            StateId::UpdateError => t("ArtifactFailure", Some("ArtifactFailure"), false),
            StateId::UpdateCleanup => t("Cleanup", Some("Cleanup"), false),
            _ => None,
        }
    }

    /// Whether `phase` at this state is unconditionally run with
    /// `ignore_errors = true`, regardless of what the caller requested
    /// (§4.3: `ToArtifactCommit_Leave`, `ToArtifactReboot_Leave`,
    /// `ToIdle_Enter`).
    pub fn forces_ignore_errors(&self, phase: Phase) -> bool {
        if phase == Phase::Error {
            return true;
        }
        matches!(
            (self, phase),
            (StateId::UpdateCommit, Phase::Leave)
                | (StateId::UpdateReboot, Phase::Leave)
                | (StateId::Idle, Phase::Enter)
        )
    }

    /// The checkpoint name consulted via `mender-policy` before this state
    /// runs, if it is a gated checkpoint (§4.2, §4.5).
    pub fn checkpoint(&self) -> Option<mender_checkpoint::Checkpoint> {
        match self {
            StateId::UpdateInstall => Some(mender_checkpoint::Checkpoint::ArtifactInstallEnter),
            StateId::UpdateReboot => Some(mender_checkpoint::Checkpoint::ArtifactRebootEnter),
            StateId::UpdateCommit => Some(mender_checkpoint::Checkpoint::ArtifactCommitEnter),
            _ => None,
        }
    }
}

/// Re-exported so `state_id` doesn't need a direct dependency cycle back to
/// `control_map` for the `Checkpoint` type it classifies states against.
mod mender_checkpoint {
    pub use crate::control_map::Checkpoint;
}
