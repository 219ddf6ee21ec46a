//! Domain types shared by every component of the update orchestrator.
//!
//! This crate has no behavior of its own — it is the vocabulary the state
//! machine (`mender-core`), the control-map pool (`mender-policy`), the
//! persistent store (`mender-store`), and the authorization manager
//! (`mender-auth`) all speak. Keeping it dependency-light means any of those
//! crates can be swapped or tested in isolation without pulling in the rest.
//!
//! ## Modules
//!
//! - [`error`] — the crate-wide `CoreError` taxonomy (transient / fatal /
//!   unauthorized / already-installed).
//! - [`artifact`] — `UpdateInfo`, `ArtifactInfo`, `ArtifactProvides`, and the
//!   reboot/rollback tri-states attached to a deployment.
//! - [`state_data`] — the persistent `StateData` checkpoint and its
//!   store-count bookkeeping.
//! - [`control_map`] — `UpdateControlMap` and the `{action, on_map_expire,
//!   on_action_executed}` triplet.
//! - [`state_id`] — the ≈30-member state enumeration and the hook-name
//!   classifier (`Transition`, `Phase`).
//! - [`token`] — the opaque `AuthToken`.

pub mod artifact;
pub mod control_map;
pub mod error;
pub mod state_data;
pub mod state_id;
pub mod token;

pub use artifact::{ArtifactInfo, ArtifactProvides, RebootType, SupportsRollback, UpdateInfo};
pub use control_map::{Action, CheckpointActions, ControlMapId, UpdateControlMap};
pub use error::CoreError;
pub use state_data::StateData;
pub use state_id::{Phase, StateId, Transition};
pub use token::AuthToken;
