//! Re-exported at `mender_core::error` per §4.10, mirroring `config.rs`:
//! `CoreError` is defined in `mender-types` (so every crate in the workspace
//! can return it without depending on the orchestrator), but the
//! orchestrator is where callers actually construct and match on it.

pub use mender_types::error::CoreError;
