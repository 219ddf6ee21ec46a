//! The deployment orchestrator: the ≈30-state update state machine, the
//! daemon loop that drives it on a schedule, the standalone one-shot driver,
//! and the ambient observability/configuration/error stack around them
//! (C5–C10 of the overall design, plus the external-collaborator traits the
//! state machine consumes — the installer backend, the inventory gatherer,
//! and the IPC handler surface).
//!
//! Grounded on the teacher's `shipper` crate: a single top-level crate that
//! owns the orchestration engine, its CLI-facing entry points, and the
//! ambient stack (config, events, logging) together, rather than splitting
//! each concern into its own published crate.

pub mod config;
pub mod daemon;
pub mod dependency;
pub mod error;
pub mod events;
pub mod hooks;
pub mod installer;
pub mod inventory;
pub mod ipc;
pub mod log;
pub mod machine;
pub mod server;
pub mod standalone;

pub use machine::{Deployment, DeploymentOutcome};
