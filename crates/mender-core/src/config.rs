//! Re-exported at `mender_core::config` per §4.9 so callers depend on one
//! crate path for both the orchestrator and its configuration, the way the
//! teacher's `shipper::config` lives alongside `shipper::engine` in a single
//! crate rather than forcing callers to pull in `mender-config` directly.

pub use mender_config::{CONFIG_FILE, ENV_PREFIX, Settings};
