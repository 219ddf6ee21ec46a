//! The two out-of-process surfaces (§6): `AuthenticationManager` and
//! `UpdateManager`. This core has no D-Bus binding dependency of its own —
//! that is transport and out of scope (§1) — so both surfaces are exposed as
//! a plain async trait an external binary can wire to whatever bus it likes.

use anyhow::Result;
use mender_policy::ControlMapPool;
use mender_store::KvOps;
use mender_types::control_map::UpdateControlMap;
use mender_types::token::AuthToken;

/// `io.mender.Authentication1` and `io.mender.Update1` together, collapsed
/// into one trait because both are served by the same daemon process and
/// share no state with external callers beyond what's passed in.
#[async_trait::async_trait]
pub trait IpcHandler: Send + Sync {
    /// `GetJwtToken() -> string`: the cached token, no network call.
    async fn get_jwt_token(&self) -> AuthToken;

    /// `FetchJwtToken() -> bool`: triggers a refresh; returns once the
    /// refresh has been *requested*, matching the authorization manager's
    /// own fire-and-acknowledge `fetch()` contract.
    async fn fetch_jwt_token(&self) -> bool;

    /// `SetUpdateControlMap(json) -> refresh_timeout_seconds`. Unknown
    /// top-level fields in `json` are rejected by `serde`'s default
    /// (non-`deny_unknown_fields`) behavior being overridden at the call
    /// site via [`parse_control_map_json`]. An empty `states` map deletes
    /// the map (by ID, all priorities) instead of inserting it.
    async fn set_update_control_map(&self, json: &str) -> Result<u64>;
}

const ALLOWED_CONTROL_MAP_FIELDS: &[&str] =
    &["id", "priority", "states", "inserted_at", "expiry_time", "expired"];

/// Parse and validate an `UpdateControlMap` JSON document, rejecting unknown
/// top-level fields (§6: "unknown top-level fields are rejected"). Checked
/// manually against [`ALLOWED_CONTROL_MAP_FIELDS`] rather than via
/// `#[serde(deny_unknown_fields)]` combined with `#[serde(flatten)]`, a
/// combination serde does not support.
pub fn parse_control_map_json(json: &str) -> Result<UpdateControlMap> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    if let Some(object) = value.as_object() {
        for key in object.keys() {
            if !ALLOWED_CONTROL_MAP_FIELDS.contains(&key.as_str()) {
                anyhow::bail!("unknown field in update control map document: {key}");
            }
        }
    }

    let map: UpdateControlMap = serde_json::from_value(value)?;
    map.validate().map_err(anyhow::Error::msg)?;
    Ok(map)
}

/// The in-process handler backing the daemon: wires IPC calls to the
/// authorization manager handle and the control-map pool. `update_control_timeout_secs`
/// is halved to compute the returned refresh timeout (§6).
pub struct DaemonIpcHandler<S> {
    pub auth: mender_auth::AuthManagerHandle,
    pub control_maps: std::sync::Arc<ControlMapPool<S>>,
    pub update_control_timeout_secs: u64,
}

#[async_trait::async_trait]
impl<S: KvOps + Send + Sync + 'static> IpcHandler for DaemonIpcHandler<S> {
    async fn get_jwt_token(&self) -> AuthToken {
        self.auth.get().await
    }

    async fn fetch_jwt_token(&self) -> bool {
        self.auth.fetch().await;
        true
    }

    async fn set_update_control_map(&self, json: &str) -> Result<u64> {
        let map = parse_control_map_json(json)?;
        if map.states.is_empty() {
            self.control_maps.delete_all_priorities(&map.id)?;
        } else {
            self.control_maps.insert(map)?;
        }
        Ok(self.update_control_timeout_secs / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_top_level_fields() {
        let json = r#"{"id":"a","priority":0,"states":{},"totally_unknown_field":true}"#;
        assert!(parse_control_map_json(json).is_err());
    }

    #[test]
    fn accepts_well_formed_document() {
        let json = r#"{"id":"a","priority":0,"states":{},"inserted_at":"2024-01-01T00:00:00Z","expiry_time":"2024-01-01T01:00:00Z","expired":false}"#;
        let map = parse_control_map_json(json).unwrap();
        assert_eq!(map.id.to_string(), "a");
    }
}
