//! Artifact metadata and the deployment record built from it (§3: `UpdateInfo`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Whether an artifact's installer(s) can reverse the install before commit.
///
/// Unknown until the installer is asked; the state machine treats `Unknown`
/// as "assume supported" only long enough to ask, never as a standing
/// default for error recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupportsRollback {
    #[default]
    Unknown,
    Supported,
    NotSupported,
}

/// A payload's declared reboot requirement.
///
/// §9 preserves source ordering: per-payload `Custom` reboots run before any
/// `Automatic` (whole-host) reboot, regardless of which payload declared it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebootType {
    #[default]
    None,
    Custom,
    Automatic,
}

/// Static metadata describing the artifact itself, independent of any one
/// deployment attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub name: String,
    pub group: Option<String>,
    pub compatible_devices: Vec<String>,
    /// Ordered payload type names, e.g. `["rootfs-image"]`.
    pub payload_types: Vec<String>,
    /// `Depends.ArtifactName` / `ArtifactGroup` / `CompatibleDevices` /
    /// `TypeInfoDepends` as declared by the artifact header.
    pub depends_artifact_name: Vec<String>,
    pub depends_artifact_group: Vec<String>,
    pub type_info_depends: BTreeMap<String, serde_json::Value>,
    /// `Provides.ArtifactTypeInfo`, published to the provides snapshot on
    /// successful commit.
    pub type_info_provides: BTreeMap<String, String>,
    /// Patterns of provides keys cleared before the new artifact's provides
    /// are overlaid at commit. `None` clears everything except the new
    /// artifact's own declared keys (§4.5 "ClearsArtifactProvides").
    pub clears_artifact_provides: Option<Vec<String>>,
}

/// One deployment record: artifact metadata plus everything the server (or
/// the standalone driver) attached to this specific attempt.
///
/// Created by the server response or the standalone driver; mutated only by
/// the state machine; destroyed by the cleanup state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub deployment_id: String,
    pub artifact: ArtifactInfo,
    pub source_uri: String,
    pub supports_rollback: SupportsRollback,
    /// Per-payload-type reboot requirement, keyed by payload type name.
    pub reboot_requested: BTreeMap<String, RebootType>,
    pub has_db_schema_update: bool,
    /// Error text accumulated for the final status report, in order.
    #[serde(default)]
    pub error_log: Vec<String>,
}

impl UpdateInfo {
    pub fn new(deployment_id: impl Into<String>, artifact: ArtifactInfo) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            artifact,
            source_uri: String::new(),
            supports_rollback: SupportsRollback::Unknown,
            reboot_requested: BTreeMap::new(),
            has_db_schema_update: false,
            error_log: Vec::new(),
        }
    }

    /// Whether any payload requested an automatic (whole-host) reboot.
    pub fn needs_automatic_reboot(&self) -> bool {
        self.reboot_requested.values().any(|r| *r == RebootType::Automatic)
    }

    /// Payload type names that requested a custom (per-module) reboot, in
    /// declaration order, excluding any that requested automatic.
    pub fn custom_reboot_payloads(&self) -> Vec<&str> {
        self.artifact
            .payload_types
            .iter()
            .filter(|p| self.reboot_requested.get(*p) == Some(&RebootType::Custom))
            .map(String::as_str)
            .collect()
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_log.push(message.into());
    }
}

/// The last committed artifact's name, group, and type-info-provides,
/// consulted by the next artifact's `Depends` check (§3, §4.5).
///
/// Values are `serde_json::Value` rather than `String` so an on-disk
/// snapshot that stores an explicit JSON `null` for a key still parses: the
/// dependency check then treats that key as "no provides available" and
/// fails only the one dependency referencing it (§4.5), instead of the
/// whole map failing to deserialize and every key being silently lost.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactProvides {
    pub artifact_name: String,
    pub artifact_group: Option<String>,
    pub type_info_provides: BTreeMap<String, serde_json::Value>,
}

impl ArtifactProvides {
    /// Apply `ClearsArtifactProvides`, then overlay the new artifact's
    /// declared provides, per §4.5.
    ///
    /// `patterns` support only a trailing `*` wildcard (a glob limited to a
    /// single suffix match), plus the literal key `artifact_group`, which
    /// always clears the group field. `None` clears every existing key
    /// except ones the new artifact re-declares.
    pub fn apply_clears_and_provides(
        &mut self,
        patterns: Option<&[String]>,
        new_name: &str,
        new_group: Option<&str>,
        new_provides: &BTreeMap<String, String>,
    ) -> Result<(), String> {
        match patterns {
            None => {
                self.type_info_provides.retain(|k, _| new_provides.contains_key(k));
            }
            Some(patterns) => {
                for pattern in patterns {
                    if pattern == "artifact_group" {
                        self.artifact_group = None;
                        continue;
                    }
                    if let Some(prefix) = pattern.strip_suffix('*') {
                        self.type_info_provides.retain(|k, _| !k.starts_with(prefix));
                    } else if pattern.contains('*') {
                        return Err(format!("unparseable clears_artifact_provides pattern: {pattern}"));
                    } else {
                        self.type_info_provides.remove(pattern);
                    }
                }
            }
        }

        for (k, v) in new_provides {
            self.type_info_provides.insert(k.clone(), serde_json::Value::String(v.clone()));
        }
        self.artifact_name = new_name.to_string();
        if let Some(group) = new_group {
            self.artifact_group = Some(group.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_reboot_payloads_preserves_declaration_order() {
        let mut info = UpdateInfo::new("dep-1", ArtifactInfo {
            payload_types: vec!["a".into(), "b".into(), "c".into()],
            ..Default::default()
        });
        info.reboot_requested.insert("b".into(), RebootType::Custom);
        info.reboot_requested.insert("a".into(), RebootType::Custom);
        info.reboot_requested.insert("c".into(), RebootType::Automatic);

        assert_eq!(info.custom_reboot_payloads(), vec!["a", "b"]);
        assert!(info.needs_automatic_reboot());
    }

    #[test]
    fn clears_with_trailing_wildcard() {
        let mut provides = ArtifactProvides {
            artifact_name: "old".into(),
            artifact_group: Some("group-a".into()),
            type_info_provides: BTreeMap::from([
                ("rootfs-image.version".to_string(), serde_json::json!("1.0")),
                ("rootfs-image.checksum".to_string(), serde_json::json!("abc")),
                ("other".to_string(), serde_json::json!("keep-me")),
            ]),
        };

        let new_provides = BTreeMap::from([("rootfs-image.version".to_string(), "2.0".to_string())]);
        provides
            .apply_clears_and_provides(
                Some(&["rootfs-image.*".to_string()]),
                "new",
                None,
                &new_provides,
            )
            .expect("apply");

        assert_eq!(provides.artifact_name, "new");
        assert_eq!(provides.type_info_provides.get("other").and_then(|v| v.as_str()), Some("keep-me"));
        assert!(!provides.type_info_provides.contains_key("rootfs-image.checksum"));
        assert_eq!(provides.type_info_provides.get("rootfs-image.version").and_then(|v| v.as_str()), Some("2.0"));
    }

    #[test]
    fn nil_patterns_clear_everything_not_redeclared() {
        let mut provides = ArtifactProvides {
            artifact_name: "old".into(),
            artifact_group: None,
            type_info_provides: BTreeMap::from([
                ("keep".to_string(), serde_json::json!("x")),
                ("drop".to_string(), serde_json::json!("y")),
            ]),
        };
        let new_provides = BTreeMap::from([("keep".to_string(), "z".to_string())]);

        provides.apply_clears_and_provides(None, "new", Some("g"), &new_provides).expect("apply");

        assert_eq!(provides.type_info_provides.len(), 1);
        assert_eq!(provides.type_info_provides.get("keep").and_then(|v| v.as_str()), Some("z"));
        assert_eq!(provides.artifact_group.as_deref(), Some("g"));
    }

    #[test]
    fn a_stored_null_value_is_distinct_from_an_absent_key() {
        let provides = ArtifactProvides {
            artifact_name: "old".into(),
            artifact_group: None,
            type_info_provides: BTreeMap::from([("rootfs-image.version".to_string(), serde_json::Value::Null)]),
        };
        assert!(provides.type_info_provides.get("rootfs-image.version").is_some_and(|v| v.is_null()));
        assert!(provides.type_info_provides.get("absent-key").is_none());
    }

    #[test]
    fn artifact_group_pattern_clears_group_only() {
        let mut provides = ArtifactProvides {
            artifact_name: "old".into(),
            artifact_group: Some("group-a".into()),
            type_info_provides: BTreeMap::new(),
        };
        provides
            .apply_clears_and_provides(Some(&["artifact_group".to_string()]), "new", None, &BTreeMap::new())
            .expect("apply");
        assert!(provides.artifact_group.is_none());
    }

    #[test]
    fn unparseable_pattern_is_rejected() {
        let mut provides = ArtifactProvides::default();
        let result = provides.apply_clears_and_provides(
            Some(&["mid*dle".to_string()]),
            "new",
            None,
            &BTreeMap::new(),
        );
        assert!(result.is_err());
    }
}
