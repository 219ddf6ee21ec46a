//! The artifact dependency check run on entry to `UpdateStore` (§4.5).

use mender_types::artifact::{ArtifactInfo, ArtifactProvides};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("artifact name {0:?} not in current device's accepted list")]
    ArtifactName(String),
    #[error("artifact group {0:?} not in current device's accepted list")]
    ArtifactGroup(String),
    #[error("device type {0:?} not declared compatible by artifact")]
    CompatibleDevice(String),
    #[error("dependency not satisfied: key {key:?} wants {wanted:?}, provides has {actual:?}")]
    TypeInfoDepends { key: String, wanted: String, actual: Option<String> },
}

/// Compare the artifact's declared `Depends` against the device's current
/// state (§4.5 "Artifact dependency check"). `device_type` is the contents of
/// the configured device-type file; `current_name`/`current_group` come from
/// the stored [`ArtifactProvides`] snapshot (empty string/`None` if no
/// artifact has ever been committed).
pub fn check_dependencies(
    artifact: &ArtifactInfo,
    device_type: &str,
    current_name: &str,
    current_group: Option<&str>,
    provides: &ArtifactProvides,
) -> Result<(), DependencyError> {
    if !artifact.depends_artifact_name.is_empty() && !artifact.depends_artifact_name.iter().any(|n| n == current_name)
    {
        return Err(DependencyError::ArtifactName(current_name.to_string()));
    }

    if !artifact.depends_artifact_group.is_empty() {
        let matches = current_group.is_some_and(|g| artifact.depends_artifact_group.iter().any(|x| x == g));
        if !matches {
            return Err(DependencyError::ArtifactGroup(current_group.unwrap_or_default().to_string()));
        }
    }

    if !artifact.compatible_devices.is_empty() && !artifact.compatible_devices.iter().any(|d| d == device_type) {
        return Err(DependencyError::CompatibleDevice(device_type.to_string()));
    }

    for (key, wanted) in &artifact.type_info_depends {
        let wanted_str = match wanted {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        // A stored `null` means "no provides available" for this key (§4.5)
        // and fails the check the same way an absent key does, without
        // affecting any other key in the map.
        let actual = provides.type_info_provides.get(key).filter(|v| !v.is_null());
        let actual_str = actual.map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        let satisfied = actual_str.as_deref() == Some(wanted_str.as_str());
        if !satisfied {
            return Err(DependencyError::TypeInfoDepends {
                key: key.clone(),
                wanted: wanted_str,
                actual: actual_str,
            });
        }
    }

    Ok(())
}
