//! The inventory gatherer (§6 "Filesystem", out-of-scope external
//! collaborator specified only by the interface the core consumes): runs
//! every executable under `<data_dir>/inventory/mender-inventory-*` and
//! collects the `key=value` attribute lines each prints to stdout.
//!
//! Grounded on `mender_process::run_script` for process execution with a
//! wall-clock timeout, the same primitive the hook executor uses (§4.3).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

/// Collects device inventory attributes. A real implementation globs and
/// runs `mender-inventory-*` scripts; tests substitute [`StaticInventory`].
#[async_trait::async_trait]
pub trait InventoryGatherer: Send + Sync {
    async fn gather(&self) -> Result<BTreeMap<String, String>>;
}

/// Runs every `mender-inventory-*` executable found directly under
/// `inventory_dir`, in sorted filename order, and merges their `key=value`
/// stdout lines. A later script overwrites an earlier script's value for
/// the same key. Script failures are logged and skipped, not fatal — a
/// single misbehaving inventory script must not block the whole submission
/// (mirrors the hook executor's `ignore_errors` treatment of non-gating
/// failures, §4.3).
pub struct ScriptInventoryGatherer {
    pub inventory_dir: PathBuf,
    pub timeout: Duration,
}

impl ScriptInventoryGatherer {
    pub fn new(inventory_dir: PathBuf, timeout: Duration) -> Self {
        Self { inventory_dir, timeout }
    }

    fn discover(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut scripts = Vec::new();
        let entries = match std::fs::read_dir(&self.inventory_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str()
                && name.starts_with("mender-inventory-")
            {
                scripts.push(entry.path());
            }
        }
        scripts.sort();
        Ok(scripts)
    }
}

fn parse_attribute_line(line: &str, attrs: &mut BTreeMap<String, String>) {
    if let Some((key, value)) = line.split_once('=') {
        let key = key.trim();
        let value = value.trim();
        if !key.is_empty() {
            attrs.insert(key.to_string(), value.to_string());
        }
    }
}

#[async_trait::async_trait]
impl InventoryGatherer for ScriptInventoryGatherer {
    async fn gather(&self) -> Result<BTreeMap<String, String>> {
        let mut attrs = BTreeMap::new();
        let scripts = self.discover()?;
        for script in scripts {
            match mender_process::run_script(&script, self.timeout).await {
                Ok(result) if result.success() => {
                    for line in result.stdout.lines() {
                        parse_attribute_line(line, &mut attrs);
                    }
                }
                Ok(result) => {
                    tracing::warn!(script = %script.display(), exit_code = ?result.exit_code, "inventory script failed, skipping");
                }
                Err(e) => {
                    tracing::warn!(script = %script.display(), error = %e, "inventory script could not be spawned, skipping");
                }
            }
        }
        Ok(attrs)
    }
}

/// A fixed attribute set for tests and the standalone driver's fixture
/// harness.
pub struct StaticInventory(pub BTreeMap<String, String>);

#[async_trait::async_trait]
impl InventoryGatherer for StaticInventory {
    async fn gather(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }

    #[tokio::test]
    async fn merges_key_value_lines_from_every_script() {
        let td = tempdir().unwrap();
        write_script(td.path(), "mender-inventory-network", "echo mac=aa:bb:cc");
        write_script(td.path(), "mender-inventory-os", "echo os=linux\necho kernel=6.1");

        let gatherer = ScriptInventoryGatherer::new(td.path().to_path_buf(), Duration::from_secs(5));
        let attrs = gatherer.gather().await.unwrap();

        assert_eq!(attrs.get("mac"), Some(&"aa:bb:cc".to_string()));
        assert_eq!(attrs.get("os"), Some(&"linux".to_string()));
        assert_eq!(attrs.get("kernel"), Some(&"6.1".to_string()));
    }

    #[tokio::test]
    async fn a_failing_script_does_not_block_the_others() {
        let td = tempdir().unwrap();
        write_script(td.path(), "mender-inventory-broken", "exit 1");
        write_script(td.path(), "mender-inventory-ok", "echo ok=yes");

        let gatherer = ScriptInventoryGatherer::new(td.path().to_path_buf(), Duration::from_secs(5));
        let attrs = gatherer.gather().await.unwrap();
        assert_eq!(attrs.get("ok"), Some(&"yes".to_string()));
    }

    #[tokio::test]
    async fn missing_inventory_dir_yields_empty_attributes() {
        let gatherer = ScriptInventoryGatherer::new(PathBuf::from("/nonexistent"), Duration::from_secs(5));
        assert!(gatherer.gather().await.unwrap().is_empty());
    }
}
