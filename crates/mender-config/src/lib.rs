//! Layered configuration for the update orchestrator (§3 `Settings`, §4.9 / C9).
//!
//! Grounded on the teacher's `shipper::config` (TOML file, `serde` defaults
//! per field) and its `SHIPPER_*` environment overrides (`shipper/src/config.rs`),
//! widened here into a single `Settings` record covering every tunable the
//! orchestrator and daemon need: directories, poll intervals, retry bounds,
//! the server list, the hook timeout, and the broken-artifact suffix.
//! Loaded once at startup and immutable for the life of the process (§3).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default configuration file name, mirroring the teacher's `.shipper.toml`
/// convention (`shipper_config::CONFIG_FILE`).
pub const CONFIG_FILE: &str = "mender.toml";

/// Prefix for environment-variable overrides, e.g. `MENDER_UPDATE_POLL_INTERVAL`.
pub const ENV_PREFIX: &str = "MENDER_";

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/mender")
}
fn default_scripts_dir() -> PathBuf {
    PathBuf::from("/etc/mender/scripts")
}
fn default_modules_dir() -> PathBuf {
    PathBuf::from("/usr/share/mender/modules/v3")
}
fn default_inventory_dir() -> PathBuf {
    PathBuf::from("/usr/share/mender/inventory")
}
fn default_identity_script() -> PathBuf {
    PathBuf::from("/usr/share/mender/identity/mender-device-identity")
}
fn default_db_dir() -> PathBuf {
    PathBuf::from("/var/lib/mender/db")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/mender")
}
fn default_device_type_file() -> PathBuf {
    PathBuf::from("/var/lib/mender/device_type")
}
fn default_update_poll_interval() -> Duration {
    Duration::from_secs(1800)
}
fn default_inventory_poll_interval() -> Duration {
    Duration::from_secs(28800)
}
fn default_retry_poll_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_fetch_install_attempts() -> u32 {
    3
}
fn default_max_state_data_store_count() -> u64 {
    100
}
fn default_hook_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_broken_artifact_suffix() -> String {
    "_INCONSISTENT".to_string()
}
fn default_boot_control_map_timeout() -> Duration {
    Duration::from_secs(600)
}
fn default_max_deployment_log_files() -> u32 {
    10
}
fn default_max_deployment_log_bytes() -> u64 {
    10 * 1024 * 1024
}

/// The layered, immutable configuration record loaded once at daemon startup
/// (§3 `Settings`, §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Candidate server base URLs, tried in order (§4.4, §4.5, S6).
    pub servers: Vec<String>,
    pub tenant_token: Option<String>,

    pub data_dir: PathBuf,
    pub scripts_dir: PathBuf,
    pub modules_dir: PathBuf,
    pub inventory_dir: PathBuf,
    pub identity_script: PathBuf,
    pub db_dir: PathBuf,
    pub log_dir: PathBuf,
    pub device_type_file: PathBuf,

    #[serde(with = "humantime_serde")]
    pub update_poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub inventory_poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_poll_interval: Duration,

    pub fetch_install_attempts: u32,
    pub max_state_data_store_count: u64,

    #[serde(with = "humantime_serde")]
    pub hook_timeout: Duration,
    pub broken_artifact_suffix: String,

    #[serde(with = "humantime_serde")]
    pub boot_control_map_timeout: Duration,

    pub max_deployment_log_files: u32,
    pub max_deployment_log_bytes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            tenant_token: None,
            data_dir: default_data_dir(),
            scripts_dir: default_scripts_dir(),
            modules_dir: default_modules_dir(),
            inventory_dir: default_inventory_dir(),
            identity_script: default_identity_script(),
            db_dir: default_db_dir(),
            log_dir: default_log_dir(),
            device_type_file: default_device_type_file(),
            update_poll_interval: default_update_poll_interval(),
            inventory_poll_interval: default_inventory_poll_interval(),
            retry_poll_interval: default_retry_poll_interval(),
            fetch_install_attempts: default_fetch_install_attempts(),
            max_state_data_store_count: default_max_state_data_store_count(),
            hook_timeout: default_hook_timeout(),
            broken_artifact_suffix: default_broken_artifact_suffix(),
            boot_control_map_timeout: default_boot_control_map_timeout(),
            max_deployment_log_files: default_max_deployment_log_files(),
            max_deployment_log_bytes: default_max_deployment_log_bytes(),
        }
    }
}

impl Settings {
    /// Load from `path` if it exists (TOML), falling back to defaults, then
    /// overlay `MENDER_*` environment variables (§4.9).
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse config file as TOML: {}", path.display()))?
        } else {
            Settings::default()
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Load using the default config-file search path (`./mender.toml`,
    /// matching the standalone/test harness convention in §4.9).
    pub fn load_default() -> Result<Self> {
        Self::load(Path::new(CONFIG_FILE))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}SERVERS")) {
            self.servers = v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}TENANT_TOKEN")) {
            self.tenant_token = Some(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}DATA_DIR")) {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}SCRIPTS_DIR")) {
            self.scripts_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}MODULES_DIR")) {
            self.modules_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}INVENTORY_DIR")) {
            self.inventory_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}IDENTITY_SCRIPT")) {
            self.identity_script = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}DB_DIR")) {
            self.db_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}LOG_DIR")) {
            self.log_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}UPDATE_POLL_INTERVAL"))
            && let Ok(d) = humantime::parse_duration(&v)
        {
            self.update_poll_interval = d;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}INVENTORY_POLL_INTERVAL"))
            && let Ok(d) = humantime::parse_duration(&v)
        {
            self.inventory_poll_interval = d;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}FETCH_INSTALL_ATTEMPTS"))
            && let Ok(n) = v.parse()
        {
            self.fetch_install_attempts = n;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}MAX_STATE_DATA_STORE_COUNT"))
            && let Ok(n) = v.parse()
        {
            self.max_state_data_store_count = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert!(settings.servers.is_empty());
        assert_eq!(settings.fetch_install_attempts, 3);
        assert_eq!(settings.hook_timeout, Duration::from_secs(5));
    }

    #[test]
    fn loads_from_toml_file() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
servers = ["https://a.example.com", "https://b.example.com"]
fetch_install_attempts = 5
update_poll_interval = "5m"
"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.servers, vec!["https://a.example.com", "https://b.example.com"]);
        assert_eq!(settings.fetch_install_attempts, 5);
        assert_eq!(settings.update_poll_interval, Duration::from_secs(300));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = Settings::load(Path::new("/nonexistent/mender.toml")).unwrap();
        assert_eq!(settings.fetch_install_attempts, 3);
    }

    #[test]
    #[allow(unsafe_code)]
    fn env_override_wins_over_file() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join(CONFIG_FILE);
        std::fs::write(&path, "fetch_install_attempts = 5\n").unwrap();

        unsafe {
            std::env::set_var("MENDER_FETCH_INSTALL_ATTEMPTS", "9");
        }
        let settings = Settings::load(&path).unwrap();
        unsafe {
            std::env::remove_var("MENDER_FETCH_INSTALL_ATTEMPTS");
        }
        assert_eq!(settings.fetch_install_attempts, 9);
    }
}
