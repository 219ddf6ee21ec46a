//! The pluggable update-module interface (§GLOSSARY "Update module /
//! installer"). A real installer shells out to the artifact's payload-type
//! script; tests substitute [`FakeModule`].
//!
//! The module's own behavior is out of scope (§1 "installer backends for
//! rootfs and pluggable update modules" is an external collaborator) — what
//! this crate owns is discovering which executable answers for a payload
//! type and calling it with the right verb, the same division of labor
//! [`crate::hooks::HookExecutor`] has with hook scripts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mender_types::artifact::RebootType;

use crate::hooks::Trace;

/// One artifact payload's handler. The state machine calls these in the
/// fixed order the GLOSSARY names: store, install, query rollback support,
/// query reboot need, (reboot/verify), commit, and on any failure path
/// rollback/rollback-reboot/verify/failure/cleanup.
#[async_trait::async_trait]
pub trait UpdateModule: Send + Sync {
    fn payload_type(&self) -> &str;

    async fn store_payloads(&self) -> Result<()>;
    async fn install_update(&self) -> Result<()>;
    async fn supports_rollback(&self) -> Result<bool>;
    async fn needs_reboot(&self) -> Result<RebootType>;
    async fn reboot(&self) -> Result<()>;
    async fn verify_reboot(&self) -> Result<()>;
    async fn commit_update(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
    async fn rollback_reboot(&self) -> Result<()>;
    async fn verify_rollback_reboot(&self) -> Result<()>;
    async fn failure(&self) -> Result<()>;
    async fn cleanup(&self) -> Result<()>;
}

/// A scriptable in-memory module for tests and the standalone driver's
/// fixture harness: every call succeeds unless pre-configured to fail, and
/// every call is recorded in invocation order.
pub struct FakeModule {
    pub payload_type: String,
    pub supports_rollback: bool,
    pub reboot_type: RebootType,
    pub fail_on: Option<String>,
    pub calls: std::sync::Mutex<Vec<String>>,
    pub trace: Option<Trace>,
}

impl FakeModule {
    pub fn new(payload_type: &str) -> Self {
        Self {
            payload_type: payload_type.to_string(),
            supports_rollback: true,
            reboot_type: RebootType::None,
            fail_on: None,
            calls: std::sync::Mutex::new(Vec::new()),
            trace: None,
        }
    }

    pub fn fail_on(mut self, op: &str) -> Self {
        self.fail_on = Some(op.to_string());
        self
    }

    pub fn without_rollback(mut self) -> Self {
        self.supports_rollback = false;
        self
    }

    pub fn with_reboot(mut self, reboot: RebootType) -> Self {
        self.reboot_type = reboot;
        self
    }

    /// Fold operation calls into a shared [`Trace`] alongside hook
    /// invocations, producing the combined ordering §8's scenarios assert.
    pub fn with_trace(mut self, trace: Trace) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: &str) -> Result<()> {
        self.calls.lock().unwrap().push(op.to_string());
        if let Some(trace) = &self.trace {
            trace.record(op);
        }
        if self.fail_on.as_deref() == Some(op) {
            anyhow::bail!("fake module configured to fail on {op}");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl UpdateModule for FakeModule {
    fn payload_type(&self) -> &str {
        &self.payload_type
    }
    async fn store_payloads(&self) -> Result<()> {
        self.record("Download")
    }
    async fn install_update(&self) -> Result<()> {
        self.record("ArtifactInstall")
    }
    async fn supports_rollback(&self) -> Result<bool> {
        self.record("SupportsRollback")?;
        Ok(self.supports_rollback)
    }
    async fn needs_reboot(&self) -> Result<RebootType> {
        self.record("NeedsArtifactReboot")?;
        Ok(self.reboot_type.clone())
    }
    async fn reboot(&self) -> Result<()> {
        self.record("Reboot")
    }
    async fn verify_reboot(&self) -> Result<()> {
        self.record("VerifyReboot")
    }
    async fn commit_update(&self) -> Result<()> {
        self.record("ArtifactCommit")
    }
    async fn rollback(&self) -> Result<()> {
        self.record("ArtifactRollback")
    }
    async fn rollback_reboot(&self) -> Result<()> {
        self.record("ArtifactRollbackReboot")
    }
    async fn verify_rollback_reboot(&self) -> Result<()> {
        self.record("VerifyRollbackReboot")
    }
    async fn failure(&self) -> Result<()> {
        self.record("ArtifactFailure")
    }
    async fn cleanup(&self) -> Result<()> {
        self.record("Cleanup")
    }
}

/// A real update module: one executable per payload type, invoked with the
/// verb (`StorePayloads`, `ArtifactInstall`, ...) as its sole argument, the
/// way `/usr/share/mender/modules/v3/<payload-type>` scripts are called in
/// the real agent. Output parsing is deliberately minimal — only
/// `SupportsRollback` and `NeedsArtifactReboot` read stdout at all.
pub struct ScriptUpdateModule {
    pub payload_type: String,
    pub path: PathBuf,
    pub timeout: Duration,
}

impl ScriptUpdateModule {
    pub fn new(payload_type: impl Into<String>, path: PathBuf, timeout: Duration) -> Self {
        Self { payload_type: payload_type.into(), path, timeout }
    }

    async fn call(&self, verb: &str) -> Result<String> {
        let run = tokio::process::Command::new(&self.path).arg(verb).output();
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| anyhow::anyhow!("update module {} timed out on {verb}", self.path.display()))??;

        if !output.status.success() {
            anyhow::bail!("update module {} failed on {verb}: {}", self.path.display(), String::from_utf8_lossy(&output.stderr).trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait::async_trait]
impl UpdateModule for ScriptUpdateModule {
    fn payload_type(&self) -> &str {
        &self.payload_type
    }
    async fn store_payloads(&self) -> Result<()> {
        self.call("StorePayloads").await.map(|_| ())
    }
    async fn install_update(&self) -> Result<()> {
        self.call("ArtifactInstall").await.map(|_| ())
    }
    async fn supports_rollback(&self) -> Result<bool> {
        Ok(self.call("SupportsRollback").await?.eq_ignore_ascii_case("yes"))
    }
    async fn needs_reboot(&self) -> Result<RebootType> {
        Ok(match self.call("NeedsArtifactReboot").await?.as_str() {
            "Yes" | "Automatic" => RebootType::Automatic,
            "No" | "" => RebootType::None,
            _ => RebootType::Custom,
        })
    }
    async fn reboot(&self) -> Result<()> {
        self.call("Reboot").await.map(|_| ())
    }
    async fn verify_reboot(&self) -> Result<()> {
        self.call("VerifyReboot").await.map(|_| ())
    }
    async fn commit_update(&self) -> Result<()> {
        self.call("ArtifactCommit").await.map(|_| ())
    }
    async fn rollback(&self) -> Result<()> {
        self.call("ArtifactRollback").await.map(|_| ())
    }
    async fn rollback_reboot(&self) -> Result<()> {
        self.call("ArtifactRollbackReboot").await.map(|_| ())
    }
    async fn verify_rollback_reboot(&self) -> Result<()> {
        self.call("VerifyRollbackReboot").await.map(|_| ())
    }
    async fn failure(&self) -> Result<()> {
        self.call("ArtifactFailure").await.map(|_| ())
    }
    async fn cleanup(&self) -> Result<()> {
        self.call("Cleanup").await.map(|_| ())
    }
}

/// List every executable directly under `modules_dir`, one [`ScriptUpdateModule`]
/// per file, named after the file (§6: `<modules_dir>/<payload-type>`).
/// An absent directory yields no modules rather than an error — a daemon
/// with no pluggable modules configured still has the built-in rootfs
/// payload type to fall back on.
pub fn discover_modules(modules_dir: &Path, timeout: Duration) -> std::io::Result<Vec<Arc<dyn UpdateModule>>> {
    let entries = match std::fs::read_dir(modules_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut modules: Vec<Arc<dyn UpdateModule>> = Vec::new();
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push((entry.file_name().to_string_lossy().to_string(), entry.path()));
        }
    }
    names.sort();
    for (name, path) in names {
        modules.push(Arc::new(ScriptUpdateModule::new(name, path, timeout)));
    }
    Ok(modules)
}

#[cfg(test)]
mod script_module_tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn write_module(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn supports_rollback_parses_yes_no_from_stdout() {
        let dir = tempdir().unwrap();
        let path = write_module(dir.path(), "rootfs-image", "#!/bin/sh\necho Yes\n");
        let module = ScriptUpdateModule::new("rootfs-image", path, Duration::from_secs(5));
        assert!(module.supports_rollback().await.unwrap());
    }

    #[tokio::test]
    async fn a_non_zero_exit_is_reported_with_stderr() {
        let dir = tempdir().unwrap();
        let path = write_module(dir.path(), "rootfs-image", "#!/bin/sh\necho boom >&2\nexit 1\n");
        let module = ScriptUpdateModule::new("rootfs-image", path, Duration::from_secs(5));
        let err = module.install_update().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn a_hanging_module_times_out() {
        let dir = tempdir().unwrap();
        let path = write_module(dir.path(), "rootfs-image", "#!/bin/sh\nsleep 5\n");
        let module = ScriptUpdateModule::new("rootfs-image", path, Duration::from_millis(50));
        assert!(module.install_update().await.unwrap_err().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn discover_modules_names_each_one_after_its_file() {
        let dir = tempdir().unwrap();
        write_module(dir.path(), "rootfs-image", "#!/bin/sh\nexit 0\n");
        write_module(dir.path(), "docker", "#!/bin/sh\nexit 0\n");

        let modules = discover_modules(dir.path(), Duration::from_secs(5)).unwrap();
        let mut names: Vec<&str> = modules.iter().map(|m| m.payload_type()).collect();
        names.sort();
        assert_eq!(names, vec!["docker", "rootfs-image"]);
    }

    #[tokio::test]
    async fn missing_modules_dir_yields_an_empty_list() {
        let modules = discover_modules(Path::new("/nonexistent/modules"), Duration::from_secs(5)).unwrap();
        assert!(modules.is_empty());
    }
}
