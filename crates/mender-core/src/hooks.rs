//! The transition executor (§4.3, C3): runs named hook scripts at every
//! state boundary and folds both hook invocations and installer operations
//! into one ordered trace, which is the literal external contract asserted
//! by §8's scenarios.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mender_process::{HookError, run_phase};

/// The ordered record of everything that happened during a deployment:
/// every hook script invoked (by its file stem, e.g. `Download_Enter_00`)
/// and every installer operation called (e.g. `Download`, `SupportsRollback`).
#[derive(Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Runs hook scripts for `(state, phase)` and appends each one's stem to the
/// shared [`Trace`] in invocation order (§4.3).
pub struct HookExecutor {
    pub scripts_dir: PathBuf,
    pub timeout: Duration,
    pub trace: Trace,
}

impl HookExecutor {
    pub fn new(scripts_dir: PathBuf, timeout: Duration, trace: Trace) -> Self {
        Self { scripts_dir, timeout, trace }
    }

    /// Run one phase. `ignore_errors` matches §4.3: the error phase and a
    /// handful of unconditional transitions (`ArtifactCommit_Leave`,
    /// `ArtifactReboot_Leave`, `Idle_Enter`) never propagate hook failure.
    pub async fn run(&self, state: &str, phase: &str, ignore_errors: bool) -> Result<(), HookError> {
        let result = run_phase(&self.scripts_dir, state, phase, self.timeout, ignore_errors).await;
        match &result {
            Ok(results) => {
                for hook in results {
                    if let Some(stem) = hook.script.file_stem().and_then(|s| s.to_str()) {
                        self.trace.record(stem);
                    }
                }
            }
            Err(e) => {
                if let Some(stem) = e.script.file_stem().and_then(|s| s.to_str()) {
                    self.trace.record(stem);
                }
            }
        }
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }

    #[tokio::test]
    async fn records_script_stems_in_sorted_order() {
        let dir = tempdir().unwrap();
        write_script(dir.path(), "Download_Enter_00", "#!/bin/sh\nexit 0\n");
        write_script(dir.path(), "Download_Enter_01", "#!/bin/sh\nexit 0\n");

        let executor = HookExecutor::new(dir.path().to_path_buf(), Duration::from_secs(5), Trace::new());
        executor.run("Download", "Enter", false).await.unwrap();

        assert_eq!(executor.trace.entries(), vec!["Download_Enter_00", "Download_Enter_01"]);
    }

    #[tokio::test]
    async fn missing_scripts_dir_is_a_silent_noop() {
        let executor = HookExecutor::new(PathBuf::from("/nonexistent"), Duration::from_secs(5), Trace::new());
        executor.run("Download", "Enter", false).await.unwrap();
        assert!(executor.trace.entries().is_empty());
    }
}
