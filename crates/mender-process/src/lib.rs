//! Hook-script discovery and timed execution (§4.3, §9 "Hook execution").
//!
//! Grounded on the teacher's `shipper-process` (`run_command_with_timeout`),
//! rewritten against `tokio::process` because the daemon is a long-running,
//! multi-task process (§5) rather than a one-shot CLI invocation — a blocking
//! `std::process::Command` poll loop would stall the daemon's other task
//! (the authorization manager) for the duration of every hook.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Outcome of one hook script invocation.
#[derive(Debug, Clone)]
pub struct HookResult {
    pub script: PathBuf,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl HookResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// A hook failure, carrying the context a state's `HandleError` needs to
/// decide without re-parsing output (§9: "Hook errors carry `{state, phase,
/// exit_code, captured_stderr}`").
#[derive(Debug, Error)]
#[error("hook {state}_{phase}_* failed: script {script} exited {exit_code:?}: {stderr}")]
pub struct HookError {
    pub state: String,
    pub phase: String,
    pub script: PathBuf,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

/// List the scripts for `(state, phase)` in the configured scripts
/// directory, in `sort -n` order (§4.3, §6).
///
/// A script matches if its filename starts with `<state>_<phase>_`. Missing
/// directories produce an empty list rather than an error: a device with no
/// hooks configured for a given transition is a normal, supported
/// configuration.
pub fn list_hook_scripts(scripts_dir: &Path, state: &str, phase: &str) -> std::io::Result<Vec<PathBuf>> {
    let prefix = format!("{state}_{phase}_");
    let mut matches = Vec::new();

    let entries = match std::fs::read_dir(scripts_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str()
            && name.starts_with(&prefix)
        {
            matches.push(entry.path());
        }
    }

    matches.sort();
    Ok(matches)
}

/// Run a single script with a hard wall-clock timeout, capturing output.
///
/// A timed-out child is killed and waited on so it never becomes a zombie
/// (§9: "never leave orphaned processes").
pub async fn run_script(script: &Path, timeout: Duration) -> std::io::Result<HookResult> {
    let start = tokio::time::Instant::now();

    let mut child = Command::new(script)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let wait_fut = async {
        let status = child.wait().await?;
        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut p) = stdout_pipe.take() {
            let _ = p.read_to_string(&mut stdout).await;
        }
        if let Some(mut p) = stderr_pipe.take() {
            let _ = p.read_to_string(&mut stderr).await;
        }
        std::io::Result::Ok((status, stdout, stderr))
    };

    match tokio::time::timeout(timeout, wait_fut).await {
        Ok(Ok((status, stdout, stderr))) => Ok(HookResult {
            script: script.to_path_buf(),
            exit_code: status.code(),
            stdout,
            stderr,
            timed_out: false,
            duration: start.elapsed(),
        }),
        Ok(Err(e)) => Err(e),
        Err(_elapsed) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            Ok(HookResult {
                script: script.to_path_buf(),
                exit_code: None,
                stdout: String::new(),
                stderr: format!("{} timed out after {}", script.display(), humantime::format_duration(timeout)),
                timed_out: true,
                duration: start.elapsed(),
            })
        }
    }
}

/// Run every script for `(state, phase)` in order. Stops at the first
/// failure unless `ignore_errors` is set, in which case every script still
/// runs and only the last failure (if any) is reported.
pub async fn run_phase(
    scripts_dir: &Path,
    state: &str,
    phase: &str,
    timeout: Duration,
    ignore_errors: bool,
) -> Result<Vec<HookResult>, HookError> {
    let scripts = list_hook_scripts(scripts_dir, state, phase).unwrap_or_default();
    let mut results = Vec::with_capacity(scripts.len());
    let mut first_failure: Option<HookError> = None;

    for script in scripts {
        let result = run_script(&script, timeout).await;
        match result {
            Ok(outcome) => {
                let failed = !outcome.success();
                let exit_code = outcome.exit_code;
                let stderr = outcome.stderr.clone();
                results.push(outcome);
                if failed && first_failure.is_none() {
                    first_failure = Some(HookError {
                        state: state.to_string(),
                        phase: phase.to_string(),
                        script: results.last().unwrap().script.clone(),
                        exit_code,
                        stderr,
                    });
                    if !ignore_errors {
                        break;
                    }
                }
            }
            Err(e) => {
                return Err(HookError {
                    state: state.to_string(),
                    phase: phase.to_string(),
                    script: PathBuf::new(),
                    exit_code: None,
                    stderr: e.to_string(),
                });
            }
        }
    }

    if ignore_errors {
        Ok(results)
    } else if let Some(err) = first_failure {
        Err(err)
    } else {
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn list_hook_scripts_matches_prefix_and_sorts() {
        let td = tempdir().unwrap();
        write_script(td.path(), "ArtifactInstall_Enter_01", "true");
        write_script(td.path(), "ArtifactInstall_Enter_00", "true");
        write_script(td.path(), "ArtifactInstall_Leave_00", "true");

        let scripts = list_hook_scripts(td.path(), "ArtifactInstall", "Enter").unwrap();
        let names: Vec<_> = scripts.iter().map(|p| p.file_name().unwrap().to_str().unwrap()).collect();
        assert_eq!(names, vec!["ArtifactInstall_Enter_00", "ArtifactInstall_Enter_01"]);
    }

    #[test]
    fn missing_scripts_dir_is_empty() {
        let scripts = list_hook_scripts(Path::new("/nonexistent/path/xyz"), "Idle", "Enter").unwrap();
        assert!(scripts.is_empty());
    }

    #[tokio::test]
    async fn run_script_captures_success() {
        let td = tempdir().unwrap();
        let script = write_script(td.path(), "ok", "echo hello");
        let result = run_script(&script, Duration::from_secs(5)).await.unwrap();
        assert!(result.success());
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn run_script_captures_failure() {
        let td = tempdir().unwrap();
        let script = write_script(td.path(), "fail", "exit 7");
        let result = run_script(&script, Duration::from_secs(5)).await.unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, Some(7));
    }

    #[tokio::test]
    async fn run_script_times_out() {
        let td = tempdir().unwrap();
        let script = write_script(td.path(), "slow", "sleep 5");
        let result = run_script(&script, Duration::from_millis(100)).await.unwrap();
        assert!(result.timed_out);
    }

    #[tokio::test]
    async fn run_phase_stops_at_first_failure() {
        let td = tempdir().unwrap();
        write_script(td.path(), "X_Enter_00", "exit 1");
        write_script(td.path(), "X_Enter_01", "echo never");

        let err = run_phase(td.path(), "X", "Enter", Duration::from_secs(5), false).await.unwrap_err();
        assert_eq!(err.exit_code, Some(1));
    }

    #[tokio::test]
    async fn run_phase_ignore_errors_runs_all() {
        let td = tempdir().unwrap();
        write_script(td.path(), "X_Error_00", "exit 1");
        write_script(td.path(), "X_Error_01", "exit 0");

        let results = run_phase(td.path(), "X", "Error", Duration::from_secs(5), true).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn run_phase_with_no_scripts_is_empty_ok() {
        let td = tempdir().unwrap();
        let results = run_phase(td.path(), "Idle", "Enter", Duration::from_secs(5), false).await.unwrap();
        assert!(results.is_empty());
    }
}
