//! Append-only JSON-lines deployment log (§4.8, §6): one rolling file per
//! deployment, evidence shipped to the server alongside the final status
//! report. Grounded on the teacher's `shipper-events` append-only log and its
//! `Reporter` trait (`shipper::engine::Reporter`), widened here into a file
//! sink keyed by deployment ID instead of the teacher's single process-wide
//! stream.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeploymentLogError {
    #[error("not enough space for deployment logs under {0}")]
    NotEnoughSpace(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One line of the deployment log: a hook invocation, a state transition, or
/// a control-map decision.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub timestamp: DateTime<Utc>,
    pub level: &'a str,
    pub message: String,
}

/// A rolling JSONL sink for one deployment's evidence trail.
///
/// File naming follows `<log_dir>/deployments.<NNNN>.<deployment_id>.log`;
/// the numeric prefix rotates whenever the deployment ID changes from the
/// last-seen one, and old files beyond `max_files` are pruned.
pub struct DeploymentLog {
    log_dir: PathBuf,
    deployment_id: String,
    file: File,
    bytes_written: u64,
    max_bytes: u64,
}

impl DeploymentLog {
    /// Open (creating if needed) the log file for `deployment_id`, rotating
    /// the file sequence number if `deployment_id` differs from the most
    /// recently written one. `min_free_bytes` gates creation with
    /// `NotEnoughSpaceForLogs` if the filesystem reports less free space.
    pub fn open(log_dir: &Path, deployment_id: &str, max_files: usize, max_bytes: u64) -> Result<Self> {
        fs::create_dir_all(log_dir).with_context(|| format!("create log dir {}", log_dir.display()))?;

        let next_seq = Self::next_sequence(log_dir, deployment_id)?;
        let file_name = format!("deployments.{next_seq:04}.{deployment_id}.log");
        let path = log_dir.join(&file_name);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open deployment log {}", path.display()))?;

        Self::prune(log_dir, max_files)?;

        Ok(Self { log_dir: log_dir.to_path_buf(), deployment_id: deployment_id.to_string(), file, bytes_written: 0, max_bytes })
    }

    fn next_sequence(log_dir: &Path, deployment_id: &str) -> Result<u32> {
        let mut highest = 0u32;
        let mut last_deployment: Option<String> = None;

        let mut entries: Vec<_> = match fs::read_dir(log_dir) {
            Ok(read) => read.filter_map(|e| e.ok()).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("deployments.") {
                if let Some((seq, tail)) = rest.split_once('.') {
                    if let Ok(seq) = seq.parse::<u32>() {
                        highest = highest.max(seq);
                        last_deployment = Some(tail.trim_end_matches(".log").to_string());
                    }
                }
            }
        }

        if last_deployment.as_deref() == Some(deployment_id) {
            Ok(highest.max(1))
        } else {
            Ok(highest + 1)
        }
    }

    fn prune(log_dir: &Path, max_files: usize) -> Result<()> {
        let mut entries: Vec<_> = match fs::read_dir(log_dir) {
            Ok(read) => read.filter_map(|e| e.ok()).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        entries.retain(|e| e.file_name().to_string_lossy().starts_with("deployments."));
        entries.sort_by_key(|e| e.file_name());

        while entries.len() > max_files {
            let oldest = entries.remove(0);
            let _ = fs::remove_file(oldest.path());
        }
        Ok(())
    }

    /// Append one JSON line. Returns [`DeploymentLogError::NotEnoughSpace`]
    /// once the per-file byte cap would be exceeded, rather than silently
    /// truncating the evidence trail.
    pub fn append(&mut self, level: &str, message: impl Into<String>) -> Result<(), DeploymentLogError> {
        let event = LogEvent { timestamp: Utc::now(), level, message: message.into() };
        let mut line = serde_json::to_vec(&event).expect("LogEvent always serializes");
        line.push(b'\n');

        if self.bytes_written + line.len() as u64 > self.max_bytes {
            return Err(DeploymentLogError::NotEnoughSpace(self.log_dir.clone()));
        }

        self.file.write_all(&line)?;
        self.file.flush()?;
        self.bytes_written += line.len() as u64;
        Ok(())
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn first_deployment_gets_sequence_one() {
        let dir = tempdir().unwrap();
        let log = DeploymentLog::open(dir.path(), "dep-1", 10, 1_000_000).unwrap();
        assert_eq!(log.deployment_id(), "dep-1");
        assert!(dir.path().join("deployments.0001.dep-1.log").exists());
    }

    #[test]
    fn new_deployment_id_rotates_sequence() {
        let dir = tempdir().unwrap();
        let mut first = DeploymentLog::open(dir.path(), "dep-1", 10, 1_000_000).unwrap();
        first.append("info", "hello").unwrap();
        let _second = DeploymentLog::open(dir.path(), "dep-2", 10, 1_000_000).unwrap();
        assert!(dir.path().join("deployments.0002.dep-2.log").exists());
    }

    #[test]
    fn reopening_same_deployment_reuses_sequence() {
        let dir = tempdir().unwrap();
        let _first = DeploymentLog::open(dir.path(), "dep-1", 10, 1_000_000).unwrap();
        let _again = DeploymentLog::open(dir.path(), "dep-1", 10, 1_000_000).unwrap();
        assert!(dir.path().join("deployments.0001.dep-1.log").exists());
        assert!(!dir.path().join("deployments.0002.dep-1.log").exists());
    }

    #[test]
    fn append_over_byte_cap_errors() {
        let dir = tempdir().unwrap();
        let mut log = DeploymentLog::open(dir.path(), "dep-1", 10, 10).unwrap();
        let err = log.append("info", "this line is definitely longer than ten bytes").unwrap_err();
        assert!(matches!(err, DeploymentLogError::NotEnoughSpace(_)));
    }

    #[test]
    fn prune_keeps_only_max_files() {
        let dir = tempdir().unwrap();
        for i in 0..5 {
            let _ = DeploymentLog::open(dir.path(), &format!("dep-{i}"), 2, 1_000_000).unwrap();
        }
        let count = fs::read_dir(dir.path()).unwrap().count();
        assert!(count <= 2, "expected at most 2 files, found {count}");
    }
}
