//! End-to-end coverage of the standalone `install`/`commit`/`rollback`
//! subcommands against a real filesystem store, hook scripts, and a scripted
//! update module — no network involved (§8 S1/S2/S3 cover that ground
//! without needing an update server).
//!
//! Grounded on `shipper-cli/tests/cli_e2e.rs`'s shape: a temp directory
//! fixture, `assert_cmd::Command` driving the built binary, `predicates` for
//! output assertions.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

fn write_executable(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(path, body).expect("write script");
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

/// A module that answers `Yes` to `SupportsRollback` and succeeds on every
/// other verb, appending the verb it was called with to a shared log file
/// so the test can assert call order.
fn write_rollback_capable_module(modules_dir: &Path, log: &Path) {
    write_executable(
        &modules_dir.join("rootfs-image"),
        &format!(
            "#!/bin/sh\necho \"$1\" >> {}\ncase \"$1\" in\n  SupportsRollback) echo Yes ;;\n  NeedsArtifactReboot) echo No ;;\nesac\nexit 0\n",
            log.display()
        ),
    );
}

fn config_toml(data_dir: &Path, scripts_dir: &Path, modules_dir: &Path, db_dir: &Path, device_type_file: &Path) -> String {
    format!(
        r#"
servers = []
data_dir = "{data}"
scripts_dir = "{scripts}"
modules_dir = "{modules}"
db_dir = "{db}"
device_type_file = "{device_type}"
"#,
        data = data_dir.display(),
        scripts = scripts_dir.display(),
        modules = modules_dir.display(),
        db = db_dir.display(),
        device_type = device_type_file.display(),
    )
}

fn update_info_json(deployment_id: &str) -> String {
    format!(
        r#"{{
  "deployment_id": "{deployment_id}",
  "artifact": {{
    "name": "release-1.0",
    "group": null,
    "compatible_devices": ["qemux86-64"],
    "payload_types": ["rootfs-image"],
    "depends_artifact_name": [],
    "depends_artifact_group": [],
    "type_info_depends": {{}},
    "type_info_provides": {{"rootfs-image.version": "1.0"}},
    "clears_artifact_provides": null
  }},
  "source_uri": "https://example.invalid/release-1.0.mender",
  "supports_rollback": "unknown",
  "reboot_requested": {{}},
  "has_db_schema_update": false,
  "error_log": []
}}"#
    )
}

/// S1: a rollback-enabled module artifact installs and commits cleanly.
#[test]
fn install_then_commit_succeeds_and_updates_the_provides_snapshot() {
    let td = tempdir().unwrap();
    let log = td.path().join("calls.log");
    let modules_dir = td.path().join("modules");
    write_rollback_capable_module(&modules_dir, &log);
    fs::write(td.path().join("device_type"), "device_type=qemux86-64\n").unwrap();

    let config = config_toml(
        &td.path().join("data"),
        &td.path().join("scripts"),
        &modules_dir,
        &td.path().join("db"),
        &td.path().join("device_type"),
    );
    let config_path = td.path().join("mender.toml");
    fs::write(&config_path, config).unwrap();

    let update_info_path = td.path().join("update.json");
    fs::write(&update_info_path, update_info_json("dep-1")).unwrap();

    Command::cargo_bin("mender-core")
        .unwrap()
        .args(["--config", config_path.to_str().unwrap(), "install", update_info_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(contains("install phase complete"));

    Command::cargo_bin("mender-core")
        .unwrap()
        .args(["--config", config_path.to_str().unwrap(), "commit"])
        .assert()
        .success();

    let calls = fs::read_to_string(&log).unwrap();
    assert!(calls.contains("ArtifactInstall"));
    assert!(calls.contains("ArtifactCommit"));

    Command::cargo_bin("mender-core")
        .unwrap()
        .args(["--config", config_path.to_str().unwrap(), "show-artifact"])
        .assert()
        .success()
        .stdout(contains("release-1.0"));
}

/// S2-shaped: rollback after a successful install but before commit is
/// accepted (rollback is only rejected once the commit marker exists).
#[test]
fn install_then_rollback_before_commit_succeeds() {
    let td = tempdir().unwrap();
    let log = td.path().join("calls.log");
    let modules_dir = td.path().join("modules");
    write_rollback_capable_module(&modules_dir, &log);
    fs::write(td.path().join("device_type"), "device_type=qemux86-64\n").unwrap();

    let config = config_toml(
        &td.path().join("data"),
        &td.path().join("scripts"),
        &modules_dir,
        &td.path().join("db"),
        &td.path().join("device_type"),
    );
    let config_path = td.path().join("mender.toml");
    fs::write(&config_path, config).unwrap();

    let update_info_path = td.path().join("update.json");
    fs::write(&update_info_path, update_info_json("dep-2")).unwrap();

    Command::cargo_bin("mender-core")
        .unwrap()
        .args(["--config", config_path.to_str().unwrap(), "install", update_info_path.to_str().unwrap()])
        .assert()
        .success();

    Command::cargo_bin("mender-core")
        .unwrap()
        .args(["--config", config_path.to_str().unwrap(), "rollback"])
        .assert()
        .success();

    let calls = fs::read_to_string(&log).unwrap();
    assert!(calls.contains("ArtifactRollback"));
}

#[test]
fn show_artifact_on_an_empty_store_reports_an_empty_provides_map() {
    let td = tempdir().unwrap();
    fs::create_dir_all(td.path().join("modules")).unwrap();
    let config = config_toml(
        &td.path().join("data"),
        &td.path().join("scripts"),
        &td.path().join("modules"),
        &td.path().join("db"),
        &td.path().join("device_type"),
    );
    let config_path = td.path().join("mender.toml");
    fs::write(&config_path, config).unwrap();

    Command::cargo_bin("mender-core")
        .unwrap()
        .args(["--config", config_path.to_str().unwrap(), "show-artifact"])
        .assert()
        .success()
        .stdout(contains("\"artifact_provides\""))
        .stdout(contains("\"control_maps\": []"));
}
