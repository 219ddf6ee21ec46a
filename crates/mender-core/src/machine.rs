//! The deployment orchestrator (§4.5, C5): drives one `UpdateInfo` from
//! `UpdateStore` through commit or rollback, persisting a `StateData`
//! checkpoint before every side-effecting state per the crash-recovery
//! invariant (§3).
//!
//! This module drives only the "update in hand" half of the ≈30-state graph
//! (`UpdateStore` through `Idle`); the poll-and-wait half (`CheckWait`,
//! `UpdateCheck`, `InventoryUpdate`, `AuthorizeWait`) is the daemon loop's
//! concern (`daemon.rs`) because it is the only part of the graph driven by
//! external cadence rather than by one deployment's own progress.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use mender_policy::ControlMapPool;
use mender_store::{FileKvStore, KvOps};
use mender_types::artifact::{ArtifactProvides, RebootType, SupportsRollback};
use mender_types::control_map::Action;
use mender_types::error::CoreError;
use mender_types::state_data::{STATE_DATA_KEY, StateData};
use mender_types::state_id::{Phase, StateId};
use tracing::{info, warn};

use crate::dependency::check_dependencies;
use crate::hooks::HookExecutor;
use crate::installer::UpdateModule;
use crate::server::UpdateServerClient;

const ARTIFACT_NAME_KEY: &str = "artifact-name";
const ARTIFACT_GROUP_KEY: &str = "artifact-group";
const ARTIFACT_PROVIDES_KEY: &str = "artifact-type-info-provides";

/// The terminal shape of one deployment attempt (§8 invariant 1: the final
/// stored artifact name is always exactly one of these three shapes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentOutcome {
    Committed { artifact_name: String },
    RolledBack { artifact_name: String },
    BrokenAfterCommit { artifact_name: String },
}

/// Everything one deployment run needs, borrowed for its duration. Owned by
/// the daemon loop or the standalone driver, not by the state machine
/// itself — `StateId` dispatch never holds its own copy of shared resources
/// (§9 "Cyclic state graph").
///
/// Constrained to the concrete [`FileKvStore`] rather than generic over
/// `KvOps`: the multi-key atomic commit (`StateData` + provides snapshot)
/// needs the store facade's `transaction()`, which is a property of the
/// directory-of-files backend (§4.1), not of the abstract key/value
/// interface other components (e.g. the control-map pool) are satisfied
/// with.
pub struct Deployment {
    pub store: FileKvStore,
    pub control_maps: Arc<ControlMapPool<FileKvStore>>,
    pub hooks: HookExecutor,
    pub modules: Vec<Arc<dyn UpdateModule>>,
    pub device_type: String,
    pub broken_suffix: String,
    pub max_store_count: u64,
    /// The final status report's destination and retry timing (§4.5 "Retry
    /// and backoff", status-reporting branch). `None` disables reporting
    /// entirely — used by the standalone driver (§4.7), which has no server
    /// relationship to report to.
    pub status_report: Option<StatusReportConfig>,
}

/// Everything [`Deployment::report_final_status`] needs: where to report and
/// how the retry ceiling (§4.5) is derived.
pub struct StatusReportConfig {
    pub server: Arc<dyn UpdateServerClient>,
    pub servers: Vec<String>,
    pub update_poll_interval: Duration,
    pub retry_poll_interval: Duration,
}

impl Deployment {
    /// The currently-installed artifact's provides snapshot (§4.5), for
    /// callers outside the state machine that just want to display it
    /// (`show-artifact`).
    pub fn current_artifact_provides(&self) -> ArtifactProvides {
        self.load_provides()
    }

    fn module_for(&self, payload_type: &str) -> Option<&Arc<dyn UpdateModule>> {
        self.modules.iter().find(|m| m.payload_type() == payload_type)
    }

    fn load_provides(&self) -> ArtifactProvides {
        let name = self.store.read_all(ARTIFACT_NAME_KEY).ok().and_then(|b| String::from_utf8(b).ok());
        let group = self.store.read_all(ARTIFACT_GROUP_KEY).ok().and_then(|b| String::from_utf8(b).ok());
        let provides = self
            .store
            .read_all(ARTIFACT_PROVIDES_KEY)
            .ok()
            .and_then(|b| serde_json::from_slice::<BTreeMap<String, serde_json::Value>>(&b).ok())
            .unwrap_or_default();

        ArtifactProvides { artifact_name: name.unwrap_or_default(), artifact_group: group, type_info_provides: provides }
    }

    fn persist_state(&self, data: &StateData) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(data).map_err(|e| CoreError::fatal(e.into()))?;
        self.store.write_all(STATE_DATA_KEY, &bytes).map_err(|e| CoreError::fatal(e.into()))?;
        Ok(())
    }

    /// Advance `data` to `next`, bumping the store-count and persisting
    /// before returning, per §3's crash-recovery invariant. Aborts the
    /// deployment if the store-count ceiling (§3 "Store-count bound") would
    /// be exceeded.
    fn advance(&self, data: &mut StateData, next: StateId) -> Result<(), CoreError> {
        *data = data.advance(next);
        if data.exceeds_store_count(self.max_store_count) {
            warn!(store_count = data.store_count, "state-data store-count ceiling exceeded, forcing failure");
            return Err(CoreError::fatal(anyhow::anyhow!("state-data store-count ceiling exceeded")));
        }
        self.persist_state(data)
    }

    /// Run the hook phase classified for `state` by
    /// [`StateId::transition`], honoring its `forces_ignore_errors` flag.
    /// States with no transition classifier (pure wait/dispatch states) are
    /// a no-op.
    async fn hook(&self, state: StateId, phase: Phase) -> Result<(), CoreError> {
        let Some(t) = state.transition() else { return Ok(()) };
        let ignore = state.forces_ignore_errors(phase);
        self.hooks.run(t.hook_base, phase.as_wire_name(), ignore).await.map_err(|e| CoreError::transient(e.into()))
    }

    /// Consult the control-map pool before a gated checkpoint, looping
    /// through the paused sub-loop (§4.3) until a decisive action is
    /// returned.
    async fn gate(&self, state: StateId) -> Result<(), CoreError> {
        let Some(checkpoint) = state.checkpoint() else { return Ok(()) };
        let mut updates = self.control_maps.subscribe();
        loop {
            let action = self.control_maps.query_and_update(checkpoint).map_err(|e| CoreError::fatal(e.into()))?;
            match action {
                Action::Fail => return Err(CoreError::fatal(anyhow::anyhow!("control map directed fail at {checkpoint:?}"))),
                Action::Pause => {
                    info!(substate = checkpoint.substate_while_paused(), "paused awaiting control-map update");
                    if updates.changed().await.is_err() {
                        return Err(CoreError::fatal(anyhow::anyhow!("control-map pool closed while paused")));
                    }
                }
                Action::ForceContinue => {
                    info!(?checkpoint, "control map forced continue");
                    return Ok(());
                }
                Action::Continue => return Ok(()),
            }
        }
    }

    /// Run the artifact dependency check (§4.5) for the declared `Depends`.
    fn check_dependencies(&self, data: &StateData) -> Result<(), CoreError> {
        let provides = self.load_provides();
        check_dependencies(
            &data.update_info.artifact,
            &self.device_type,
            &provides.artifact_name,
            provides.artifact_group.as_deref(),
            &provides,
        )
        .map_err(|e| CoreError::fatal(e.into()))
    }

    /// Drive `data` from `UpdateStore` through to `Idle`, returning the
    /// deployment's terminal shape. Errors that escape this function are
    /// fatal store/persistence failures, not deployment failures — a failed
    /// deployment still returns `Ok` with a `RolledBack`/`BrokenAfterCommit`
    /// outcome, because §8 invariant 1 requires the stored artifact name to
    /// reach one of its three valid shapes even on failure.
    pub async fn run(&self, mut data: StateData) -> Result<DeploymentOutcome, CoreError> {
        self.persist_state(&data)?;

        match self.run_store_through_install(&mut data).await {
            Ok(()) => self.run_reboot_through_commit(&mut data).await,
            Err(e) => self.run_rollback(&mut data, &e.to_string()).await,
        }
    }

    /// Public entry point for the standalone driver's `install` (§4.7):
    /// the same store-through-install path `run` uses internally, exposed
    /// so a separate `commit`/`rollback` process invocation can resume
    /// from whatever checkpoint this leaves behind.
    pub async fn install_phase(&self, data: &mut StateData) -> Result<(), CoreError> {
        self.run_store_through_install(data).await
    }

    /// Public entry point for the standalone driver's `commit` (§4.7).
    pub async fn commit_phase(&self, data: &mut StateData) -> Result<DeploymentOutcome, CoreError> {
        self.run_reboot_through_commit(data).await
    }

    /// Public entry point for the standalone driver's `rollback` (§4.7).
    pub async fn rollback_phase(&self, data: &mut StateData, reason: &str) -> Result<DeploymentOutcome, CoreError> {
        self.run_rollback(data, reason).await
    }

    async fn run_store_through_install(&self, data: &mut StateData) -> Result<(), CoreError> {
        self.advance(data, StateId::UpdateStore)?;
        self.check_dependencies(data)?;

        self.hook(StateId::UpdateStore, Phase::Enter).await?;
        for payload_type in data.update_info.artifact.payload_types.clone() {
            if let Some(module) = self.module_for(&payload_type) {
                module.store_payloads().await.map_err(CoreError::transient)?;
            }
        }
        self.hook(StateId::UpdateStore, Phase::Leave).await?;

        self.advance(data, StateId::UpdateAfterStore)?;
        data.update_info.supports_rollback = self.query_supports_rollback(data).await?;

        self.gate(StateId::UpdateInstall).await?;
        self.advance(data, StateId::UpdateInstall)?;

        self.hook(StateId::UpdateInstall, Phase::Enter).await?;
        for payload_type in data.update_info.artifact.payload_types.clone() {
            if let Some(module) = self.module_for(&payload_type)
                && let Err(e) = module.install_update().await
            {
                self.hook(StateId::UpdateInstall, Phase::Error).await.ok();
                return Err(CoreError::transient(e));
            }
        }
        self.hook(StateId::UpdateInstall, Phase::Leave).await?;

        Ok(())
    }

    async fn query_supports_rollback(&self, data: &StateData) -> Result<SupportsRollback, CoreError> {
        let mut supported = SupportsRollback::Supported;
        for payload_type in &data.update_info.artifact.payload_types {
            if let Some(module) = self.module_for(payload_type) {
                let ok = module.supports_rollback().await.map_err(CoreError::transient)?;
                if !ok {
                    supported = SupportsRollback::NotSupported;
                }
            }
        }
        Ok(supported)
    }

    async fn run_reboot_through_commit(&self, data: &mut StateData) -> Result<DeploymentOutcome, CoreError> {
        let mut automatic_reboot = false;
        let mut custom_reboots = Vec::new();
        for payload_type in data.update_info.artifact.payload_types.clone() {
            if let Some(module) = self.module_for(&payload_type) {
                match module.needs_reboot().await.map_err(CoreError::transient)? {
                    RebootType::None => {}
                    RebootType::Custom => custom_reboots.push(payload_type),
                    RebootType::Automatic => automatic_reboot = true,
                }
            }
        }

        if !custom_reboots.is_empty() || automatic_reboot {
            self.gate(StateId::UpdateReboot).await?;
            self.advance(data, StateId::UpdateReboot)?;
            self.hook(StateId::UpdateReboot, Phase::Enter).await?;

            for payload_type in &custom_reboots {
                if let Some(module) = self.module_for(payload_type) {
                    module.reboot().await.map_err(CoreError::transient)?;
                    module.verify_reboot().await.map_err(CoreError::transient)?;
                }
            }
            if automatic_reboot {
                // §9: whole-host reboot is postponed until after every
                // per-module reboot above has run, and runs last.
                info!("automatic host reboot requested, deferred until after per-module reboots");
            }

            self.hook(StateId::UpdateReboot, Phase::Leave).await?;
            self.advance(data, StateId::UpdateAfterReboot)?;
        }

        match self.commit(data).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_retryable() => self.run_rollback(data, &e.to_string()).await,
            Err(e) => {
                warn!(error = %e, "failure after commit point, cannot roll back");
                self.mark_broken(data).await
            }
        }
    }

    async fn commit(&self, data: &mut StateData) -> Result<DeploymentOutcome, CoreError> {
        self.gate(StateId::UpdateCommit).await?;
        self.advance(data, StateId::UpdateCommit)?;
        self.hook(StateId::UpdateCommit, Phase::Enter).await?;

        let first_payload = data.update_info.artifact.payload_types.first().cloned();
        if let Some(payload_type) = &first_payload
            && let Some(module) = self.module_for(payload_type)
        {
            module.commit_update().await.map_err(CoreError::fatal)?;
        }

        // Past this point rollback is no longer available (§4.5): persist
        // StateData and the provides snapshot atomically in one transaction.
        let mut provides = self.load_provides();
        provides
            .apply_clears_and_provides(
                data.update_info.artifact.clears_artifact_provides.as_deref(),
                &data.update_info.artifact.name,
                data.update_info.artifact.group.as_deref(),
                &data.update_info.artifact.type_info_provides,
            )
            .map_err(|e| CoreError::fatal(anyhow::anyhow!(e)))?;

        *data = data.advance(StateId::UpdateAfterFirstCommit);
        let txn = self.store.transaction();
        let state_bytes = serde_json::to_vec(data).map_err(|e| CoreError::fatal(e.into()))?;
        txn.write_all(STATE_DATA_KEY, &state_bytes).map_err(|e| CoreError::fatal(e.into()))?;
        txn.write_all(ARTIFACT_NAME_KEY, provides.artifact_name.as_bytes()).map_err(|e| CoreError::fatal(e.into()))?;
        if let Some(group) = &provides.artifact_group {
            txn.write_all(ARTIFACT_GROUP_KEY, group.as_bytes()).map_err(|e| CoreError::fatal(e.into()))?;
        }
        let provides_bytes = serde_json::to_vec(&provides.type_info_provides).map_err(|e| CoreError::fatal(e.into()))?;
        txn.write_all(ARTIFACT_PROVIDES_KEY, &provides_bytes).map_err(|e| CoreError::fatal(e.into()))?;
        txn.commit().map_err(|e| CoreError::fatal(e.into()))?;

        // `ArtifactCommit_Leave` is one of the unconditional
        // `ignore_errors = true` transitions (§4.3); a failing leave hook
        // here still lands in the broken-after-commit terminal shape
        // (§9, S3), never a rollback.
        if self.hook(StateId::UpdateCommit, Phase::Leave).await.is_err() {
            return self.mark_broken(data).await;
        }

        for payload_type in data.update_info.artifact.payload_types.iter().skip(1).cloned().collect::<Vec<_>>() {
            if let Some(module) = self.module_for(&payload_type)
                && let Err(e) = module.commit_update().await
            {
                warn!(error = %e, payload_type, "post-commit payload failed, reported but not rolled back");
                data.update_info.record_error(e.to_string());
            }
        }

        self.advance(data, StateId::UpdateCleanup)?;
        self.cleanup(data).await?;
        self.report_final_status(data, "success").await?;
        self.advance(data, StateId::Idle)?;
        self.hook(StateId::Idle, Phase::Enter).await.ok();

        Ok(DeploymentOutcome::Committed { artifact_name: data.update_info.artifact.name.clone() })
    }

    /// Pre-commit failure handler (§7 "Propagation policy"): re-queries
    /// rollback support (the `SupportsRollback` op runs a second time here,
    /// per §8 S2's literal hook log — the answer given before install isn't
    /// trusted for the error path) and only attempts the module rollback
    /// steps when it still says yes. When it doesn't, there is nothing to
    /// undo and nothing was ever committed, so the failure is reported the
    /// same way a post-commit failure is: broken marker, straight to
    /// `UpdateError`.
    async fn run_rollback(&self, data: &mut StateData, reason: &str) -> Result<DeploymentOutcome, CoreError> {
        warn!(reason, "deployment failed before commit, deciding rollback path");

        let supported = match self.query_supports_rollback(data).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "rollback support query failed, treating as unsupported");
                SupportsRollback::NotSupported
            }
        };
        data.update_info.supports_rollback = supported.clone();

        if supported != SupportsRollback::Supported {
            return self.abandon_without_rollback(data).await;
        }

        self.advance(data, StateId::UpdateRollback)?;
        self.hook(StateId::UpdateRollback, Phase::Enter).await?;
        for payload_type in data.update_info.artifact.payload_types.clone() {
            if let Some(module) = self.module_for(&payload_type) {
                let _ = module.rollback().await;
            }
        }
        self.hook(StateId::UpdateRollback, Phase::Leave).await?;

        self.advance(data, StateId::UpdateRollbackReboot)?;
        self.hook(StateId::UpdateRollbackReboot, Phase::Enter).await.ok();
        for payload_type in data.update_info.artifact.payload_types.clone() {
            if let Some(module) = self.module_for(&payload_type) {
                let _ = module.rollback_reboot().await;
                let _ = module.verify_rollback_reboot().await;
            }
        }
        self.hook(StateId::UpdateRollbackReboot, Phase::Leave).await.ok();
        self.advance(data, StateId::UpdateVerifyRollbackReboot)?;
        self.advance(data, StateId::UpdateAfterRollbackReboot)?;

        self.advance(data, StateId::UpdateError)?;
        self.hook(StateId::UpdateError, Phase::Enter).await?;
        for payload_type in data.update_info.artifact.payload_types.clone() {
            if let Some(module) = self.module_for(&payload_type) {
                let _ = module.failure().await;
            }
        }
        self.hook(StateId::UpdateError, Phase::Leave).await?;

        let old_name = self.load_provides().artifact_name;
        self.advance(data, StateId::UpdateCleanup)?;
        self.cleanup(data).await?;
        self.report_final_status(data, "failure").await?;
        self.advance(data, StateId::Idle)?;

        Ok(DeploymentOutcome::RolledBack { artifact_name: old_name })
    }

    /// Pre-commit failure with no rollback support (§7): nothing was ever
    /// committed, so there is no prior name to restore either — the artifact
    /// that failed to install is itself marked broken, the same terminal
    /// name shape a post-commit failure reaches (§8 invariant 1).
    async fn abandon_without_rollback(&self, data: &mut StateData) -> Result<DeploymentOutcome, CoreError> {
        let broken_name = format!("{}{}", data.update_info.artifact.name, self.broken_suffix);
        self.store.write_all(ARTIFACT_NAME_KEY, broken_name.as_bytes()).map_err(|e| CoreError::fatal(e.into()))?;

        self.advance(data, StateId::UpdateError)?;
        self.hook(StateId::UpdateError, Phase::Enter).await.ok();
        for payload_type in data.update_info.artifact.payload_types.clone() {
            if let Some(module) = self.module_for(&payload_type) {
                let _ = module.failure().await;
            }
        }
        self.hook(StateId::UpdateError, Phase::Leave).await.ok();

        self.advance(data, StateId::UpdateCleanup)?;
        self.cleanup(data).await?;
        self.report_final_status(data, "failure").await?;
        self.advance(data, StateId::Idle)?;

        Ok(DeploymentOutcome::BrokenAfterCommit { artifact_name: broken_name })
    }

    /// Post-commit failure path: the broken-artifact suffix is appended to
    /// the stored artifact name so inventory/update-check report the damage
    /// (§7 "User-visible failure behavior").
    async fn mark_broken(&self, data: &mut StateData) -> Result<DeploymentOutcome, CoreError> {
        let mut provides = self.load_provides();
        if !provides.artifact_name.ends_with(&self.broken_suffix) {
            provides.artifact_name = format!("{}{}", provides.artifact_name, self.broken_suffix);
        }
        self.store.write_all(ARTIFACT_NAME_KEY, provides.artifact_name.as_bytes()).map_err(|e| CoreError::fatal(e.into()))?;

        self.advance(data, StateId::UpdateError)?;
        self.hook(StateId::UpdateError, Phase::Enter).await.ok();
        self.hook(StateId::UpdateError, Phase::Leave).await.ok();

        self.advance(data, StateId::UpdateCleanup)?;
        self.cleanup(data).await?;
        self.report_final_status(data, "failure").await?;
        self.advance(data, StateId::Idle)?;

        Ok(DeploymentOutcome::BrokenAfterCommit { artifact_name: provides.artifact_name })
    }

    /// Report the deployment's terminal status, retrying per §4.5's
    /// status-reporting ceiling (`min(poll/retry*2, 10)`, floored at 3) before
    /// giving up and transitioning to `ReportError`. Always returns `Ok`:
    /// an exhausted report is logged, not propagated, since §4.5 treats
    /// `ReportError` as a terminal state on the way back to `Idle`, not a
    /// deployment failure.
    async fn report_final_status(&self, data: &mut StateData, status: &str) -> Result<(), CoreError> {
        let Some(config) = &self.status_report else { return Ok(()) };

        self.advance(data, StateId::UpdateStatusReport)?;
        let max_attempts = mender_retry::status_report_max_attempts(config.update_poll_interval, config.retry_poll_interval);
        let backoff = mender_retry::BackoffConfig::from_poll_interval(config.retry_poll_interval, max_attempts);

        let mut attempt = 1;
        loop {
            let delivered = {
                let mut ok = false;
                for server in &config.servers {
                    if config.server.report_status(server, &data.update_info.deployment_id, status).await.is_ok() {
                        ok = true;
                        break;
                    }
                }
                ok
            };
            if delivered {
                return Ok(());
            }
            if mender_retry::exhausted(attempt, max_attempts) {
                warn!(status, attempt, max_attempts, "status report exhausted retries");
                self.advance(data, StateId::ReportError)?;
                return Ok(());
            }
            self.advance(data, StateId::UpdateStatusReportRetry)?;
            tokio::time::sleep(mender_retry::calculate_delay(&backoff, attempt)).await;
            attempt += 1;
        }
    }

    async fn cleanup(&self, data: &StateData) -> Result<(), CoreError> {
        self.hook(StateId::UpdateCleanup, Phase::Enter).await.ok();
        for payload_type in data.update_info.artifact.payload_types.clone() {
            if let Some(module) = self.module_for(&payload_type) {
                let _ = module.cleanup().await;
            }
        }
        self.hook(StateId::UpdateCleanup, Phase::Leave).await.ok();
        Ok(())
    }
}
