//! The standalone driver (§4.7, C7): `install`/`commit`/`rollback` entry
//! points for one-shot CLI invocations, with no daemon loop and no server
//! poll involved. State is round-tripped through the store under a
//! dedicated key so `commit`/`rollback` can run as a separate process
//! invocation from the `install` that preceded them.
//!
//! Grounded on the teacher's `shipper-cli` one-shot subcommands
//! (`shipper publish` / `shipper verify` as independent invocations sharing
//! on-disk state), generalized here to the three-entry-point standalone
//! contract §4.7 names.

use anyhow::{Context, Result};
use mender_store::KvOps;
use mender_types::artifact::UpdateInfo;
use mender_types::state_data::StateData;
use mender_types::state_id::StateId;

use crate::machine::{Deployment, DeploymentOutcome};

/// The storage key standalone state round-trips through, distinct from the
/// daemon's `state-data` key so a standalone deployment never collides with
/// an in-progress daemon-driven one (§4.7 `storeStandaloneData`).
pub const STANDALONE_DATA_KEY: &str = "standalone-data";

/// Persist the in-flight standalone deployment's checkpoint so a later,
/// separate `commit`/`rollback` invocation can resume it (§4.7
/// `storeStandaloneData`).
pub fn store_standalone_data(store: &impl KvOps, data: &StateData) -> Result<()> {
    let bytes = serde_json::to_vec(data).context("serializing standalone state data")?;
    store.write_all(STANDALONE_DATA_KEY, &bytes).context("persisting standalone state data")?;
    Ok(())
}

/// Load a previously-stored standalone checkpoint (§4.7
/// `restoreStandaloneData`). `None` if no standalone install is in flight.
pub fn restore_standalone_data(store: &impl KvOps) -> Result<Option<StateData>> {
    match store.read_all(STANDALONE_DATA_KEY) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).context("parsing standalone state data")?)),
        Err(mender_store::StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn clear_standalone_data(store: &impl KvOps) -> Result<()> {
    store.remove(STANDALONE_DATA_KEY)?;
    Ok(())
}

/// `mender-core install <artifact>` (§4.7): store, check dependencies,
/// install, and stop — deliberately short of commit, so the operator (or a
/// wrapping script) can inspect the result before committing or rolling
/// back in a later invocation.
pub async fn install(deployment: &Deployment, update_info: UpdateInfo) -> Result<()> {
    let mut data = StateData::new(StateId::UpdateStore, update_info);
    store_standalone_data(&deployment.store, &data)?;

    match deployment.install_phase(&mut data).await {
        Ok(()) => {
            store_standalone_data(&deployment.store, &data)?;
            Ok(())
        }
        Err(e) => {
            clear_standalone_data(&deployment.store)?;
            Err(anyhow::anyhow!(e))
        }
    }
}

/// `mender-core commit` (§4.7): resume the checkpoint a prior `install` left
/// behind and drive it through reboot/commit/cleanup to `Idle`.
pub async fn commit(deployment: &Deployment) -> Result<DeploymentOutcome> {
    let mut data = restore_standalone_data(&deployment.store)?
        .ok_or_else(|| anyhow::anyhow!("no standalone installation in progress"))?;

    let outcome = deployment.commit_phase(&mut data).await;
    clear_standalone_data(&deployment.store)?;
    outcome.map_err(|e| anyhow::anyhow!(e))
}

/// `mender-core rollback` (§4.7): resume the checkpoint a prior `install`
/// left behind and drive it through the rollback path instead of commit.
pub async fn rollback(deployment: &Deployment) -> Result<DeploymentOutcome> {
    let mut data = restore_standalone_data(&deployment.store)?
        .ok_or_else(|| anyhow::anyhow!("no standalone installation in progress"))?;

    let outcome = deployment.rollback_phase(&mut data, "operator-requested rollback").await;
    clear_standalone_data(&deployment.store)?;
    outcome.map_err(|e| anyhow::anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{HookExecutor, Trace};
    use crate::installer::FakeModule;
    use mender_policy::ControlMapPool;
    use mender_store::FileKvStore;
    use mender_types::artifact::ArtifactInfo;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn deployment(td: &std::path::Path, modules: Vec<Arc<dyn crate::installer::UpdateModule>>) -> Deployment {
        let store = FileKvStore::new(td.join("db"));
        let control_maps = Arc::new(ControlMapPool::new(store.clone()));
        let hooks = HookExecutor::new(td.join("scripts"), Duration::from_secs(5), Trace::new());
        Deployment {
            store,
            control_maps,
            hooks,
            modules,
            device_type: "qemux86-64".to_string(),
            broken_suffix: "_INCONSISTENT".to_string(),
            max_store_count: 100,
            status_report: None,
        }
    }

    fn artifact(name: &str) -> UpdateInfo {
        let mut info = UpdateInfo::new("standalone-dep", ArtifactInfo { name: name.to_string(), payload_types: vec!["rootfs-image".to_string()], ..Default::default() });
        info.artifact.type_info_provides.insert("rootfs-image.version".to_string(), "v2".to_string());
        info
    }

    #[tokio::test]
    async fn install_then_commit_round_trips_through_store() {
        let td = tempdir().unwrap();
        let module: Arc<dyn crate::installer::UpdateModule> = Arc::new(FakeModule::new("rootfs-image"));
        let deployment = deployment(td.path(), vec![module]);

        install(&deployment, artifact("artifact-name")).await.unwrap();
        assert!(restore_standalone_data(&deployment.store).unwrap().is_some());

        let outcome = commit(&deployment).await.unwrap();
        assert_eq!(outcome, DeploymentOutcome::Committed { artifact_name: "artifact-name".to_string() });
        assert!(restore_standalone_data(&deployment.store).unwrap().is_none());
    }

    #[tokio::test]
    async fn rollback_without_a_prior_install_is_an_error() {
        let td = tempdir().unwrap();
        let deployment = deployment(td.path(), vec![]);
        assert!(rollback(&deployment).await.is_err());
    }
}
