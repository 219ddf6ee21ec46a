//! The persistent crash-recovery checkpoint (§3 `StateData`).

use serde::{Deserialize, Serialize};

use crate::artifact::UpdateInfo;
use crate::state_id::StateId;

/// The storage key `StateData` is persisted under.
pub const STATE_DATA_KEY: &str = "state-data";

/// Current on-disk schema version for `StateData`. Bumped when the shape of
/// this struct changes in a way that requires a migration on load.
pub const STATE_DATA_VERSION: u32 = 1;

/// The durable checkpoint written before any state with observable side
/// effects performs that effect (§3 invariant). Re-entry after a crash loads
/// the most recent `StateData` and re-enters `state` from scratch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateData {
    pub version: u32,
    pub state: StateId,
    pub update_info: UpdateInfo,
    /// Monotonically incrementing count of `StateData` writes for this
    /// deployment. Bounded by `Settings::max_state_data_store_count`; on
    /// exceeding, the deployment is forcibly aborted (§3 "Store-count
    /// bound").
    pub store_count: u64,
}

impl StateData {
    pub fn new(state: StateId, update_info: UpdateInfo) -> Self {
        Self {
            version: STATE_DATA_VERSION,
            state,
            update_info,
            store_count: 0,
        }
    }

    /// Produce the checkpoint for the next state, incrementing the
    /// store-count. The caller persists the result before performing the
    /// next state's side effect.
    pub fn advance(&self, next_state: StateId) -> Self {
        Self {
            version: self.version,
            state: next_state,
            update_info: self.update_info.clone(),
            store_count: self.store_count + 1,
        }
    }

    /// Whether this checkpoint has exceeded the configured store-count
    /// ceiling and must be forced to failure.
    pub fn exceeds_store_count(&self, ceiling: u64) -> bool {
        self.store_count > ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactInfo;

    #[test]
    fn advance_increments_store_count() {
        let data = StateData::new(StateId::Init, UpdateInfo::new("d1", ArtifactInfo::default()));
        let next = data.advance(StateId::Idle);
        assert_eq!(next.store_count, 1);
        assert_eq!(next.state, StateId::Idle);

        let next2 = next.advance(StateId::AuthorizeWait);
        assert_eq!(next2.store_count, 2);
    }

    #[test]
    fn store_count_ceiling() {
        let mut data = StateData::new(StateId::Init, UpdateInfo::new("d1", ArtifactInfo::default()));
        for _ in 0..5 {
            data = data.advance(StateId::UpdateCheck);
        }
        assert!(!data.exceeds_store_count(5));
        assert!(data.exceeds_store_count(4));
    }
}
