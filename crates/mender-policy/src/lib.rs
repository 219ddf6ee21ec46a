//! The control-map pool (§3 `UpdateControlMap`, §4.2, C2).
//!
//! A thread-safe collection of deployment-policy documents, with expiration,
//! priority-ordered query, and durable round-trip through the persistent
//! store. Grounded on the teacher's `shipper-store` trait abstraction
//! (`KvOps`) for persistence and on `shipper-retry`'s configuration-driven
//! timing policy for the half-time/expiry arithmetic, generalized here to
//! per-map deadlines (§9 "Control-map expiration").
//!
//! Per the design note in SPEC_FULL.md §9, expiration is implemented as a
//! scan performed on every pool access rather than a separate per-map timer
//! task: both satisfy the contract, and scanning on access is what keeps
//! tests deterministic (no background task to race against).

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use mender_store::{KvOps, StoreError};
use mender_types::control_map::{Action, Checkpoint, ControlMapId, UpdateControlMap, CONTROL_MAPS_KEY};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type PolicyResult<T> = Result<T, PolicyError>;

/// One pool entry: the map plus bookkeeping that is never persisted.
struct Entry {
    map: UpdateControlMap,
    /// Checkpoints whose `on_map_expire` action has already been surfaced to
    /// a caller while expired. Once this covers every checkpoint the map
    /// declares, the map is eligible for garbage collection (§4.2 "retained
    /// only until their on_map_expire has been surfaced").
    surfaced: HashSet<Checkpoint>,
}

impl Entry {
    fn fresh(map: UpdateControlMap) -> Self {
        Self { map, surfaced: HashSet::new() }
    }

    fn eligible_for_gc(&self) -> bool {
        self.map.expired && self.map.states.keys().all(|c| self.surfaced.contains(c))
    }
}

/// On-disk shape: `{ active: [...], expired: [...] }` (§4.2 "Durable format").
#[derive(Debug, Serialize, Deserialize)]
struct DurableDump {
    active: Vec<UpdateControlMap>,
    expired: Vec<UpdateControlMap>,
}

/// The collection of live control maps, backed by a persistent store.
///
/// Per the resolved open question in SPEC_FULL.md §9, only this persistent,
/// store-backed form exists in production code; there is no parameter-less
/// in-memory variant.
pub struct ControlMapPool<S> {
    store: S,
    entries: Mutex<Vec<Entry>>,
    updates_tx: watch::Sender<u64>,
}

impl<S: KvOps> ControlMapPool<S> {
    /// Construct an empty pool over `store`, without touching it. Call
    /// [`ControlMapPool::load`] to hydrate from a prior boot.
    pub fn new(store: S) -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { store, entries: Mutex::new(Vec::new()), updates_tx: tx }
    }

    /// Subscribe to pool mutations (insert/delete/expire). C6 uses this to
    /// recompute the next half-time deadline.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.updates_tx.subscribe()
    }

    fn wake(&self, entries: &[Entry]) {
        let revision = self.updates_tx.borrow().wrapping_add(1);
        let _ = self.updates_tx.send(revision);
        let _ = entries;
    }

    /// Load the pool from the store at boot (§4.2 "Durable format").
    ///
    /// Every loaded map is assigned a fresh expiry of `now + boot_timeout`,
    /// then the previously-expired subset is marked expired immediately, so
    /// their `on_map_expire` applies on the very next query: maps survive
    /// reboot but cannot indefinitely extend their life across boots.
    pub fn load(&self, boot_timeout: chrono::Duration) -> PolicyResult<()> {
        let now = Utc::now();
        let dump = match self.store.read_all(CONTROL_MAPS_KEY) {
            Ok(bytes) => serde_json::from_slice::<DurableDump>(&bytes)?,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = self.entries.lock().unwrap();
        entries.clear();
        for mut map in dump.active {
            map.inserted_at = now;
            map.expiry_time = now + boot_timeout;
            map.expired = false;
            entries.push(Entry::fresh(map));
        }
        for mut map in dump.expired {
            map.inserted_at = now;
            map.expiry_time = now + boot_timeout;
            map.expired = true;
            entries.push(Entry::fresh(map));
        }
        self.persist_locked(&entries)?;
        Ok(())
    }

    fn persist_locked(&self, entries: &[Entry]) -> PolicyResult<()> {
        let (active, expired): (Vec<_>, Vec<_>) =
            entries.iter().map(|e| e.map.clone()).partition(|m| !m.expired);
        let dump = DurableDump { active, expired };
        let bytes = serde_json::to_vec(&dump)?;
        self.store.write_all(CONTROL_MAPS_KEY, &bytes)?;
        Ok(())
    }

    /// Flip `expired` on every entry whose `expiry_time` has passed, and
    /// drop entries eligible for GC. Returns whether anything changed.
    fn tick_locked(&self, entries: &mut Vec<Entry>, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        for entry in entries.iter_mut() {
            if !entry.map.expired && entry.map.is_expired_at(now) {
                entry.map.expired = true;
                changed = true;
            }
        }
        let before = entries.len();
        entries.retain(|e| !e.eligible_for_gc());
        if entries.len() != before {
            changed = true;
        }
        changed
    }

    /// Insert a map, evicting any existing map with the same (ID, priority)
    /// (§4.2 `insert`).
    pub fn insert(&self, map: UpdateControlMap) -> PolicyResult<()> {
        let mut entries = self.entries.lock().unwrap();
        self.tick_locked(&mut entries, Utc::now());
        entries.retain(|e| e.map.identity() != map.identity());
        entries.push(Entry::fresh(map));
        self.persist_locked(&entries)?;
        self.wake(&entries);
        Ok(())
    }

    /// Insert a map, evicting every existing map with the same ID regardless
    /// of priority (§4.2 `insert_replace_all_priorities`).
    pub fn insert_replace_all_priorities(&self, map: UpdateControlMap) -> PolicyResult<()> {
        let mut entries = self.entries.lock().unwrap();
        self.tick_locked(&mut entries, Utc::now());
        entries.retain(|e| e.map.id != map.id);
        entries.push(Entry::fresh(map));
        self.persist_locked(&entries)?;
        self.wake(&entries);
        Ok(())
    }

    pub fn delete(&self, id: &ControlMapId, priority: i64) -> PolicyResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|e| !(e.map.id == *id && e.map.priority == priority));
        self.persist_locked(&entries)?;
        self.wake(&entries);
        Ok(())
    }

    pub fn delete_all_priorities(&self, id: &ControlMapId) -> PolicyResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|e| e.map.id != *id);
        self.persist_locked(&entries)?;
        self.wake(&entries);
        Ok(())
    }

    /// Maps matching `id`, partitioned into `(active, expired)` (§4.2 `get`).
    pub fn get(&self, id: &ControlMapId) -> (Vec<UpdateControlMap>, Vec<UpdateControlMap>) {
        let mut entries = self.entries.lock().unwrap();
        self.tick_locked(&mut entries, Utc::now());
        let matching: Vec<_> = entries.iter().filter(|e| e.map.id == *id).map(|e| e.map.clone()).collect();
        matching.into_iter().partition(|m| !m.expired)
    }

    pub fn has_control_map(&self, id: &ControlMapId) -> bool {
        let entries = self.entries.lock().unwrap();
        entries.iter().any(|e| e.map.id == *id)
    }

    /// Drop every entry eligible for garbage collection (§4.2 `clear_expired`).
    pub fn clear_expired(&self) -> PolicyResult<()> {
        let mut entries = self.entries.lock().unwrap();
        let changed = self.tick_locked(&mut entries, Utc::now());
        if changed {
            self.persist_locked(&entries)?;
            self.wake(&entries);
        }
        Ok(())
    }

    /// The policy-evaluation primitive consulted before entering a gated
    /// checkpoint (§4.2 "Query algorithm", authoritative steps 1-3).
    pub fn query_and_update(&self, checkpoint: Checkpoint) -> PolicyResult<Action> {
        let mut entries = self.entries.lock().unwrap();
        self.tick_locked(&mut entries, Utc::now());

        // Step 1: sort live maps by descending priority, grouped into bands.
        let mut priorities: Vec<i64> = entries.iter().map(|e| e.map.priority).collect();
        priorities.sort_unstable_by(|a, b| b.cmp(a));
        priorities.dedup();

        let mut decision = Action::Continue;
        let mut touched = false;

        'bands: for priority in priorities {
            let mut actions_in_band = Vec::new();
            for entry in entries.iter_mut().filter(|e| e.map.priority == priority) {
                let Some(triplet) = entry.map.states.get(&checkpoint).copied() else {
                    continue;
                };
                let effective = if entry.map.expired { triplet.on_map_expire } else { triplet.action };
                actions_in_band.push(effective);

                // Commit the transition: rotate action -> on_action_executed
                // so the next query sees the post-execution value.
                if let Some(t) = entry.map.states.get_mut(&checkpoint) {
                    t.action = triplet.on_action_executed;
                }
                if entry.map.expired {
                    entry.surfaced.insert(checkpoint);
                }
                touched = true;
            }

            if !actions_in_band.is_empty() {
                let dominant = Action::dominant(&actions_in_band);
                if dominant != Action::Continue {
                    decision = dominant;
                    break 'bands;
                }
            }
        }

        if touched {
            // GC maps whose on_map_expire has now been surfaced for every
            // checkpoint they declare.
            entries.retain(|e| !e.eligible_for_gc());
            self.persist_locked(&entries)?;
            self.wake(&entries);
        }

        Ok(decision)
    }

    /// Earliest halfway-to-expiry time among maps with this ID (§4.2).
    pub fn next_id_control_map_half_time(&self, id: &ControlMapId) -> Option<DateTime<Utc>> {
        let entries = self.entries.lock().unwrap();
        entries.iter().filter(|e| e.map.id == *id && !e.map.expired).map(|e| e.map.half_time()).min()
    }

    /// Earliest halfway-to-expiry time across every live map (§4.2).
    pub fn next_any_control_map_half_time(&self) -> Option<DateTime<Utc>> {
        let entries = self.entries.lock().unwrap();
        entries.iter().filter(|e| !e.map.expired).map(|e| e.map.half_time()).min()
    }

    /// Snapshot of every live map, for diagnostics/tests.
    pub fn snapshot(&self) -> Vec<UpdateControlMap> {
        let entries = self.entries.lock().unwrap();
        entries.iter().map(|e| e.map.clone()).collect()
    }
}

/// Per-checkpoint action triplets, re-exported for callers that only need
/// the type (avoids every crate depending on `mender_types::control_map`
/// directly for this one alias).
pub type CheckpointActions = BTreeMap<Checkpoint, mender_types::control_map::ActionTriplet>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use mender_store::FileKvStore;
    use mender_types::control_map::ActionTriplet;

    fn triplet(action: Action, on_map_expire: Action, on_action_executed: Action) -> ActionTriplet {
        ActionTriplet { action, on_map_expire, on_action_executed }
    }

    fn pool() -> ControlMapPool<FileKvStore> {
        let td = tempfile::tempdir().unwrap();
        ControlMapPool::new(FileKvStore::new(td.path().to_path_buf()))
    }

    fn map_with(
        id: &str,
        priority: i64,
        checkpoint: Checkpoint,
        action: Action,
        on_map_expire: Action,
        on_action_executed: Action,
        ttl_secs: i64,
    ) -> UpdateControlMap {
        let now = Utc::now();
        let mut states = CheckpointActions::new();
        states.insert(checkpoint, triplet(action, on_map_expire, on_action_executed));
        UpdateControlMap::new(ControlMapId(id.to_string()), priority, states, now, now + ChronoDuration::seconds(ttl_secs))
    }

    #[test]
    fn insert_colliding_identity_replaces() {
        let pool = pool();
        let m1 = map_with("m1", 0, Checkpoint::ArtifactInstallEnter, Action::Continue, Action::Continue, Action::Continue, 60);
        let m2 = map_with("m1", 0, Checkpoint::ArtifactInstallEnter, Action::Fail, Action::Continue, Action::Continue, 60);
        pool.insert(m1).unwrap();
        pool.insert(m2).unwrap();
        assert_eq!(pool.snapshot().len(), 1);
        assert_eq!(pool.snapshot()[0].states[&Checkpoint::ArtifactInstallEnter].action, Action::Fail);
    }

    #[test]
    fn insert_replace_all_priorities_evicts_by_id_only() {
        let pool = pool();
        pool.insert(map_with("m1", 0, Checkpoint::ArtifactInstallEnter, Action::Continue, Action::Continue, Action::Continue, 60)).unwrap();
        pool.insert(map_with("m1", 1, Checkpoint::ArtifactInstallEnter, Action::Continue, Action::Continue, Action::Continue, 60)).unwrap();
        assert_eq!(pool.snapshot().len(), 2);

        pool.insert_replace_all_priorities(map_with(
            "m1", 5, Checkpoint::ArtifactInstallEnter, Action::Pause, Action::Continue, Action::Continue, 60,
        ))
        .unwrap();
        assert_eq!(pool.snapshot().len(), 1);
        assert_eq!(pool.snapshot()[0].priority, 5);
    }

    #[test]
    fn query_and_update_returns_dominant_action_and_rotates() {
        let pool = pool();
        pool.insert(map_with(
            "m1", 0, Checkpoint::ArtifactInstallEnter, Action::Pause, Action::Continue, Action::Continue, 60,
        ))
        .unwrap();

        let first = pool.query_and_update(Checkpoint::ArtifactInstallEnter).unwrap();
        assert_eq!(first, Action::Pause);

        // on_action_executed was Continue, so the next query sees Continue.
        let second = pool.query_and_update(Checkpoint::ArtifactInstallEnter).unwrap();
        assert_eq!(second, Action::Continue);
    }

    #[test]
    fn higher_priority_band_wins_even_if_lower_priority_is_fail() {
        let pool = pool();
        pool.insert(map_with("low", 0, Checkpoint::ArtifactCommitEnter, Action::Fail, Action::Continue, Action::Continue, 60)).unwrap();
        pool.insert(map_with("high", 10, Checkpoint::ArtifactCommitEnter, Action::Continue, Action::Continue, Action::Continue, 60)).unwrap();

        let decision = pool.query_and_update(Checkpoint::ArtifactCommitEnter).unwrap();
        assert_eq!(decision, Action::Continue);
    }

    #[test]
    fn fail_dominates_within_same_band() {
        let pool = pool();
        let now = Utc::now();
        let mut states = CheckpointActions::new();
        states.insert(Checkpoint::ArtifactCommitEnter, triplet(Action::Pause, Action::Continue, Action::Continue));
        let m1 = UpdateControlMap::new(ControlMapId("a".into()), 0, states.clone(), now, now + ChronoDuration::seconds(60));
        let mut states2 = CheckpointActions::new();
        states2.insert(Checkpoint::ArtifactCommitEnter, triplet(Action::Fail, Action::Continue, Action::Continue));
        let m2 = UpdateControlMap::new(ControlMapId("b".into()), 0, states2, now, now + ChronoDuration::seconds(60));

        pool.insert(m1).unwrap();
        pool.insert(m2).unwrap();
        assert_eq!(pool.query_and_update(Checkpoint::ArtifactCommitEnter).unwrap(), Action::Fail);
    }

    #[test]
    fn no_matching_map_returns_continue() {
        let pool = pool();
        assert_eq!(pool.query_and_update(Checkpoint::ArtifactRebootEnter).unwrap(), Action::Continue);
    }

    #[test]
    fn expired_map_uses_on_map_expire_and_is_gced_after_surfaced() {
        let pool = pool();
        let map = map_with("m1", 0, Checkpoint::ArtifactInstallEnter, Action::Pause, Action::Fail, Action::Continue, -1);
        pool.insert(map).unwrap();

        let decision = pool.query_and_update(Checkpoint::ArtifactInstallEnter).unwrap();
        assert_eq!(decision, Action::Fail);
        // on_map_expire surfaced for its only checkpoint -> GC'd.
        assert!(pool.snapshot().is_empty());
    }

    #[test]
    fn round_trip_through_store_preserves_maps_and_marks_expired() {
        let td = tempfile::tempdir().unwrap();
        let store = FileKvStore::new(td.path().to_path_buf());
        let pool = ControlMapPool::new(store.clone());
        pool.insert(map_with("m1", 3, Checkpoint::ArtifactCommitEnter, Action::Continue, Action::Continue, Action::Continue, -5)).unwrap();
        pool.load(ChronoDuration::seconds(30)).unwrap();
        let snap = pool.snapshot();
        assert_eq!(snap.len(), 1);
        // -5s ttl means the map was already expired before the explicit load;
        // it must still show up as expired immediately post-load.
        assert!(snap[0].expired);

        let pool2 = ControlMapPool::new(store);
        pool2.load(ChronoDuration::seconds(30)).unwrap();
        assert_eq!(pool2.snapshot().len(), 1);
        assert_eq!(pool2.snapshot()[0].id, ControlMapId("m1".into()));
        assert_eq!(pool2.snapshot()[0].priority, 3);
    }

    #[test]
    fn has_control_map_checks_id_presence() {
        let pool = pool();
        let id = ControlMapId("dep-1".into());
        assert!(!pool.has_control_map(&id));
        pool.insert(map_with("dep-1", 0, Checkpoint::ArtifactInstallEnter, Action::Continue, Action::Continue, Action::Continue, 60)).unwrap();
        assert!(pool.has_control_map(&id));
    }

    #[test]
    fn half_time_helpers_report_earliest() {
        let pool = pool();
        pool.insert(map_with("a", 0, Checkpoint::ArtifactInstallEnter, Action::Continue, Action::Continue, Action::Continue, 1000)).unwrap();
        pool.insert(map_with("b", 0, Checkpoint::ArtifactInstallEnter, Action::Continue, Action::Continue, Action::Continue, 100)).unwrap();

        let earliest = pool.next_any_control_map_half_time().unwrap();
        let b_half = pool.snapshot().into_iter().find(|m| m.id.0 == "b").unwrap().half_time();
        assert_eq!(earliest, b_half);
    }
}
