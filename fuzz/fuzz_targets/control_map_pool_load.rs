#![no_main]

use libfuzzer_sys::fuzz_target;
use mender_policy::ControlMapPool;
use mender_store::{FileKvStore, KvOps};
use mender_types::control_map::CONTROL_MAPS_KEY;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let store = FileKvStore::new(td.path());
    if store.write_all(CONTROL_MAPS_KEY, data).is_err() {
        return;
    }

    let pool = ControlMapPool::new(store);
    let _ = pool.load(chrono::Duration::seconds(60));
});
