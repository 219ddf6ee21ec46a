#![no_main]

use libfuzzer_sys::fuzz_target;
use mender_auth::{KeyStore, StoreKeyStore};
use mender_store::{FileKvStore, KvOps};
use tempfile::tempdir;

// `StoreKeyStore`'s private key constant is "device-private-key" (see
// crates/mender-auth/src/lib.rs); not exported, so hardcoded here.
const DEVICE_KEY_STORE_KEY: &str = "device-private-key";

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let store = FileKvStore::new(td.path());
    if store.write_all(DEVICE_KEY_STORE_KEY, data).is_err() {
        return;
    }

    let key_store = StoreKeyStore::new(store, false);
    let _ = key_store.load();
});
