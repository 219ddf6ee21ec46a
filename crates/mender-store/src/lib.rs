//! The persistent store facade (§4.1, C1).
//!
//! A mapping from bytes-key to bytes-value with `read_all`/`write_all`/
//! `remove`, plus a transaction primitive that exposes the same three
//! operations but commits atomically on completion. This is the only
//! shared-mutable resource crossing task boundaries in the daemon (§5); every
//! cross-task access goes through [`KvStore`].
//!
//! Grounded on the teacher's `shipper-store` (trait-based backend
//! abstraction) and `shipper-state`/`shipper-storage` (temp-file-then-rename
//! atomic writes). The backend here is a directory of one file per key: a
//! write is `fsync`'d before the rename that makes it visible, which is what
//! lets §3's "StateData is fsync'd before the side effect" invariant hold
//! without a database dependency.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

/// Errors the store facade can raise. `NotFound` is distinguishable from
/// other I/O failures without string matching (§4.1).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The three operations exposed both directly and transactionally.
pub trait KvOps {
    fn read_all(&self, key: &str) -> StoreResult<Vec<u8>>;
    fn write_all(&self, key: &str, value: &[u8]) -> StoreResult<()>;
    fn remove(&self, key: &str) -> StoreResult<()>;
}

/// A filesystem-backed key/value store.
///
/// `key` is sanitized into a filename by replacing path separators; callers
/// are trusted to use the fixed key set listed in §6 ("Persisted keys"), so
/// this is a defensive clamp rather than a general-purpose escaping scheme.
#[derive(Clone)]
pub struct FileKvStore {
    root: PathBuf,
    /// Serializes every transaction's commit so that "the store write inside
    /// [a transaction] MUST happen under the same lock that selected the
    /// actions" (§4.2) holds for any caller layered on top of this store.
    write_lock: Arc<Mutex<()>>,
}

impl FileKvStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), write_lock: Arc::new(Mutex::new(())) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key.chars().map(|c| if c == '/' || c == '\\' { '_' } else { c }).collect();
        self.root.join(safe)
    }

    fn ensure_root(&self) -> StoreResult<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Acquire the store's single writer lock for the duration of a
    /// transaction (§4.1, §4.2 invariant).
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn write_file_locked(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.ensure_root()?;
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");

        let mut file = File::create(&tmp)?;
        file.write_all(value)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Begin a transaction. Writes staged through the handle are only
    /// visible to other readers once `commit()` is called.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction { store: self, guard: self.lock(), staged: RefCell::new(BTreeMap::new()) }
    }
}

impl KvOps for FileKvStore {
    fn read_all(&self, key: &str) -> StoreResult<Vec<u8>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let _guard = self.lock();
        self.write_file_locked(key, value)
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        let _guard = self.lock();
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// A staged batch of writes/removes committed atomically on [`Transaction::commit`].
///
/// "Atomic" here means: every staged write lands on disk (fsync'd, renamed
/// into place) before `commit()` returns, all under the store's single
/// writer lock, so no other caller observes a partial batch (§4.1). It is
/// not cross-file ACID — see the design-note in SPEC_FULL.md §4.1 — but that
/// is sufficient for the only multi-key transaction the core performs
/// (state + provides snapshot at commit, §4.5).
pub struct Transaction<'a> {
    store: &'a FileKvStore,
    guard: MutexGuard<'a, ()>,
    /// `RefCell`, not a plain map: `KvOps::write_all`/`remove` take `&self`
    /// (so a `Transaction` reads and writes through the same shared
    /// reference a caller holds), but staging a write is still a logical
    /// mutation — the one place in this crate a `Mutex` would be overkill,
    /// since a transaction never crosses a thread boundary (it borrows the
    /// store's writer lock for its whole lifetime).
    staged: RefCell<BTreeMap<String, Option<Vec<u8>>>>,
}

impl KvOps for Transaction<'_> {
    fn read_all(&self, key: &str) -> StoreResult<Vec<u8>> {
        match self.staged.borrow().get(key) {
            Some(Some(bytes)) => Ok(bytes.clone()),
            Some(None) => Err(StoreError::NotFound(key.to_string())),
            None => self.store.read_all(key),
        }
    }

    fn write_all(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.staged.borrow_mut().insert(key.to_string(), Some(value.to_vec()));
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.staged.borrow_mut().insert(key.to_string(), None);
        Ok(())
    }
}

impl Transaction<'_> {
    /// Flush every staged write/remove, in key order, then release the
    /// store's writer lock.
    pub fn commit(self) -> StoreResult<()> {
        for (key, value) in self.staged.borrow().iter() {
            match value {
                Some(bytes) => self.store.write_file_locked(key, bytes)?,
                None => {
                    let path = self.store.path_for(key);
                    if path.exists() {
                        fs::remove_file(&path)?;
                    }
                }
            }
        }
        drop(self.guard);
        Ok(())
    }

    /// Discard every staged write without touching the backing files.
    pub fn rollback(self) {
        drop(self.guard);
    }
}
