use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::engine::{EngineError, RollbackInfo, StorageEngine};

const CURRENT_DIR: &str = "current";
const BACKUPS_DIR: &str = "backups";
const LOCK_FILE: &str = "archive.lock";
const RECORD_PREFIX: &[u8] = b"record:";
const DIGEST_KEY: &[u8] = b"meta:digest";
const CHECKPOINT_KEY: &[u8] = b"meta:checkpoint_unix_ms";

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub backup_min_interval: Duration,
    pub backup_retain: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            backup_min_interval: Duration::from_secs(60 * 60),
            backup_retain: 10,
        }
    }
}

/// Storage engine backed by a sled database under `<root>/current`.
///
/// Records are edited in memory and only reach disk on `store`, as one atomic
/// batch together with their digest. A digest mismatch on open is reported
/// as `DataIsCorrupted`; rollback restores the newest verified backup from
/// `<root>/backups`.
#[derive(Clone)]
pub struct SledEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    options: EngineOptions,
    state: Mutex<EngineState>,
    hooks: Mutex<HashMap<Uuid, String>>,
}

#[derive(Default)]
struct EngineState {
    lock: Option<HeldLock>,
    store: Option<OpenStore>,
}

struct HeldLock {
    root: PathBuf,
    file: File,
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

struct OpenStore {
    db: sled::Db,
    records: BTreeMap<String, Value>,
    dirty: bool,
    last_backup_unix_ms: u64,
}

impl SledEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                options,
                state: Mutex::new(EngineState::default()),
                hooks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().store.is_some()
    }

    pub fn put_record(&self, id: &str, value: Value) -> Result<(), EngineError> {
        let mut st = self.inner.state.lock();
        let store = st.store.as_mut().ok_or_else(not_open)?;
        store.records.insert(id.to_string(), value);
        store.dirty = true;
        Ok(())
    }

    pub fn remove_record(&self, id: &str) -> Result<Option<Value>, EngineError> {
        let mut st = self.inner.state.lock();
        let store = st.store.as_mut().ok_or_else(not_open)?;
        let removed = store.records.remove(id);
        if removed.is_some() {
            store.dirty = true;
        }
        Ok(removed)
    }

    pub fn get_record(&self, id: &str) -> Option<Value> {
        let st = self.inner.state.lock();
        st.store.as_ref()?.records.get(id).cloned()
    }

    pub fn list_records(&self) -> Vec<(String, Value)> {
        let st = self.inner.state.lock();
        st.store
            .as_ref()
            .map(|s| {
                s.records
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Registers a live editor hook on a record. Hooks survive until released
    /// explicitly or by `release_stale_handles`.
    pub fn register_hook(&self, label: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.hooks.lock().insert(id, label.to_string());
        id
    }

    pub fn release_hook(&self, id: Uuid) -> bool {
        self.inner.hooks.lock().remove(&id).is_some()
    }

    pub fn hook_count(&self) -> usize {
        self.inner.hooks.lock().len()
    }

    /// Flushes and drops the database handle and the instance lock.
    pub fn close(&self) {
        let mut st = self.inner.state.lock();
        if let Some(store) = st.store.take() {
            if let Err(e) = store.db.flush() {
                log::warn!("flush on close failed: {e}");
            }
        }
        st.lock = None;
    }
}

fn not_open() -> EngineError {
    EngineError::Other("NotOpen".to_string())
}

async fn blocking<T, F>(f: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(res) => res,
        Err(e) => Err(EngineError::Other(format!("engine task failed: {e}"))),
    }
}

impl StorageEngine for SledEngine {
    fn open(&self, path: &Path) -> impl Future<Output = Result<(), EngineError>> + Send {
        let inner = self.inner.clone();
        let path = path.to_path_buf();
        async move { blocking(move || inner.open(&path)).await }
    }

    fn create(&self, path: &Path) -> impl Future<Output = Result<(), EngineError>> + Send {
        let inner = self.inner.clone();
        let path = path.to_path_buf();
        async move { blocking(move || inner.create(&path)).await }
    }

    fn release_stale_handles(&self) -> impl Future<Output = ()> + Send {
        let inner = self.inner.clone();
        async move {
            let released = {
                let mut hooks = inner.hooks.lock();
                let n = hooks.len();
                hooks.clear();
                n
            };
            log::info!("released {released} stale record hooks");
        }
    }

    fn store(&self) -> impl Future<Output = Result<(), EngineError>> + Send {
        let inner = self.inner.clone();
        async move { blocking(move || inner.store()).await }
    }

    fn query_integrity(
        &self,
        path: &Path,
    ) -> impl Future<Output = Result<RollbackInfo, EngineError>> + Send {
        let path = path.to_path_buf();
        async move { blocking(move || query_integrity(&path)).await }
    }

    fn commit_rollback(&self, path: &Path) -> impl Future<Output = Result<(), EngineError>> + Send {
        let inner = self.inner.clone();
        let path = path.to_path_buf();
        async move { blocking(move || inner.commit_rollback(&path)).await }
    }
}

impl EngineInner {
    fn open(&self, root: &Path) -> Result<(), EngineError> {
        let mut st = self.state.lock();
        if st.store.is_some() {
            return Err(EngineError::AlreadyOpen);
        }
        let current = root.join(CURRENT_DIR);
        if !current.join("db").exists() {
            return Err(EngineError::NotFound);
        }
        acquire_lock(&mut st, root)?;

        let (db, records) = open_verified(&current)?;
        st.store = Some(OpenStore {
            db,
            records,
            dirty: false,
            last_backup_unix_ms: newest_backup_unix_ms(root),
        });
        log::info!("database opened at {}", root.display());
        Ok(())
    }

    fn create(&self, root: &Path) -> Result<(), EngineError> {
        let mut st = self.state.lock();
        std::fs::create_dir_all(root).map_err(|e| EngineError::io("create store dir", e))?;
        let had_lock = st.lock.is_some();
        let lock_existed = root.join(LOCK_FILE).exists();
        // Lock before looking: a racing creator must surface as Collision.
        acquire_lock(&mut st, root)?;
        if dir_has_entries(root) {
            if !had_lock {
                st.lock = None;
                if !lock_existed {
                    let _ = std::fs::remove_file(root.join(LOCK_FILE));
                }
            }
            return Err(EngineError::AlreadyExists);
        }

        let current = root.join(CURRENT_DIR);
        let records = BTreeMap::new();
        let db = write_fresh_db(&current, &records)?;
        st.store = Some(OpenStore {
            db,
            records,
            dirty: false,
            last_backup_unix_ms: 0,
        });
        log::info!("database created at {}", root.display());
        Ok(())
    }

    fn store(&self) -> Result<(), EngineError> {
        let mut st = self.state.lock();
        let root = st
            .lock
            .as_ref()
            .map(|l| l.root.clone())
            .ok_or_else(not_open)?;
        let store = st.store.as_mut().ok_or_else(not_open)?;

        if store.dirty {
            write_records(&store.db, &store.records)?;
            store.dirty = false;
        }
        store.db.flush().map_err(sled_error)?;

        let now = unix_ms();
        let due = self.options.backup_min_interval.as_millis() as u64;
        if store.last_backup_unix_ms == 0 || now.saturating_sub(store.last_backup_unix_ms) >= due {
            match write_backup(&root, now, &store.records) {
                Ok(()) => {
                    store.last_backup_unix_ms = now;
                    prune_backups(&root, self.options.backup_retain);
                }
                Err(e) => log::warn!("backup skipped: {e}"),
            }
        }
        Ok(())
    }

    fn commit_rollback(&self, root: &Path) -> Result<(), EngineError> {
        let mut st = self.state.lock();
        acquire_lock(&mut st, root)?;

        let Some((backup_ms, records)) = newest_valid_backup(root) else {
            return Err(EngineError::NotFound);
        };
        // The current handle is released only once a backup is in hand.
        st.store = None;
        let current = root.join(CURRENT_DIR);
        quarantine_dir(root, &current)?;
        let db = write_fresh_db(&current, &records)?;
        st.store = Some(OpenStore {
            db,
            records,
            dirty: false,
            last_backup_unix_ms: backup_ms,
        });
        log::info!(
            "database rolled back to backup {} ({})",
            backup_ms,
            format_instant(backup_ms)
        );
        Ok(())
    }
}

fn acquire_lock(st: &mut EngineState, root: &Path) -> Result<(), EngineError> {
    if let Some(held) = st.lock.as_ref() {
        if held.root == root {
            return Ok(());
        }
        return Err(EngineError::Other(format!(
            "engine already bound to {}",
            held.root.display()
        )));
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(root.join(LOCK_FILE))
        .map_err(|e| EngineError::io("open lock file", e))?;
    if file.try_lock_exclusive().is_err() {
        return Err(EngineError::Collision);
    }
    st.lock = Some(HeldLock {
        root: root.to_path_buf(),
        file,
    });
    Ok(())
}

fn sled_error(e: sled::Error) -> EngineError {
    EngineError::Other(format!("sled: {e}"))
}

/// Opens `dir` and checks the stored digest against the records. Any sled
/// failure other than plain I/O counts as corruption, including panics.
fn open_verified(dir: &Path) -> Result<(sled::Db, BTreeMap<String, Value>), EngineError> {
    let attempt = std::panic::catch_unwind(|| sled::open(dir));
    let db = match attempt {
        Ok(Ok(db)) => db,
        Ok(Err(sled::Error::Io(e))) => return Err(EngineError::io("open database", e)),
        Ok(Err(e)) => {
            log::warn!("sled reported corruption: {e}");
            return Err(EngineError::DataIsCorrupted);
        }
        Err(_) => {
            log::warn!("sled panicked while opening {}", dir.display());
            return Err(EngineError::DataIsCorrupted);
        }
    };

    let mut records = BTreeMap::new();
    let mut encoded = Vec::new();
    for res in db.scan_prefix(RECORD_PREFIX) {
        let Ok((k, v)) = res else {
            return Err(EngineError::DataIsCorrupted);
        };
        let id = String::from_utf8(k[RECORD_PREFIX.len()..].to_vec())
            .map_err(|_| EngineError::DataIsCorrupted)?;
        let value: Value =
            serde_json::from_slice(&v).map_err(|_| EngineError::DataIsCorrupted)?;
        records.insert(id.clone(), value);
        encoded.push((id, v));
    }

    // Checked against the stored bytes, never a re-encoding of them.
    let stored = db
        .get(DIGEST_KEY)
        .map_err(|_| EngineError::DataIsCorrupted)?
        .ok_or(EngineError::DataIsCorrupted)?;
    let actual = encoded_digest(encoded.iter().map(|(id, v)| (id.as_str(), &v[..])));
    if &stored[..] != actual.as_bytes() {
        log::warn!("digest mismatch in {}", dir.display());
        return Err(EngineError::DataIsCorrupted);
    }
    Ok((db, records))
}

fn write_fresh_db(dir: &Path, records: &BTreeMap<String, Value>) -> Result<sled::Db, EngineError> {
    std::fs::create_dir_all(dir).map_err(|e| EngineError::io("create database dir", e))?;
    let db = sled::open(dir).map_err(sled_error)?;
    write_records(&db, records)?;
    db.flush().map_err(sled_error)?;
    Ok(db)
}

/// Replaces every stored record with `records` in one atomic batch.
fn write_records(db: &sled::Db, records: &BTreeMap<String, Value>) -> Result<(), EngineError> {
    let mut batch = sled::Batch::default();
    for key in db.scan_prefix(RECORD_PREFIX).keys() {
        let key = key.map_err(sled_error)?;
        let id = String::from_utf8_lossy(&key[RECORD_PREFIX.len()..]).to_string();
        if !records.contains_key(&id) {
            batch.remove(key);
        }
    }
    let mut encoded = Vec::with_capacity(records.len());
    for (id, value) in records {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| EngineError::Other(format!("encode record {id}: {e}")))?;
        batch.insert(record_key(id), bytes.as_slice());
        encoded.push((id.as_str(), bytes));
    }
    let digest = encoded_digest(encoded.iter().map(|(id, b)| (*id, b.as_slice())));
    batch.insert(DIGEST_KEY, digest.as_bytes());
    batch.insert(CHECKPOINT_KEY, unix_ms().to_string().as_bytes());
    db.apply_batch(batch).map_err(sled_error)
}

fn record_key(id: &str) -> Vec<u8> {
    let mut key = RECORD_PREFIX.to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

include!("sled_engine_parts/snapshots.rs");

include!("sled_engine_parts/tests.rs");
