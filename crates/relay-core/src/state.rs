//! Durable checkpoint of the last fully processed source message.
//!
//! The record is written with write-temp-then-rename plus file and directory
//! fsync, so a crash mid-write leaves either the old or the new record on disk.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    domain::{PartialThread, SourceMessageId},
    errors::Error,
    ports::DurableStorage,
    Result,
};

pub const CHECKPOINT_KEY: &str = "checkpoint";

// ============== Storage ==============

/// One JSON file per key inside a state directory.
#[derive(Clone, Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::Storage(format!("invalid storage key: {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl DurableStorage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("read {}: {e}", path.display()))),
        }
    }

    fn atomic_write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let storage_err = |what: &str, e: std::io::Error| {
            Error::Storage(format!("{what} {}: {e}", path.display()))
        };

        fs::create_dir_all(&self.dir).map_err(|e| storage_err("create dir for", e))?;

        let tmp_path = path.with_extension("json.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(|e| storage_err("open temp for", e))?;
            file.write_all(bytes)
                .map_err(|e| storage_err("write temp for", e))?;
            file.sync_all().map_err(|e| storage_err("fsync temp for", e))?;
        }

        fs::rename(&tmp_path, &path).map_err(|e| storage_err("rename onto", e))?;

        // The rename is only durable once the directory entry is.
        #[cfg(unix)]
        {
            let dir = fs::File::open(&self.dir).map_err(|e| storage_err("open dir of", e))?;
            dir.sync_all().map_err(|e| storage_err("fsync dir of", e))?;
        }

        Ok(())
    }
}

/// In-memory storage for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(key: &str, bytes: impl Into<Vec<u8>>) -> Self {
        let s = Self::default();
        s.lock().insert(key.to_string(), bytes.into());
        s
    }

    /// Number of successful `atomic_write` calls.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DurableStorage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().get(key).cloned())
    }

    fn atomic_write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("write {key}: disk full")));
        }
        self.lock().insert(key.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============== Checkpoint ==============

/// Last fully processed source message; `None` means nothing processed yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub last_processed_id: Option<SourceMessageId>,
}

/// Per-message failure bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    /// Consecutive runs in which the message failed.
    pub count: u32,
    pub last_error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<PartialThread>,
}

/// Persisted form of the checkpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    #[serde(default, alias = "last_seen_id", deserialize_with = "id_or_none")]
    pub last_processed_id: Option<SourceMessageId>,

    /// Published while an older message was still failing.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub completed_ahead: BTreeSet<SourceMessageId>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failures: BTreeMap<SourceMessageId, FailureEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Legacy records used `0` for "nothing processed".
fn id_or_none<'de, D>(d: D) -> std::result::Result<Option<SourceMessageId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<i64>::deserialize(d)?;
    Ok(raw.filter(|v| *v > 0).map(SourceMessageId))
}

/// Sole owner of the checkpoint record.
///
/// Every mutating call is exactly one durable write; the in-memory record only
/// changes after that write succeeded.
pub struct CheckpointStore {
    storage: Arc<dyn DurableStorage>,
    record: CheckpointRecord,
}

impl fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl CheckpointStore {
    /// Read the record. Missing, unreadable or corrupt state degrades to the
    /// "none" checkpoint instead of failing the run.
    pub fn load(storage: Arc<dyn DurableStorage>) -> Self {
        let record = match storage.read(CHECKPOINT_KEY) {
            Ok(None) => {
                tracing::info!("no checkpoint found, starting from scratch");
                CheckpointRecord::default()
            }
            Ok(Some(bytes)) => match parse_record(&bytes) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "checkpoint is corrupt, treating all messages as unprocessed");
                    CheckpointRecord::default()
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "checkpoint is unreadable, treating all messages as unprocessed");
                CheckpointRecord::default()
            }
        };

        Self { storage, record }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            last_processed_id: self.record.last_processed_id,
        }
    }

    pub fn record(&self) -> &CheckpointRecord {
        &self.record
    }

    /// Already published in an earlier run behind a stuck message.
    pub fn is_completed_ahead(&self, id: SourceMessageId) -> bool {
        self.record.completed_ahead.contains(&id)
    }

    pub fn failure_count(&self, id: SourceMessageId) -> u32 {
        self.record.failures.get(&id).map_or(0, |f| f.count)
    }

    pub fn partial_thread(&self, id: SourceMessageId) -> Option<&PartialThread> {
        self.record.failures.get(&id).and_then(|f| f.partial.as_ref())
    }

    /// Advance the checkpoint to `id`.
    pub fn commit(&mut self, id: SourceMessageId) -> Result<()> {
        let mut next = self.record.clone();
        if next.last_processed_id.map_or(true, |last| id > last) {
            next.last_processed_id = Some(id);
        }
        if let Some(last) = next.last_processed_id {
            next.completed_ahead.retain(|done| *done > last);
            next.failures.retain(|failed, _| *failed > last);
        }
        self.persist(next)
    }

    /// Record a success that cannot advance the checkpoint yet because an
    /// older message is still pending.
    pub fn defer(&mut self, id: SourceMessageId) -> Result<()> {
        let mut next = self.record.clone();
        next.completed_ahead.insert(id);
        next.failures.remove(&id);
        self.persist(next)
    }

    /// Count one more failed run for `id`. Returns the new count.
    ///
    /// `partial` replaces any stored thread progress; `None` keeps it.
    pub fn record_failure(
        &mut self,
        id: SourceMessageId,
        reason: &str,
        partial: Option<PartialThread>,
    ) -> Result<u32> {
        let mut next = self.record.clone();
        let previous = next.failures.remove(&id);
        let count = previous.as_ref().map_or(0, |f| f.count) + 1;
        let partial = partial.or_else(|| previous.and_then(|f| f.partial));
        next.failures.insert(
            id,
            FailureEntry {
                count,
                last_error: reason.to_string(),
                partial,
            },
        );
        self.persist(next)?;
        Ok(count)
    }

    fn persist(&mut self, mut next: CheckpointRecord) -> Result<()> {
        next.updated_at = Some(Utc::now());
        let bytes = serde_json::to_vec_pretty(&next)?;
        self.storage.atomic_write(CHECKPOINT_KEY, &bytes)?;
        self.record = next;
        Ok(())
    }
}

fn parse_record(bytes: &[u8]) -> Result<CheckpointRecord> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::Storage(format!("checkpoint is not utf-8: {e}")))?;
    if text.trim().is_empty() {
        return Ok(CheckpointRecord::default());
    }
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PostId;

    fn id(n: i64) -> SourceMessageId {
        SourceMessageId(n)
    }

    fn memory_store() -> (Arc<MemoryStorage>, CheckpointStore) {
        let storage = Arc::new(MemoryStorage::new());
        let store = CheckpointStore::load(storage.clone());
        (storage, store)
    }

    #[test]
    fn missing_checkpoint_is_none() {
        let (storage, store) = memory_store();
        assert_eq!(store.checkpoint().last_processed_id, None);
        assert_eq!(storage.writes(), 0);
    }

    #[test]
    fn corrupt_checkpoint_degrades_to_none() {
        let storage = Arc::new(MemoryStorage::with_value(CHECKPOINT_KEY, "not-a-json"));
        let store = CheckpointStore::load(storage);
        assert_eq!(store.checkpoint(), Checkpoint::default());
    }

    #[test]
    fn reads_legacy_record() {
        let storage = Arc::new(MemoryStorage::with_value(
            CHECKPOINT_KEY,
            r#"{"last_seen_id": 7}"#,
        ));
        let store = CheckpointStore::load(storage);
        assert_eq!(store.checkpoint().last_processed_id, Some(id(7)));

        let storage = Arc::new(MemoryStorage::with_value(
            CHECKPOINT_KEY,
            r#"{"last_seen_id": 0}"#,
        ));
        assert_eq!(CheckpointStore::load(storage).checkpoint().last_processed_id, None);
    }

    #[test]
    fn commit_is_one_write_and_survives_reload() {
        let (storage, mut store) = memory_store();
        store.commit(id(101)).unwrap();
        assert_eq!(storage.writes(), 1);

        let reloaded = CheckpointStore::load(storage.clone());
        assert_eq!(reloaded.checkpoint().last_processed_id, Some(id(101)));
    }

    #[test]
    fn commit_never_moves_backwards() {
        let (_storage, mut store) = memory_store();
        store.commit(id(102)).unwrap();
        store.commit(id(101)).unwrap();
        assert_eq!(store.checkpoint().last_processed_id, Some(id(102)));
    }

    #[test]
    fn failed_write_keeps_previous_state() {
        let (storage, mut store) = memory_store();
        store.commit(id(100)).unwrap();
        storage.set_fail_writes(true);
        assert!(matches!(store.commit(id(101)), Err(Error::Storage(_))));
        assert_eq!(store.checkpoint().last_processed_id, Some(id(100)));
    }

    #[test]
    fn failures_count_up_and_clear_on_commit() {
        let (_storage, mut store) = memory_store();
        assert_eq!(store.record_failure(id(5), "boom", None).unwrap(), 1);
        assert_eq!(store.record_failure(id(5), "boom", None).unwrap(), 2);
        assert_eq!(store.failure_count(id(5)), 2);

        store.commit(id(5)).unwrap();
        assert_eq!(store.failure_count(id(5)), 0);
    }

    #[test]
    fn commit_drops_failures_at_or_below_the_checkpoint() {
        let (storage, mut store) = memory_store();
        store.record_failure(id(5), "gone from the source", None).unwrap();
        store.record_failure(id(9), "down", None).unwrap();

        store.commit(id(7)).unwrap();
        assert_eq!(store.failure_count(id(5)), 0);
        assert_eq!(store.failure_count(id(9)), 1);

        let reloaded = CheckpointStore::load(storage.clone());
        assert!(!reloaded.record().failures.contains_key(&id(5)));
        assert_eq!(reloaded.record().failures.len(), 1);
    }

    #[test]
    fn debug_shows_the_record() {
        let (_storage, mut store) = memory_store();
        store.commit(id(42)).unwrap();
        let shown = format!("{store:?}");
        assert!(shown.starts_with("CheckpointStore"));
        assert!(shown.contains("last_processed_id"));
    }

    #[test]
    fn partial_thread_is_kept_until_replaced() {
        let (_storage, mut store) = memory_store();
        let partial = PartialThread {
            posted: vec![PostId("t1".into())],
            segments: vec!["a".into(), "b".into()],
        };
        store
            .record_failure(id(9), "post 2 failed", Some(partial.clone()))
            .unwrap();
        store.record_failure(id(9), "refresh failed", None).unwrap();
        assert_eq!(store.partial_thread(id(9)), Some(&partial));
    }

    #[test]
    fn deferred_success_is_absorbed_by_later_commit() {
        let (_storage, mut store) = memory_store();
        store.record_failure(id(101), "down", None).unwrap();
        store.defer(id(102)).unwrap();
        assert!(store.is_completed_ahead(id(102)));
        assert_eq!(store.checkpoint().last_processed_id, None);

        store.commit(id(101)).unwrap();
        assert!(store.is_completed_ahead(id(102)));
        store.commit(id(102)).unwrap();
        assert!(!store.is_completed_ahead(id(102)));
        assert_eq!(store.checkpoint().last_processed_id, Some(id(102)));
    }

    #[test]
    fn file_storage_roundtrip_without_temp_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("state"));
        assert_eq!(storage.read(CHECKPOINT_KEY).unwrap(), None);

        storage.atomic_write(CHECKPOINT_KEY, b"{\"last_processed_id\":3}").unwrap();
        storage.atomic_write(CHECKPOINT_KEY, b"{\"last_processed_id\":4}").unwrap();

        let bytes = storage.read(CHECKPOINT_KEY).unwrap().unwrap();
        assert_eq!(bytes, b"{\"last_processed_id\":4}");
        assert!(!dir.path().join("state/checkpoint.json.tmp").exists());
    }

    #[test]
    fn file_backed_store_recovers_from_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("checkpoint.json"), "{\"last_processed").unwrap();
        let storage: Arc<dyn DurableStorage> = Arc::new(FileStorage::new(dir.path()));

        let mut store = CheckpointStore::load(storage.clone());
        assert_eq!(store.checkpoint().last_processed_id, None);
        store.commit(id(42)).unwrap();

        let reloaded = CheckpointStore::load(storage);
        assert_eq!(reloaded.checkpoint().last_processed_id, Some(id(42)));
    }

    #[test]
    fn rejects_path_like_keys() {
        let storage = FileStorage::new("/tmp");
        assert!(storage.atomic_write("../etc/passwd", b"x").is_err());
    }
}
