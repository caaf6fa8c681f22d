//! Persistence of per-device sync progress.
//!
//! The state file is a small JSON document, one entry per device:
//!
//! ```text
//! {
//!   "schema_version": 1,
//!   "devices": {
//!     "dev-1": { "last_synced_at": "2020-01-01T12:00:00Z" }
//!   }
//! }
//! ```
//!
//! Saves go through write-temp, fsync, rename, fsync-dir so a crash leaves either the
//! old snapshot or the new one on disk.

use crate::errors::StateError;
use crate::model::{SyncState, SyncStateMap};
use crate::BoxFuture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub const SCHEMA_VERSION: u32 = 1;

pub type StateResult<T> = std::result::Result<T, StateError>;

/// Loads and saves the full sync state snapshot.
pub trait StateStore: Send + Sync {
    /// Returns every persisted device state, or an empty map when nothing was saved yet.
    fn load(&self) -> BoxFuture<'_, SyncStateMap, StateError>;

    /// Replaces the persisted snapshot with `state`, atomically.
    fn save<'a>(&'a self, state: &'a SyncStateMap) -> BoxFuture<'a, (), StateError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    schema_version: u32,
    devices: BTreeMap<String, PersistedDevice>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedDevice {
    last_synced_at: DateTime<Utc>,
}

impl From<&SyncStateMap> for PersistedState {
    fn from(state: &SyncStateMap) -> Self {
        let devices = state
            .iter()
            .map(|(id, s)| {
                (
                    id.clone(),
                    PersistedDevice {
                        last_synced_at: s.last_synced_at,
                    },
                )
            })
            .collect();
        Self {
            schema_version: SCHEMA_VERSION,
            devices,
        }
    }
}

/// Serializes state to the on-disk representation.
pub fn encode_state(state: &SyncStateMap) -> serde_json::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(&PersistedState::from(state))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parses the on-disk representation. `path` is only used for error context.
pub fn decode_state(path: &Path, bytes: &[u8]) -> StateResult<SyncStateMap> {
    let persisted: PersistedState =
        serde_json::from_slice(bytes).map_err(|e| StateError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if persisted.schema_version != SCHEMA_VERSION {
        return Err(StateError::Corrupt {
            path: path.to_path_buf(),
            reason: format!(
                "schema version mismatch: expected {}, got {}",
                SCHEMA_VERSION, persisted.schema_version
            ),
        });
    }

    Ok(persisted
        .devices
        .into_iter()
        .map(|(id, d)| (id, SyncState::new(d.last_synced_at)))
        .collect())
}

/// State kept in a JSON file on the local filesystem.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    path: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".tmp");
        PathBuf::from(name)
    }

    async fn load_inner(&self) -> StateResult<SyncStateMap> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No state file yet, starting fresh");
                return Ok(SyncStateMap::new());
            }
            Err(source) => {
                return Err(StateError::ReadFailed {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let state = decode_state(&self.path, &bytes)?;
        info!(
            path = %self.path.display(),
            devices = state.len(),
            "Loaded sync state"
        );
        Ok(state)
    }

    async fn save_inner(&self, state: &SyncStateMap) -> StateResult<()> {
        let write_failed = |source| StateError::WriteFailed {
            path: self.path.clone(),
            source,
        };

        let bytes = encode_state(state)
            .map_err(|e| write_failed(std::io::Error::new(ErrorKind::InvalidData, e)))?;

        if let Some(parent) = non_empty_parent(&self.path) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(write_failed)?;
        }

        let tmp_path = self.tmp_path();
        {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .await
                .map_err(write_failed)?;
            file.write_all(&bytes).await.map_err(write_failed)?;
            file.sync_all().await.map_err(write_failed)?;
        }

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(write_failed)?;

        // The rename itself is only durable once the directory entry is flushed.
        let dir = non_empty_parent(&self.path).unwrap_or_else(|| Path::new("."));
        let dir = tokio::fs::File::open(dir).await.map_err(write_failed)?;
        dir.sync_all().await.map_err(write_failed)?;

        debug!(path = %self.path.display(), devices = state.len(), "Saved sync state");
        Ok(())
    }
}

fn non_empty_parent(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

impl StateStore for JsonFileStateStore {
    fn load(&self) -> BoxFuture<'_, SyncStateMap, StateError> {
        Box::pin(self.load_inner())
    }

    fn save<'a>(&'a self, state: &'a SyncStateMap) -> BoxFuture<'a, (), StateError> {
        Box::pin(self.save_inner(state))
    }
}

/// In-process state store. Holds the snapshot last saved, and counts saves.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    state: SyncStateMap,
    saves: usize,
    fail_saves: bool,
}

impl MemoryStateStore {
    pub fn new(state: SyncStateMap) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                state,
                ..Default::default()
            }),
        }
    }

    /// Make every subsequent `save` fail with `StateWriteFailed`.
    pub fn fail_saves(&self, fail: bool) {
        self.lock().fail_saves = fail;
    }

    pub fn snapshot(&self) -> SyncStateMap {
        self.lock().state.clone()
    }

    pub fn save_count(&self) -> usize {
        self.lock().saves
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> BoxFuture<'_, SyncStateMap, StateError> {
        let state = self.snapshot();
        Box::pin(async move { Ok(state) })
    }

    fn save<'a>(&'a self, state: &'a SyncStateMap) -> BoxFuture<'a, (), StateError> {
        Box::pin(async move {
            let mut inner = self.lock();
            if inner.fail_saves {
                return Err(StateError::WriteFailed {
                    path: PathBuf::from("<memory>"),
                    source: std::io::Error::new(ErrorKind::Other, "injected save failure"),
                });
            }
            inner.state = state.clone();
            inner.saves += 1;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn sample_state() -> SyncStateMap {
        let mut state = SyncStateMap::new();
        state.insert(
            "dev-a".into(),
            SyncState::new(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()),
        );
        state.insert(
            "dev-b".into(),
            SyncState::new(
                Utc.with_ymd_and_hms(2021, 6, 30, 23, 59, 59).unwrap()
                    + chrono::Duration::milliseconds(250),
            ),
        );
        state
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = JsonFileStateStore::new(dir.path().join("state.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = JsonFileStateStore::new(dir.path().join("nested/state.json"));
        let state = sample_state();

        store.save(&state).await.unwrap();
        assert_eq!(store.load().await.unwrap(), state);
        assert!(!store.tmp_path().exists());
    }

    #[tokio::test]
    async fn test_save_of_load_is_byte_identical() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = JsonFileStateStore::new(&path);
        store.save(&sample_state()).await.unwrap();
        let before = std::fs::read(&path).unwrap();

        let loaded = store.load().await.unwrap();
        store.save(&loaded).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_file_is_human_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        JsonFileStateStore::new(&path)
            .save(&sample_state())
            .await
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"dev-a\""));
        assert!(text.contains("2020-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{\"schema_version\": 1, \"devices\": {").unwrap();

        let err = JsonFileStateStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_wrong_schema_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{\"schema_version\": 99, \"devices\": {}}").unwrap();

        let err = JsonFileStateStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_failed_save_keeps_previous_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = JsonFileStateStore::new(&path);
        store.save(&sample_state()).await.unwrap();

        // A directory squatting on the temp path makes the write fail.
        std::fs::create_dir(store.tmp_path()).unwrap();
        let mut changed = sample_state();
        changed.remove("dev-a");
        let err = store.save(&changed).await.unwrap_err();
        assert!(matches!(err, StateError::WriteFailed { .. }));

        assert_eq!(store.load().await.unwrap(), sample_state());
    }

    #[test]
    fn test_memory_store_counts_saves() {
        tokio_test::block_on(async {
            let store = MemoryStateStore::default();
            store.save(&sample_state()).await.unwrap();
            assert_eq!(store.save_count(), 1);
            assert_eq!(store.load().await.unwrap(), sample_state());

            store.fail_saves(true);
            assert!(store.save(&SyncStateMap::new()).await.is_err());
            assert_eq!(store.snapshot(), sample_state());
        });
    }
}
