//! Durable state for the sync queue, delta log and mirror cache

use crate::cache::CacheSnapshot;
use crate::delta::DeltaTracker;
use crate::error::{SyncError, SyncResult};
use crate::program::Selection;
use crate::types::SyncOperation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::*;

const STATE_FILE: &str = "state.json";

/// Everything the coordinator needs to resume after a restart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub selection: Option<Selection>,
    pub local: BTreeMap<String, Value>,
    pub cache: CacheSnapshot,
    pub queue: Vec<SyncOperation>,
    pub tracker: DeltaTracker,
}

pub trait StateStore: Send + Sync {
    fn load(&self) -> SyncResult<Option<PersistedState>>;
    fn save(&self, state: &PersistedState) -> SyncResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<Option<PersistedState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(operation: &str) -> SyncError {
    SyncError::Storage {
        operation: operation.to_string(),
        reason: "state lock poisoned".to_string(),
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> SyncResult<Option<PersistedState>> {
        Ok(self.state.lock().map_err(|_| poisoned("load"))?.clone())
    }

    fn save(&self, state: &PersistedState) -> SyncResult<()> {
        *self.state.lock().map_err(|_| poisoned("save"))? = Some(state.clone());
        Ok(())
    }
}

/// JSON document under a data directory, replaced atomically on every save
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn open(dir: impl AsRef<Path>) -> SyncResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| SyncError::Storage {
            operation: "open".to_string(),
            reason: format!("{}: {e}", dir.display()),
        })?;
        info!(dir = %dir.display(), "Using file-backed sync state");
        Ok(Self { dir })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> SyncResult<Option<PersistedState>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let state = serde_json::from_slice(&bytes).map_err(|e| SyncError::Storage {
            operation: "load".to_string(),
            reason: format!("{}: {e}", path.display()),
        })?;
        Ok(Some(state))
    }

    fn save(&self, state: &PersistedState) -> SyncResult<()> {
        let path = self.path();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        fs::rename(&tmp, &path)?;
        trace!(path = %path.display(), "Sync state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MirrorCache;
    use crate::program::TrainingLevel;
    use crate::types::{DeltaChange, SyncPriority};
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_state() -> PersistedState {
        let mut cache = MirrorCache::new();
        cache.apply(&DeltaChange::upsert("progress.current_week", json!(4), false, 10));
        let mut tracker = DeltaTracker::new();
        tracker.record(DeltaChange::upsert("progress.current_week", json!(5), true, 20));

        PersistedState {
            selection: Some(Selection::new(TrainingLevel::Advanced, 4).unwrap()),
            local: [("progress.current_week".to_string(), json!(5))].into_iter().collect(),
            cache: cache.snapshot().clone(),
            queue: vec![SyncOperation::new("complete_session", json!("w01d1"), SyncPriority::UserProgress, 30)],
            tracker,
        }
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let state = sample_state();

        let store = JsonFileStore::open(dir.path()).unwrap();
        assert_eq!(store.load().unwrap(), None);
        store.save(&state).unwrap();

        let reopened = JsonFileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load().unwrap(), Some(state));
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_a_storage_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(STATE_FILE), b"{not json").unwrap();
        let err = JsonFileStore::open(dir.path()).unwrap().load().unwrap_err();
        assert_eq!(err.category(), "storage");
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.load().unwrap(), None);
        let state = sample_state();
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), Some(state));
    }
}
