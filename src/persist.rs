// src/persist.rs - Snapshot persistence backends
use crate::error::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

/// Storage backend for engine state snapshots, keyed by id.
pub trait StateStore: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<serde_json::Value>>;
    fn save(&self, id: &str, state: &serde_json::Value) -> Result<()>;
}

/// Volatile store, used in tests and when persistence is not configured.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, id: &str) -> Result<Option<serde_json::Value>> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(entries.get(id).cloned())
    }

    fn save(&self, id: &str, state: &serde_json::Value) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(id.to_string(), state.clone());
        Ok(())
    }
}

/// One JSON file per id under a directory. Writes go through a temp file
/// and rename so a crash mid-write never corrupts the previous snapshot.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

impl StateStore for FileStateStore {
    fn load(&self, id: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        debug!(id, path = %path.display(), "loaded state snapshot");
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save(&self, id: &str, state: &serde_json::Value) -> Result<()> {
        let path = self.path_for(id);
        let tmp = self.dir.join(format!("{}.json.tmp", id));
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, &path)?;
        debug!(id, path = %path.display(), "saved state snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStateStore::new();
        assert!(store.load("engine").unwrap().is_none());
        let state = serde_json::json!({"total": 42.5});
        store.save("engine", &state).unwrap();
        assert_eq!(store.load("engine").unwrap(), Some(state));
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();
        assert!(store.load("engine").unwrap().is_none());

        let state = serde_json::json!({"blocks": {"tot": {"accumulated_value": 10.0}}});
        store.save("engine", &state).unwrap();
        assert_eq!(store.load("engine").unwrap(), Some(state.clone()));

        // Overwrites replace the previous snapshot
        let newer = serde_json::json!({"blocks": {}});
        store.save("engine", &newer).unwrap();
        assert_eq!(store.load("engine").unwrap(), Some(newer));
        assert!(!dir.path().join("engine.json.tmp").exists());
    }
}
