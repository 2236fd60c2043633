// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! File-on-disk `StateStore`: `<base>/<runID>.json` holds current state,
//! `<base>/snapshots/<runID>/<snapID>.json` holds each snapshot. Writes go
//! through a `.tmp` sibling and an atomic rename so a crash mid-write never
//! leaves a torn file behind.

use super::{with_last_saved, StateSnapshot, StateStore};
use crate::error::Result;
use crate::value::Value;
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};

pub struct FileStateStore {
    base_dir: PathBuf,
    max_snapshots: usize,
    write_lock: RwLock<()>,
}

impl FileStateStore {
    pub fn new(base_dir: impl Into<PathBuf>, max_snapshots: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_snapshots,
            write_lock: RwLock::new(()),
        }
    }

    fn state_path(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", run_id))
    }

    fn snapshots_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join("snapshots").join(run_id)
    }

    fn snapshot_path(&self, run_id: &str, snapshot_id: &str) -> PathBuf {
        self.snapshots_dir(run_id).join(format!("{}.json", snapshot_id))
    }

    fn write_atomic<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let _guard = self.write_lock.write();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(value)?;
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn get(&self, run_id: &str) -> Result<Option<Value>> {
        let path = self.state_path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn set(&self, run_id: &str, state: &Value) -> Result<()> {
        self.write_atomic(&self.state_path(run_id), &with_last_saved(state))
    }

    fn delete(&self, run_id: &str) -> Result<()> {
        let path = self.state_path(run_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let snap_dir = self.snapshots_dir(run_id);
        if snap_dir.exists() {
            fs::remove_dir_all(&snap_dir)?;
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        Ok(ids)
    }

    fn save_snapshot(&self, snapshot: &StateSnapshot) -> Result<()> {
        self.write_atomic(&self.snapshot_path(&snapshot.run_id, &snapshot.id), snapshot)?;
        self.trim_snapshots(&snapshot.run_id, self.max_snapshots.max(1))
    }

    fn load_snapshot(&self, run_id: &str, snapshot_id: &str) -> Result<Option<StateSnapshot>> {
        let path = self.snapshot_path(run_id, snapshot_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn list_snapshots(&self, run_id: &str) -> Result<Vec<StateSnapshot>> {
        let dir = self.snapshots_dir(run_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                let bytes = fs::read(entry.path())?;
                snapshots.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(snapshots)
    }

    fn delete_snapshot(&self, run_id: &str, snapshot_id: &str) -> Result<()> {
        let path = self.snapshot_path(run_id, snapshot_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips_through_atomic_rename() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path(), 10);
        let state = Value::map_from([("x".to_string(), Value::Int(1))]);
        store.set("run1", &state).unwrap();

        let loaded = store.get("run1").unwrap().unwrap();
        let Value::Map(map) = loaded else { panic!("expected map") };
        assert_eq!(map.get("x"), Some(&Value::Int(1)));
        assert!(map.contains_key("_last_saved"));
        assert!(!dir.path().join("run1.json.tmp").exists());
    }

    #[test]
    fn delete_removes_state_file_and_snapshot_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path(), 10);
        store.set("run1", &Value::Null).unwrap();
        let snap = StateSnapshot {
            id: StateSnapshot::new_id(),
            run_id: "run1".to_string(),
            timestamp: chrono::Utc::now(),
            step_index: 0,
            step_id: "s".to_string(),
            state: Value::Null,
            metadata: Value::Null,
        };
        store.save_snapshot(&snap).unwrap();

        store.delete("run1").unwrap();
        assert!(store.get("run1").unwrap().is_none());
        assert!(store.list_snapshots("run1").unwrap().is_empty());
    }

    #[test]
    fn list_returns_run_ids_from_directory_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path(), 10);
        store.set("run1", &Value::Null).unwrap();
        store.set("run2", &Value::Null).unwrap();
        let mut ids = store.list().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["run1".to_string(), "run2".to_string()]);
    }
}
