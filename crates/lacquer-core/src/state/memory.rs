// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory `StateStore`: a guarded map of run state plus a guarded map of
//! per-run snapshot lists. Used by tests and by callers that don't need
//! durability across process restarts.

use super::{with_last_saved, StateSnapshot, StateStore};
use crate::error::Result;
use crate::value::Value;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<String, Value>>,
    snapshots: RwLock<HashMap<String, Vec<StateSnapshot>>>,
    max_snapshots: usize,
}

impl MemoryStateStore {
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            max_snapshots,
        }
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, run_id: &str) -> Result<Option<Value>> {
        Ok(self.states.read().get(run_id).map(Value::deep_copy))
    }

    fn set(&self, run_id: &str, state: &Value) -> Result<()> {
        self.states.write().insert(run_id.to_string(), with_last_saved(state).deep_copy());
        Ok(())
    }

    fn delete(&self, run_id: &str) -> Result<()> {
        self.states.write().remove(run_id);
        self.snapshots.write().remove(run_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self.states.read().keys().cloned().collect())
    }

    fn save_snapshot(&self, snapshot: &StateSnapshot) -> Result<()> {
        self.snapshots
            .write()
            .entry(snapshot.run_id.clone())
            .or_default()
            .push(snapshot.clone());
        self.trim_snapshots(&snapshot.run_id, self.max_snapshots.max(1))
    }

    fn load_snapshot(&self, run_id: &str, snapshot_id: &str) -> Result<Option<StateSnapshot>> {
        Ok(self
            .snapshots
            .read()
            .get(run_id)
            .and_then(|snaps| snaps.iter().find(|s| s.id == snapshot_id).cloned()))
    }

    fn list_snapshots(&self, run_id: &str) -> Result<Vec<StateSnapshot>> {
        Ok(self.snapshots.read().get(run_id).cloned().unwrap_or_default())
    }

    fn delete_snapshot(&self, run_id: &str, snapshot_id: &str) -> Result<()> {
        if let Some(snaps) = self.snapshots.write().get_mut(run_id) {
            snaps.retain(|s| s.id != snapshot_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn save_then_restore_round_trips_state() {
        let store = MemoryStateStore::new(10);
        let state = Value::map_from([("x".to_string(), Value::Int(1))]);
        store.set("run1", &state).unwrap();

        let snap = StateSnapshot {
            id: StateSnapshot::new_id(),
            run_id: "run1".to_string(),
            timestamp: chrono::Utc::now(),
            step_index: 1,
            step_id: "s1".to_string(),
            state: store.get("run1").unwrap().unwrap(),
            metadata: Value::Null,
        };
        store.save_snapshot(&snap).unwrap();

        store.set("run1", &Value::map_from([("x".to_string(), Value::Int(2))])).unwrap();

        let restored = store.load_snapshot("run1", &snap.id).unwrap().unwrap();
        let Value::Map(map) = restored.state else { panic!("expected map") };
        assert_eq!(map.get("x"), Some(&Value::Int(1)));
    }

    #[test]
    fn trims_snapshots_oldest_first() {
        let store = MemoryStateStore::new(2);
        for i in 0..5 {
            let snap = StateSnapshot {
                id: format!("{:03}", i),
                run_id: "run1".to_string(),
                timestamp: chrono::Utc::now(),
                step_index: i as usize,
                step_id: format!("s{}", i),
                state: Value::Null,
                metadata: Value::Null,
            };
            store.save_snapshot(&snap).unwrap();
        }
        let remaining = store.list_snapshots("run1").unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|s| s.id == "003" || s.id == "004"));
    }

    #[test]
    fn delete_removes_state_and_snapshots() {
        let store = MemoryStateStore::new(10);
        store.set("run1", &Value::Null).unwrap();
        store.delete("run1").unwrap();
        assert!(store.get("run1").unwrap().is_none());
    }
}
