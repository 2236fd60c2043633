// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! State persistence: two interchangeable backends behind one `StateStore`
//! trait, plus the immutable `StateSnapshot` type used for resume.

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

use crate::error::Result;
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An immutable, point-in-time copy of a run's state plus its step cursor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    pub id: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub step_index: usize,
    pub step_id: String,
    pub state: Value,
    pub metadata: Value,
}

impl StateSnapshot {
    /// Monotonic-by-wall-clock-nanoseconds id, unique enough within a run for
    /// lexicographic (and therefore chronological) ordering.
    pub fn new_id() -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        format!("{:020}", nanos)
    }
}

/// Persistence contract consumed by the executor's snapshot policy and the
/// caller-facing `RestoreRun` entry point. Readers may proceed concurrently;
/// writers serialize through whatever lock the backend chooses.
pub trait StateStore: Send + Sync {
    fn get(&self, run_id: &str) -> Result<Option<Value>>;
    fn set(&self, run_id: &str, state: &Value) -> Result<()>;
    fn delete(&self, run_id: &str) -> Result<()>;
    fn list(&self) -> Result<Vec<String>>;

    fn save_snapshot(&self, snapshot: &StateSnapshot) -> Result<()>;
    fn load_snapshot(&self, run_id: &str, snapshot_id: &str) -> Result<Option<StateSnapshot>>;
    fn list_snapshots(&self, run_id: &str) -> Result<Vec<StateSnapshot>>;

    /// Oldest-first trim applied by each backend after `save_snapshot`; kept
    /// as a shared default so neither backend can forget it.
    fn trim_snapshots(&self, run_id: &str, max_snapshots: usize) -> Result<()> {
        let mut snapshots = self.list_snapshots(run_id)?;
        if snapshots.len() <= max_snapshots {
            return Ok(());
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        let overflow = snapshots.len() - max_snapshots;
        for snap in &snapshots[..overflow] {
            self.delete_snapshot(run_id, &snap.id)?;
        }
        Ok(())
    }

    fn delete_snapshot(&self, run_id: &str, snapshot_id: &str) -> Result<()>;
}

/// Stamps `_last_saved` onto a map-shaped state value before persisting.
/// Non-map states pass through unchanged (there is no field to stamp).
pub(crate) fn with_last_saved(state: &Value) -> Value {
    match state {
        Value::Map(map) => {
            let mut stamped = map.clone();
            stamped.insert("_last_saved".to_string(), Value::string(Utc::now().to_rfc3339()));
            Value::Map(stamped)
        }
        other => other.clone(),
    }
}
