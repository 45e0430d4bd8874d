//! Per-process registries for broadcast variables and accumulators.
//!
//! Both registries are owned by the worker session. Broadcast variables live
//! for the whole process and are shared by every task it runs; accumulators
//! are cleared at the start of each task.

use crate::error::{Result, WorkerError};
use std::cell::OnceCell;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::{debug, trace};

/// A broadcast value, read from its file the first time it is used.
#[derive(Debug)]
pub struct Broadcast {
    id: i64,
    path: PathBuf,
    value: OnceCell<serde_json::Value>,
}

impl Broadcast {
    pub fn new(id: i64, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
            value: OnceCell::new(),
        }
    }

    /// The broadcast value, loading it on first access.
    pub fn value(&self) -> Result<&serde_json::Value> {
        if let Some(value) = self.value.get() {
            return Ok(value);
        }
        let value = self.load()?;
        Ok(self.value.get_or_init(|| value))
    }

    fn load(&self) -> Result<serde_json::Value> {
        let err = |message: String| WorkerError::Broadcast {
            id: self.id,
            path: self.path.display().to_string(),
            message,
        };
        let raw = std::fs::read(&self.path).map_err(|e| err(e.to_string()))?;
        debug!(id = self.id, bytes = raw.len(), "Loaded broadcast variable");
        serde_json::from_slice(&raw).map_err(|e| err(e.to_string()))
    }
}

/// Broadcast variables known to this worker process.
#[derive(Debug, Default)]
pub struct BroadcastRegistry {
    entries: HashMap<i64, Broadcast>,
}

impl BroadcastRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a broadcast variable.
    pub fn insert(&mut self, id: i64, path: impl Into<PathBuf>) {
        trace!(id, "Registering broadcast variable");
        self.entries.insert(id, Broadcast::new(id, path));
    }

    /// Remove a broadcast variable. Unknown ids are ignored.
    pub fn remove(&mut self, id: i64) -> bool {
        let removed = self.entries.remove(&id).is_some();
        if !removed {
            debug!(id, "Ignoring removal of unknown broadcast variable");
        }
        removed
    }

    /// Apply one entry of the handshake's broadcast list.
    ///
    /// Non-negative ids carry a path and register the variable; a negative
    /// id `-(id + 1)`, the bitwise complement of `id`, removes variable `id`.
    pub fn apply(&mut self, wire_id: i64, path: Option<String>) -> Result<()> {
        if wire_id >= 0 {
            let path = path.ok_or_else(|| {
                WorkerError::protocol(format!("broadcast {} sent without a path", wire_id))
            })?;
            self.insert(wire_id, path);
        } else {
            self.remove(!wire_id);
        }
        Ok(())
    }

    pub fn get(&self, id: i64) -> Option<&Broadcast> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Accumulator values updated by the running task.
///
/// Iteration order is ascending by key, which is also the order the values
/// are flushed back to the orchestrator.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AccumulatorRegistry {
    values: BTreeMap<i32, serde_json::Value>,
}

impl AccumulatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Add a number to an accumulator, starting from zero.
    ///
    /// Integers stay integers while both sides are integers.
    pub fn add(&mut self, key: i32, delta: impl Into<serde_json::Number>) -> Result<()> {
        let delta = delta.into();
        let slot = self
            .values
            .entry(key)
            .or_insert_with(|| serde_json::Value::from(0));
        let current = slot
            .as_number()
            .cloned()
            .ok_or_else(|| WorkerError::task(format!("accumulator {} is not numeric", key)))?;

        let sum = match (current.as_i64(), delta.as_i64()) {
            (Some(a), Some(b)) => a.checked_add(b).map(serde_json::Value::from),
            _ => None,
        };
        *slot = match sum {
            Some(sum) => sum,
            None => {
                let a = current.as_f64().unwrap_or_default();
                let b = delta.as_f64().unwrap_or_default();
                serde_json::Value::from(a + b)
            }
        };
        Ok(())
    }

    #[allow(dead_code)] // Read access for registered task functions
    pub fn get(&self, key: i32) -> Option<&serde_json::Value> {
        self.values.get(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&i32, &serde_json::Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Serialized `(key, value)` pair as flushed at the end of a task.
    pub fn encode_entry(key: i32, value: &serde_json::Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&(key, value))?)
    }
}
