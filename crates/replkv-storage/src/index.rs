//! In-memory index serving all reads

use parking_lot::RwLock;
use replkv_common::Operation;
use std::collections::HashMap;

/// Concurrent key to value map
///
/// Many readers may hold the lock at once; writers are exclusive.
#[derive(Debug, Default)]
pub struct MemIndex {
    entries: RwLock<HashMap<String, String>>,
}

impl MemIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.write().insert(key.into(), value.into());
    }

    /// Remove a key, returning whether it was present
    pub fn delete(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn apply(&self, op: &Operation) {
        match op {
            Operation::Set { key, value } => self.set(key.as_str(), value.as_str()),
            Operation::Delete { key } => {
                self.delete(key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
