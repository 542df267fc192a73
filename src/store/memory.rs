//! In-memory Store
//!
//! The plain key/value mapping used as the master's authoritative copy and
//! as each clone's mirror. It does no locking of its own.

use std::collections::{BTreeMap, BTreeSet};

use super::operation::{Operation, Sequence, Snapshot};
use crate::data::Data;

/// In-memory key/value mapping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStore {
    entries: BTreeMap<Data, Data>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a key
    pub fn insert(&mut self, key: Data, value: Data) {
        self.entries.insert(key, value);
    }

    /// Remove a key; absent keys are ignored
    pub fn erase(&mut self, key: &Data) {
        self.entries.remove(key);
    }

    /// Remove every key
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn lookup(&self, key: &Data) -> Option<Data> {
        self.entries.get(key).cloned()
    }

    pub fn exists(&self, key: &Data) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> BTreeSet<Data> {
        self.entries.keys().cloned().collect()
    }

    pub fn size(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Borrow the full mapping
    pub fn entries(&self) -> &BTreeMap<Data, Data> {
        &self.entries
    }

    /// Apply a mutation
    pub fn apply(&mut self, operation: &Operation) {
        match operation {
            Operation::Insert { key, value } => self.insert(key.clone(), value.clone()),
            Operation::Erase { key } => self.erase(key),
            Operation::Clear => self.clear(),
        }
    }

    /// Capture the current contents tagged with a sequence number
    pub fn snapshot(&self, sequence: Sequence) -> Snapshot {
        Snapshot {
            sequence,
            entries: self.entries.clone(),
        }
    }

    /// Replace the contents wholesale
    pub fn replace(&mut self, entries: BTreeMap<Data, Data>) {
        self.entries = entries;
    }
}
