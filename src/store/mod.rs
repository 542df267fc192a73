//! Store Module
//!
//! The local key/value store and the uniform handle implemented by
//! masters, frontends and clones.

mod memory;
pub mod operation;

pub use memory::MemoryStore;
pub use operation::{Operation, Sequence, Snapshot};

use std::collections::{BTreeMap, BTreeSet};

use crate::data::Data;

/// Common interface over every kind of store handle
///
/// Masters answer from the authoritative copy, frontends ask the master over
/// the bus, and clones answer from their local mirror. Writes through a
/// frontend or clone are forwarded without acknowledgment.
#[async_trait::async_trait]
pub trait StoreHandle: Send + Sync {
    /// Insert or overwrite a key
    async fn insert(&self, key: Data, value: Data);

    /// Remove a key if present
    async fn erase(&self, key: Data);

    /// Remove every key
    async fn clear(&self);

    /// Look up the value of a key
    async fn lookup(&self, key: &Data) -> Option<Data>;

    /// Check whether a key is present
    async fn exists(&self, key: &Data) -> bool;

    /// Get every key
    async fn keys(&self) -> BTreeSet<Data>;

    /// Get the number of keys
    async fn size(&self) -> u64;

    /// Collect the full contents by looking up every key
    async fn contents(&self) -> BTreeMap<Data, Data> {
        let mut contents = BTreeMap::new();
        for key in self.keys().await {
            if let Some(value) = self.lookup(&key).await {
                contents.insert(key, value);
            }
        }
        contents
    }
}
