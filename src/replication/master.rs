//! Master Store Implementation
//!
//! Owns the authoritative copy of a store. Every mutation, local or
//! remote, goes through one serialized apply-then-broadcast path so that
//! all subscribers observe a single total order of updates.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use tokio::sync::Mutex;

use super::protocol::{update_topic, Answer, ErrorCode, Message, Query, RemoteError};
use crate::bus::Bus;
use crate::data::Data;
use crate::error::Result;
use crate::store::{MemoryStore, Operation, Sequence, Snapshot, StoreHandle};

/// Type alias for the per-endpoint registry of hosted stores
pub(crate) type MasterRegistry = StdRwLock<std::collections::HashMap<String, Arc<MasterCore>>>;

/// Authoritative state guarded by the single-writer lock
#[derive(Default)]
struct MasterState {
    store: MemoryStore,
    /// Sequence of the last applied operation
    sequence: Sequence,
}

/// Shared master state, reachable from the handle and the request service
pub(crate) struct MasterCore {
    name: String,
    update_topic: String,
    bus: Arc<dyn Bus>,
    state: Mutex<MasterState>,
}

impl MasterCore {
    pub(crate) fn new(name: String, bus: Arc<dyn Bus>) -> Self {
        Self {
            update_topic: update_topic(&name),
            name,
            bus,
            state: Mutex::new(MasterState::default()),
        }
    }

    /// Apply an operation, assign its sequence and broadcast the update
    pub(crate) async fn apply(&self, operation: Operation) -> Sequence {
        let mut state = self.state.lock().await;
        state.store.apply(&operation);
        state.sequence += 1;
        let sequence = state.sequence;

        tracing::debug!(
            "Store {} applied {} at sequence {}",
            self.name,
            operation.kind(),
            sequence
        );

        // Publish while still holding the lock so broadcast order matches apply order
        let update = Message::Update {
            store: self.name.clone(),
            sequence,
            operation,
        };
        if let Err(e) = self.publish(&self.update_topic, &update) {
            tracing::warn!("Store {} failed to broadcast update {}: {}", self.name, sequence, e);
        }

        sequence
    }

    /// Run a read against the authoritative copy
    pub(crate) async fn read<R>(&self, f: impl FnOnce(&MemoryStore) -> R) -> R {
        f(&self.state.lock().await.store)
    }

    /// Answer a read-only query against the authoritative copy
    pub(crate) async fn answer(&self, query: &Query) -> Answer {
        self.read(|store| match query {
            Query::Lookup(key) => Answer::Value(store.lookup(key)),
            Query::Exists(key) => Answer::Exists(store.exists(key)),
            Query::Keys => Answer::Keys(store.keys()),
            Query::Size => Answer::Size(store.size()),
        })
        .await
    }

    /// Capture contents and sequence atomically with respect to mutations
    pub(crate) async fn snapshot(&self) -> Snapshot {
        let state = self.state.lock().await;
        state.store.snapshot(state.sequence)
    }

    pub(crate) async fn sequence(&self) -> Sequence {
        self.state.lock().await.sequence
    }

    /// Handle a request addressed to this store
    pub(crate) async fn handle_request(&self, message: Message) {
        match message {
            Message::Mutation { operation, .. } => {
                self.apply(operation).await;
            }
            Message::Query {
                request_id,
                reply_to,
                query,
                ..
            } => {
                tracing::trace!("Store {} answering {} for {}", self.name, query.kind(), request_id);
                let answer = self.answer(&query).await;
                let response = Message::Response {
                    request_id,
                    result: Ok(answer),
                };
                if let Err(e) = self.publish(&reply_to, &response) {
                    tracing::warn!("Store {} failed to reply to {}: {}", self.name, request_id, e);
                }
            }
            Message::SnapshotRequest {
                request_id,
                reply_to,
                ..
            } => {
                let snapshot = self.snapshot().await;
                tracing::debug!(
                    "Store {} sending snapshot at sequence {} ({} keys)",
                    self.name,
                    snapshot.sequence,
                    snapshot.entries.len()
                );
                let response = Message::Snapshot {
                    request_id,
                    snapshot,
                };
                if let Err(e) = self.publish(&reply_to, &response) {
                    tracing::warn!("Store {} failed to send snapshot: {}", self.name, e);
                }
            }
            other => {
                tracing::warn!(
                    "Store {} ignoring unexpected {} on request topic",
                    self.name,
                    other.type_name()
                );
            }
        }
    }

    fn publish(&self, topic: &str, message: &Message) -> Result<()> {
        let payload = message.encode()?;
        self.bus.publish(topic, payload)
    }
}

/// Build the reply sent when a request names a store nobody hosts
pub(crate) fn not_found(store: &str, message: &Message) -> Option<(String, Message)> {
    match message {
        Message::Query {
            request_id,
            reply_to,
            ..
        }
        | Message::SnapshotRequest {
            request_id,
            reply_to,
            ..
        } => Some((
            reply_to.clone(),
            Message::Response {
                request_id: *request_id,
                result: Err(RemoteError {
                    code: ErrorCode::StoreNotFound,
                    message: store.to_string(),
                }),
            },
        )),
        _ => None,
    }
}

/// Handle to a store hosted on this endpoint
///
/// Local calls act on the authoritative copy directly. Dropping the handle
/// stops hosting the store.
pub struct Master {
    core: Arc<MasterCore>,
    registry: Weak<MasterRegistry>,
}

impl Master {
    pub(crate) fn new(core: Arc<MasterCore>, registry: Weak<MasterRegistry>) -> Self {
        Self { core, registry }
    }

    /// Get the store name
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Get the sequence of the last applied operation
    pub async fn sequence(&self) -> Sequence {
        self.core.sequence().await
    }

    /// Get the current contents tagged with their sequence
    pub async fn snapshot(&self) -> Snapshot {
        self.core.snapshot().await
    }
}

#[async_trait::async_trait]
impl StoreHandle for Master {
    async fn insert(&self, key: Data, value: Data) {
        self.core.apply(Operation::Insert { key, value }).await;
    }

    async fn erase(&self, key: Data) {
        self.core.apply(Operation::Erase { key }).await;
    }

    async fn clear(&self) {
        self.core.apply(Operation::Clear).await;
    }

    async fn lookup(&self, key: &Data) -> Option<Data> {
        self.core.read(|store| store.lookup(key)).await
    }

    async fn exists(&self, key: &Data) -> bool {
        self.core.read(|store| store.exists(key)).await
    }

    async fn keys(&self) -> BTreeSet<Data> {
        self.core.read(MemoryStore::keys).await
    }

    async fn size(&self) -> u64 {
        self.core.read(MemoryStore::size).await
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.write().unwrap_or_else(|e| e.into_inner());
            if registry
                .get(&self.core.name)
                .map_or(false, |core| Arc::ptr_eq(core, &self.core))
            {
                registry.remove(&self.core.name);
                tracing::info!("Stopped hosting store {}", self.core.name);
            }
        }
    }
}
