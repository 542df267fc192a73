//! Clone Store Implementation
//!
//! A caching replica of a store hosted elsewhere on the bus. Reads are
//! served from a local mirror kept current by the master's update stream;
//! a periodic snapshot replaces the mirror wholesale to repair anything the
//! stream missed. Writes are forwarded exactly like a frontend's.

use futures::future::OptionFuture;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};

use super::frontend::Frontend;
use super::protocol::Message;
use super::response_queue::{Reply, Waiter};
use crate::bus::{Envelope, Subscription};
use crate::data::Data;
use crate::error::Result;
use crate::store::{MemoryStore, Operation, Sequence, Snapshot, StoreHandle};

/// Most updates buffered while waiting for a snapshot
const MAX_PENDING_UPDATES: usize = 65_536;

const MIN_RESYNC_INTERVAL: Duration = Duration::from_millis(1);

/// Replication state of a clone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneState {
    /// Mirror empty, no snapshot requested yet
    Bootstrapping,
    /// First snapshot requested
    InitialSync,
    /// Applying incremental updates
    Steady,
    /// Snapshot requested to repair or refresh the mirror
    Resyncing,
}

/// Result of feeding one update to the mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Applied (along with any buffered successors)
    Applied,
    /// Already reflected in the mirror
    Duplicate,
    /// Held until the outstanding snapshot arrives
    Buffered,
    /// Sequence gap detected; a resync is needed
    Gap,
}

/// Local mirror plus the bookkeeping that keeps it convergent
#[derive(Debug)]
pub struct Replica {
    store: MemoryStore,
    last_sequence: Sequence,
    state: CloneState,
    /// Updates received out of order or during a sync
    pending: BTreeMap<Sequence, Operation>,
}

impl Default for Replica {
    fn default() -> Self {
        Self {
            store: MemoryStore::new(),
            last_sequence: 0,
            state: CloneState::Bootstrapping,
            pending: BTreeMap::new(),
        }
    }
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CloneState {
        self.state
    }

    /// Sequence of the last update reflected in the mirror
    pub fn last_sequence(&self) -> Sequence {
        self.last_sequence
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Feed one update from the stream
    pub fn apply_update(&mut self, sequence: Sequence, operation: Operation) -> UpdateOutcome {
        let synced = matches!(self.state, CloneState::Steady | CloneState::Resyncing);
        if synced && sequence <= self.last_sequence {
            return UpdateOutcome::Duplicate;
        }

        if self.pending.len() >= MAX_PENDING_UPDATES {
            // The next snapshot covers whatever is discarded here
            tracing::warn!("Update buffer full at sequence {}, discarding", sequence);
            self.pending.clear();
        }
        self.pending.insert(sequence, operation);

        if self.state != CloneState::Steady {
            return UpdateOutcome::Buffered;
        }

        let before = self.last_sequence;
        self.drain_pending();
        if !self.pending.is_empty() {
            UpdateOutcome::Gap
        } else if self.last_sequence > before {
            UpdateOutcome::Applied
        } else {
            UpdateOutcome::Duplicate
        }
    }

    /// Record that a snapshot has been requested
    pub fn begin_sync(&mut self) {
        self.state = match self.state {
            CloneState::Bootstrapping | CloneState::InitialSync => CloneState::InitialSync,
            CloneState::Steady | CloneState::Resyncing => CloneState::Resyncing,
        };
    }

    /// Give up on the outstanding snapshot
    pub fn abandon_sync(&mut self) {
        self.state = match self.state {
            CloneState::Bootstrapping | CloneState::InitialSync => CloneState::Bootstrapping,
            CloneState::Steady | CloneState::Resyncing => CloneState::Steady,
        };
        if self.state == CloneState::Steady {
            self.drain_pending();
        }
    }

    /// Replace the mirror with a snapshot, then replay buffered updates
    ///
    /// The snapshot is authoritative even when its sequence is below the
    /// mirror's, which happens when the store is hosted anew. Returns false
    /// if a gap remains after the replay.
    pub fn install(&mut self, snapshot: Snapshot) -> bool {
        if snapshot.sequence < self.last_sequence {
            tracing::info!(
                "Sequence went back from {} to {}, master restarted",
                self.last_sequence,
                snapshot.sequence
            );
        }
        self.store.replace(snapshot.entries);
        self.last_sequence = snapshot.sequence;

        self.state = CloneState::Steady;
        self.drain_pending();
        self.pending.is_empty()
    }

    /// Apply buffered updates that directly follow the mirror
    fn drain_pending(&mut self) {
        let last = self.last_sequence;
        self.pending.retain(|sequence, _| *sequence > last);

        while let Some(operation) = self.pending.remove(&(self.last_sequence + 1)) {
            self.store.apply(&operation);
            self.last_sequence += 1;
        }
    }
}

/// Caching replica of a remote store
pub struct StoreClone {
    frontend: Frontend,
    replica: Arc<RwLock<Replica>>,
    resync_tx: mpsc::UnboundedSender<()>,
    shutdown: watch::Sender<bool>,
}

impl StoreClone {
    /// Start replicating; `updates` must already be subscribed to the update topic
    pub(crate) fn spawn(frontend: Frontend, updates: Subscription, resync_interval: Duration) -> Self {
        let replica = Arc::new(RwLock::new(Replica::new()));
        let (resync_tx, resync_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = ReplicationTask {
            frontend: frontend.clone(),
            replica: Arc::clone(&replica),
            updates,
            resync_rx,
            shutdown: shutdown_rx,
            resync_interval,
            inflight: None,
        };
        tokio::spawn(task.run());

        Self {
            frontend,
            replica,
            resync_tx,
            shutdown,
        }
    }

    /// Get the store name
    pub fn name(&self) -> &str {
        self.frontend.name()
    }

    /// Get the replication state
    pub async fn state(&self) -> CloneState {
        self.replica.read().await.state()
    }

    /// Sequence of the last update reflected in the mirror
    pub async fn last_sequence(&self) -> Sequence {
        self.replica.read().await.last_sequence()
    }

    /// Request a snapshot now instead of waiting for the next tick
    pub fn resync_now(&self) {
        let _ = self.resync_tx.send(());
    }

    /// Stop replicating; the mirror keeps its last contents
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[async_trait::async_trait]
impl StoreHandle for StoreClone {
    async fn insert(&self, key: Data, value: Data) {
        self.frontend.insert(key, value).await;
    }

    async fn erase(&self, key: Data) {
        self.frontend.erase(key).await;
    }

    async fn clear(&self) {
        self.frontend.clear().await;
    }

    async fn lookup(&self, key: &Data) -> Option<Data> {
        self.replica.read().await.store().lookup(key)
    }

    async fn exists(&self, key: &Data) -> bool {
        self.replica.read().await.store().exists(key)
    }

    async fn keys(&self) -> BTreeSet<Data> {
        self.replica.read().await.store().keys()
    }

    async fn size(&self) -> u64 {
        self.replica.read().await.store().size()
    }
}

impl Drop for StoreClone {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Background task that owns every write to the mirror
struct ReplicationTask {
    frontend: Frontend,
    replica: Arc<RwLock<Replica>>,
    updates: Subscription,
    resync_rx: mpsc::UnboundedReceiver<()>,
    shutdown: watch::Receiver<bool>,
    resync_interval: Duration,
    /// Outstanding snapshot request and when it was sent
    inflight: Option<(Waiter<Reply>, Instant)>,
}

impl ReplicationTask {
    async fn run(mut self) {
        tracing::info!(
            "Clone of {} replicating (resync every {:?})",
            self.frontend.name(),
            self.resync_interval
        );

        // First tick fires immediately and issues the initial sync
        let mut ticker = interval(self.resync_interval.max(MIN_RESYNC_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                envelope = self.updates.recv() => {
                    match envelope {
                        Some(envelope) => self.handle_update(envelope).await,
                        None => break,
                    }
                }
                Some(reply) = OptionFuture::from(self.inflight.as_mut().map(|(waiter, _)| waiter.recv())) => {
                    self.inflight = None;
                    self.handle_snapshot_reply(reply).await;
                }
                _ = ticker.tick() => {
                    self.on_tick().await;
                }
                Some(()) = self.resync_rx.recv() => {
                    if self.inflight.is_none() {
                        self.start_resync().await;
                    }
                }
            }
        }

        tracing::info!("Clone of {} stopped", self.frontend.name());
    }

    async fn handle_update(&mut self, envelope: Envelope) {
        let (sequence, operation) = match Message::decode(&envelope.payload) {
            Ok(Message::Update { store, sequence, operation }) if store == self.frontend.name() => {
                (sequence, operation)
            }
            Ok(Message::Update { .. }) => return,
            Ok(other) => {
                tracing::warn!("Unexpected {} on {}", other.type_name(), envelope.topic);
                return;
            }
            Err(e) => {
                tracing::warn!("Dropping undecodable update on {}: {}", envelope.topic, e);
                return;
            }
        };

        let outcome = self.replica.write().await.apply_update(sequence, operation);
        tracing::trace!("Clone of {} update {}: {:?}", self.frontend.name(), sequence, outcome);

        if outcome == UpdateOutcome::Gap && self.inflight.is_none() {
            let last = self.replica.read().await.last_sequence();
            tracing::warn!(
                "Clone of {} detected gap: received {}, last applied {}",
                self.frontend.name(),
                sequence,
                last
            );
            self.start_resync().await;
        }
    }

    async fn handle_snapshot_reply(&mut self, reply: Result<Reply>) {
        match reply {
            Ok(Reply::Snapshot(snapshot)) => {
                let sequence = snapshot.sequence;
                let complete = self.replica.write().await.install(snapshot);
                tracing::debug!("Clone of {} installed snapshot at {}", self.frontend.name(), sequence);
                if !complete {
                    tracing::warn!(
                        "Clone of {} still has a gap after snapshot {}, resyncing",
                        self.frontend.name(),
                        sequence
                    );
                    self.start_resync().await;
                }
            }
            Ok(Reply::Failed(e)) => {
                tracing::warn!("Snapshot of {} refused: {}", self.frontend.name(), e.message);
                self.replica.write().await.abandon_sync();
            }
            Ok(Reply::Answer(answer)) => {
                tracing::warn!("Unexpected answer to snapshot request: {:?}", answer);
                self.replica.write().await.abandon_sync();
            }
            Err(e) => {
                tracing::warn!("Snapshot of {} failed: {}", self.frontend.name(), e);
                self.replica.write().await.abandon_sync();
            }
        }
    }

    async fn on_tick(&mut self) {
        if let Some((waiter, sent)) = &self.inflight {
            if sent.elapsed() < self.frontend.timeout() {
                return;
            }
            match waiter.take_fallback() {
                Some(Reply::Failed(e)) => {
                    tracing::warn!("Snapshot of {} refused: {}, retrying", self.frontend.name(), e.message);
                }
                _ => tracing::warn!(
                    "Snapshot request {} for {} timed out, retrying",
                    waiter.id(),
                    self.frontend.name()
                ),
            }
            self.inflight = None;
            self.replica.write().await.abandon_sync();
        }
        self.start_resync().await;
    }

    async fn start_resync(&mut self) {
        self.replica.write().await.begin_sync();
        match self.frontend.request_snapshot() {
            Ok(waiter) => {
                tracing::trace!("Clone of {} requested snapshot {}", self.frontend.name(), waiter.id());
                self.inflight = Some((waiter, Instant::now()));
            }
            Err(e) => {
                tracing::warn!("Failed to request snapshot of {}: {}", self.frontend.name(), e);
                self.replica.write().await.abandon_sync();
            }
        }
    }
}
