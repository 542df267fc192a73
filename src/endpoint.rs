//! Endpoint
//!
//! One participant on the bus. An endpoint hosts masters, hands out
//! frontends and clones, and runs the background receive paths that
//! demultiplex inbound traffic: a request service for the stores it hosts
//! and a reply loop feeding its response queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::bus::{Bus, Envelope, Subscription};
use crate::config::WolfStoreConfig;
use crate::error::{Error, Result};
use crate::replication::master::{not_found, MasterCore, MasterRegistry};
use crate::replication::protocol::{reply_topic, update_topic, Message, REQUEST_PREFIX};
use crate::replication::{Frontend, Master, Reply, ResponseQueue, StoreClone};

/// A bus participant
///
/// Must be created inside a Tokio runtime. Dropping the endpoint stops its
/// background tasks.
pub struct Endpoint {
    name: String,
    bus: Arc<dyn Bus>,
    inbox: Uuid,
    responses: Arc<ResponseQueue>,
    masters: Arc<MasterRegistry>,
    service_started: AtomicBool,
    query_timeout: Duration,
    resync_interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl Endpoint {
    /// Create an endpoint and start its reply loop
    pub fn new(config: &WolfStoreConfig, bus: Arc<dyn Bus>) -> Self {
        let inbox = Uuid::new_v4();
        let responses = Arc::new(ResponseQueue::new());
        let (shutdown, _) = watch::channel(false);

        let replies = bus.subscribe(&reply_topic(&inbox));
        tokio::spawn(reply_loop(
            config.endpoint.name.clone(),
            replies,
            Arc::clone(&responses),
            shutdown.subscribe(),
        ));

        tracing::info!("Endpoint {} started (inbox {})", config.endpoint.name, inbox);

        Self {
            name: config.endpoint.name.clone(),
            bus,
            inbox,
            responses,
            masters: Arc::new(StdRwLock::new(HashMap::new())),
            service_started: AtomicBool::new(false),
            query_timeout: config.query_timeout(),
            resync_interval: config.resync_interval(),
            shutdown,
        }
    }

    /// Get the endpoint name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host the authoritative copy of a store
    pub fn master(&self, store: &str) -> Result<Master> {
        if *self.shutdown.borrow() {
            return Err(Error::ShuttingDown);
        }

        let core = Arc::new(MasterCore::new(store.to_string(), Arc::clone(&self.bus)));
        {
            let mut masters = self.masters.write().unwrap_or_else(|e| e.into_inner());
            if masters.contains_key(store) {
                return Err(Error::StoreExists(store.to_string()));
            }
            masters.insert(store.to_string(), Arc::clone(&core));
        }

        if !self.service_started.swap(true, Ordering::SeqCst) {
            let requests = self.bus.subscribe(REQUEST_PREFIX);
            tokio::spawn(request_service(
                self.name.clone(),
                requests,
                Arc::clone(&self.bus),
                Arc::clone(&self.masters),
                self.shutdown.subscribe(),
            ));
        }

        tracing::info!("Endpoint {} hosting store {}", self.name, store);
        Ok(Master::new(core, Arc::downgrade(&self.masters)))
    }

    /// Create a remote proxy for a store
    pub fn frontend(&self, store: &str) -> Frontend {
        Frontend::new(
            store.to_string(),
            reply_topic(&self.inbox),
            Arc::clone(&self.bus),
            Arc::clone(&self.responses),
            self.query_timeout,
        )
    }

    /// Create a caching replica using the configured resync interval
    pub fn clone_store(&self, store: &str) -> StoreClone {
        self.clone_store_with_interval(store, self.resync_interval)
    }

    /// Create a caching replica with an explicit resync interval
    pub fn clone_store_with_interval(&self, store: &str, resync_interval: Duration) -> StoreClone {
        // Subscribe before anything else so no update published from here on is missed
        let updates = self.bus.subscribe(&update_topic(store));
        StoreClone::spawn(self.frontend(store), updates, resync_interval)
    }

    /// Get the number of queries awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.responses.pending()
    }

    /// Stop background tasks
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Route replies to waiting requesters
async fn reply_loop(
    endpoint: String,
    mut replies: Subscription,
    responses: Arc<ResponseQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            envelope = replies.recv() => {
                let Some(envelope) = envelope else { break };
                dispatch_reply(&endpoint, envelope, &responses);
            }
        }
    }
    tracing::debug!("Endpoint {} reply loop stopped", endpoint);
}

fn dispatch_reply(endpoint: &str, envelope: Envelope, responses: &ResponseQueue) {
    let message = match Message::decode(&envelope.payload) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Endpoint {} dropping undecodable reply: {}", endpoint, e);
            return;
        }
    };

    let (request_id, delivered) = match message {
        Message::Response { request_id, result: Ok(answer) } => {
            (request_id, responses.deliver(request_id, Reply::Answer(answer)))
        }
        // Every hosting endpoint answers not-found for stores it lacks; the owner's answer must win
        Message::Response { request_id, result: Err(e) } => {
            (request_id, responses.deliver_fallback(request_id, Reply::Failed(e)))
        }
        Message::Snapshot { request_id, snapshot } => {
            (request_id, responses.deliver(request_id, Reply::Snapshot(snapshot)))
        }
        other => {
            tracing::warn!("Endpoint {} ignoring {} on reply topic", endpoint, other.type_name());
            return;
        }
    };

    if !delivered {
        tracing::debug!("Endpoint {} got late or unknown reply {}", endpoint, request_id);
    }
}

/// Serve requests for every store hosted on this endpoint
async fn request_service(
    endpoint: String,
    mut requests: Subscription,
    bus: Arc<dyn Bus>,
    masters: Arc<MasterRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!("Endpoint {} request service started", endpoint);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            envelope = requests.recv() => {
                let Some(envelope) = envelope else { break };
                handle_request(&endpoint, envelope, bus.as_ref(), &masters).await;
            }
        }
    }
    tracing::debug!("Endpoint {} request service stopped", endpoint);
}

async fn handle_request(endpoint: &str, envelope: Envelope, bus: &dyn Bus, masters: &MasterRegistry) {
    let message = match Message::decode(&envelope.payload) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Endpoint {} dropping undecodable request: {}", endpoint, e);
            return;
        }
    };

    let store = match &message {
        Message::Mutation { store, .. }
        | Message::Query { store, .. }
        | Message::SnapshotRequest { store, .. } => store.clone(),
        other => {
            tracing::warn!("Endpoint {} ignoring {} on request topic", endpoint, other.type_name());
            return;
        }
    };

    let master = masters
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(&store)
        .cloned();

    match master {
        Some(master) => master.handle_request(message).await,
        None => {
            tracing::debug!("Endpoint {} has no store {}", endpoint, store);
            if let Some((reply_to, reply)) = not_found(&store, &message) {
                let sent = reply.encode().and_then(|payload| bus.publish(&reply_to, payload));
                if let Err(e) = sent {
                    tracing::warn!("Endpoint {} failed to send not-found reply: {}", endpoint, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DeliveryFilter, LocalBus};
    use crate::data::Data;
    use crate::replication::CloneState;
    use crate::store::StoreHandle;
    use bytes::Bytes;
    use rand::Rng;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU64;
    use std::time::Instant;

    const RESYNC: Duration = Duration::from_millis(50);

    type Dataset = BTreeMap<Data, Data>;

    fn config(name: &str) -> WolfStoreConfig {
        let mut config = WolfStoreConfig::for_endpoint(name);
        config.store.query_timeout_ms = 1000;
        config.store.resync_interval_ms = RESYNC.as_millis() as u64;
        config
    }

    fn pair(key: &str, value: &str) -> (Data, Data) {
        (key.into(), value.into())
    }

    fn ds0() -> Dataset {
        [pair("1", "one"), pair("2", "two"), pair("3", "three")].into_iter().collect()
    }

    /// Poll until `store` holds exactly `expected`
    async fn converges(store: &dyn StoreHandle, expected: &Dataset) -> bool {
        converges_within(store, expected, Duration::from_secs(5)).await
    }

    async fn converges_within(store: &dyn StoreHandle, expected: &Dataset, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if &store.contents().await == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    async fn wait_for(store: &dyn StoreHandle, key: &Data, exists: bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if store.exists(key).await == exists {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        false
    }

    struct Fixture {
        bus: LocalBus,
        _server: Endpoint,
        client: Endpoint,
        master: Master,
    }

    async fn fixture() -> Fixture {
        let bus = LocalBus::new();
        let server = Endpoint::new(&config("server"), Arc::new(bus.clone()));
        let client = Endpoint::new(&config("client"), Arc::new(bus.clone()));
        let master = server.master("mystore").unwrap();
        for (k, v) in ds0() {
            master.insert(k, v).await;
        }
        Fixture {
            bus,
            _server: server,
            client,
            master,
        }
    }

    #[tokio::test]
    async fn test_master_local_access() {
        let f = fixture().await;
        assert_eq!(f.master.lookup(&"1".into()).await, Some("one".into()));
        assert_eq!(f.master.size().await, 3);
        assert_eq!(f.master.contents().await, ds0());
        assert_eq!(f.master.sequence().await, 3);
    }

    #[tokio::test]
    async fn test_frontend_and_clone_attach() {
        let f = fixture().await;
        let frontend = f.client.frontend("mystore");
        let clone = f.client.clone_store("mystore");

        assert_eq!(frontend.contents().await, ds0());
        assert!(converges(&clone, &ds0()).await);
        assert_eq!(clone.state().await, CloneState::Steady);
        assert_eq!(clone.last_sequence().await, 3);
    }

    #[tokio::test]
    async fn test_master_insert_then_erase() {
        let f = fixture().await;
        let frontend = f.client.frontend("mystore");
        let clone = f.client.clone_store("mystore");
        assert!(converges(&clone, &ds0()).await);

        f.master.insert("5".into(), "five".into()).await;
        assert_eq!(f.master.lookup(&"5".into()).await, Some("five".into()));
        assert_eq!(frontend.contents().await, f.master.contents().await);
        assert!(converges(&clone, &f.master.contents().await).await);

        f.master.erase("5".into()).await;
        assert!(!f.master.exists(&"5".into()).await);
        assert_eq!(frontend.contents().await, ds0());
        assert!(converges(&clone, &ds0()).await);
        assert!(!clone.exists(&"5".into()).await);
    }

    #[tokio::test]
    async fn test_frontend_writes_reach_master() {
        let f = fixture().await;
        let frontend = f.client.frontend("mystore");
        let clone = f.client.clone_store("mystore");

        frontend.insert("5".into(), "five".into()).await;
        assert!(wait_for(&f.master, &"5".into(), true).await);
        assert_eq!(frontend.contents().await, f.master.contents().await);
        assert!(converges(&clone, &f.master.contents().await).await);

        frontend.erase("5".into()).await;
        assert!(wait_for(&f.master, &"5".into(), false).await);
        assert!(converges(&clone, &ds0()).await);
    }

    #[tokio::test]
    async fn test_clone_writes_reach_master() {
        let f = fixture().await;
        let clone = f.client.clone_store("mystore");
        assert!(converges(&clone, &ds0()).await);

        clone.insert("5".into(), "five".into()).await;
        assert!(wait_for(&f.master, &"5".into(), true).await);
        assert!(wait_for(&clone, &"5".into(), true).await);

        clone.erase("5".into()).await;
        assert!(wait_for(&f.master, &"5".into(), false).await);
        assert!(converges(&clone, &ds0()).await);
    }

    #[tokio::test]
    async fn test_master_clear_propagates() {
        let f = fixture().await;
        let frontend = f.client.frontend("mystore");
        let clone = f.client.clone_store("mystore");
        assert!(converges(&clone, &ds0()).await);

        f.master.clear().await;
        assert_eq!(f.master.size().await, 0);
        assert_eq!(frontend.size().await, 0);
        assert!(converges(&clone, &Dataset::new()).await);
    }

    #[tokio::test]
    async fn test_unknown_store_reports_not_found() {
        let f = fixture().await;
        let frontend = f.client.frontend("nosuch");
        assert!(matches!(
            frontend.try_size().await,
            Err(Error::StoreNotFound(name)) if name == "nosuch"
        ));
        assert_eq!(frontend.size().await, 0);
    }

    #[tokio::test]
    async fn test_query_without_master_times_out() {
        let bus = LocalBus::new();
        let client = Endpoint::new(&config("client"), Arc::new(bus));
        let frontend = client.frontend("mystore").with_timeout(Duration::from_millis(30));

        assert!(matches!(frontend.try_keys().await, Err(Error::Timeout(_))));
        assert!(frontend.lookup(&"1".into()).await.is_none());
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_master_rejected() {
        let f = fixture().await;
        assert!(matches!(f._server.master("mystore"), Err(Error::StoreExists(_))));
        assert!(f._server.master("other").is_ok());
    }

    #[tokio::test]
    async fn test_dropped_master_stops_serving() {
        let bus = LocalBus::new();
        let server = Endpoint::new(&config("server"), Arc::new(bus.clone()));
        let client = Endpoint::new(&config("client"), Arc::new(bus));
        let master = server.master("mystore").unwrap();
        let frontend = client.frontend("mystore");
        assert_eq!(frontend.try_size().await.unwrap(), 0);

        drop(master);
        assert!(matches!(frontend.try_size().await, Err(Error::StoreNotFound(_))));
    }

    #[tokio::test]
    async fn test_clone_follows_rehosted_store() {
        let bus = LocalBus::new();
        let server = Endpoint::new(&config("server"), Arc::new(bus.clone()));
        let client = Endpoint::new(&config("client"), Arc::new(bus));
        let master = server.master("mystore").unwrap();
        for i in 0..3u64 {
            master.insert(Data::Count(i), Data::Count(i)).await;
        }

        let clone = client.clone_store("mystore");
        assert!(converges(&clone, &master.contents().await).await);
        assert_eq!(clone.last_sequence().await, 3);

        // A fresh master starts counting from zero again
        drop(master);
        let master = server.master("mystore").unwrap();
        master.insert("x".into(), "y".into()).await;

        assert!(converges(&clone, &[pair("x", "y")].into_iter().collect()).await);
        assert_eq!(clone.last_sequence().await, 1);
    }

    #[tokio::test]
    async fn test_stores_on_separate_endpoints() {
        let bus = LocalBus::new();
        let a = Endpoint::new(&config("a"), Arc::new(bus.clone()));
        let b = Endpoint::new(&config("b"), Arc::new(bus.clone()));
        let client = Endpoint::new(&config("client"), Arc::new(bus));

        let store_a = a.master("store_a").unwrap();
        let store_b = b.master("store_b").unwrap();
        store_a.insert("a".into(), "1".into()).await;
        store_b.insert("b".into(), "2".into()).await;

        // Each hosting endpoint replies not-found for the other's store
        let frontend_a = client.frontend("store_a");
        let frontend_b = client.frontend("store_b");
        for _ in 0..20 {
            assert_eq!(frontend_a.try_size().await.unwrap(), 1);
            assert_eq!(frontend_b.try_size().await.unwrap(), 1);
        }
        assert_eq!(frontend_b.try_lookup(&"b".into()).await.unwrap(), Some("2".into()));

        let clone_b = client.clone_store("store_b");
        assert!(converges(&clone_b, &store_b.contents().await).await);

        assert!(matches!(
            client.frontend("nosuch").try_keys().await,
            Err(Error::StoreNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_queries() {
        let f = fixture().await;
        let frontend = Arc::new(f.client.frontend("mystore"));

        let lookups = (0..32).map(|i| {
            let frontend = Arc::clone(&frontend);
            async move {
                let key = Data::from(((i % 3) + 1).to_string());
                frontend.try_lookup(&key).await.map(|v| (key, v))
            }
        });
        for result in futures::future::join_all(lookups).await {
            let (key, value) = result.unwrap();
            assert_eq!(value, ds0().get(&key).cloned());
        }
        assert_eq!(f.client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_late_clone_catches_up() {
        let f = fixture().await;
        for i in 0..100u64 {
            f.master.insert(Data::Count(i), Data::Count(i * i)).await;
        }
        let clone = f.client.clone_store("mystore");
        assert!(converges(&clone, &f.master.contents().await).await);
        assert_eq!(clone.last_sequence().await, f.master.sequence().await);
    }

    #[tokio::test]
    async fn test_clone_heals_lost_updates() {
        let f = fixture().await;
        let clone = f.client.clone_store_with_interval("mystore", Duration::from_secs(3600));
        assert!(converges(&clone, &ds0()).await);

        // Drop every third update broadcast
        let counter = Arc::new(AtomicU64::new(0));
        let filter: DeliveryFilter = {
            let counter = Arc::clone(&counter);
            Arc::new(move |topic: &str, _payload: &Bytes| {
                !topic.starts_with("wolfstore.update.")
                    || counter.fetch_add(1, Ordering::SeqCst) % 3 != 2
            })
        };
        f.bus.set_filter(Some(filter));

        for i in 0..30i64 {
            f.master.insert(Data::Integer(i), Data::Integer(-i)).await;
        }
        f.master.erase(Data::Integer(0)).await;

        // Gap detection triggers a resync even though the timer is far off
        assert!(converges(&clone, &f.master.contents().await).await);
        f.bus.set_filter(None);
    }

    #[tokio::test]
    async fn test_periodic_resync_converges_after_burst() {
        let f = fixture().await;
        let frontend = f.client.frontend("mystore");
        let clones: Vec<StoreClone> = (0..3).map(|_| f.client.clone_store("mystore")).collect();

        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let key = Data::Count(rng.gen_range(0..20));
            match rng.gen_range(0..10) {
                0 => frontend.erase(key).await,
                1 if rng.gen_bool(0.1) => f.master.clear().await,
                _ => f.master.insert(key, Data::Count(rng.gen())).await,
            }
        }

        // Frontend writes are asynchronous; wait for the master to go quiet
        let mut last = f.master.sequence().await;
        loop {
            tokio::time::sleep(RESYNC).await;
            let now = f.master.sequence().await;
            if now == last {
                break;
            }
            last = now;
        }

        let expected = f.master.contents().await;
        for clone in &clones {
            assert!(converges(clone, &expected).await);
            assert_eq!(clone.size().await, clone.keys().await.len() as u64);
        }
        assert_eq!(frontend.contents().await, expected);
    }

    #[tokio::test]
    async fn test_timer_resync_repairs_lost_tail() {
        let f = fixture().await;
        let clone = f.client.clone_store("mystore");
        for i in 0..10u64 {
            f.master.insert(Data::Count(i), Data::Count(i)).await;
        }
        assert!(converges(&clone, &f.master.contents().await).await);

        // The last writes never reach the clone and nothing follows to reveal the gap
        let drop_updates: DeliveryFilter =
            Arc::new(|topic: &str, _: &Bytes| !topic.starts_with("wolfstore.update."));
        f.bus.set_filter(Some(drop_updates));
        f.master.insert("4".into(), "four".into()).await;
        f.master.erase("1".into()).await;

        let expected = f.master.contents().await;
        assert!(converges_within(&clone, &expected, RESYNC * 4).await);
        assert_eq!(clone.last_sequence().await, f.master.sequence().await);
        f.bus.set_filter(None);
    }

    #[tokio::test]
    async fn test_resync_now() {
        let f = fixture().await;
        let clone = f.client.clone_store_with_interval("mystore", Duration::from_secs(3600));
        assert!(converges(&clone, &ds0()).await);

        // Lose everything, then ask for a resync explicitly
        let drop_all: DeliveryFilter =
            Arc::new(|topic: &str, _: &Bytes| !topic.starts_with("wolfstore.update."));
        f.bus.set_filter(Some(drop_all));
        f.master.insert("9".into(), "nine".into()).await;
        f.bus.set_filter(None);

        clone.resync_now();
        assert!(wait_for(&clone, &"9".into(), true).await);
    }
}
