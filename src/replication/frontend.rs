//! Frontend Store Implementation
//!
//! A stateless proxy to a store hosted elsewhere on the bus. Writes are
//! forwarded without acknowledgment; queries wait for the master's reply
//! through the endpoint's response queue.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::protocol::{request_topic, Answer, ErrorCode, Message, Query};
use super::response_queue::{Reply, ResponseQueue, Waiter};
use crate::bus::Bus;
use crate::data::Data;
use crate::error::{Error, Result};
use crate::store::{Operation, StoreHandle};

/// Remote proxy bound to one store name
///
/// # Write semantics
///
/// `insert`, `erase` and `clear` publish the mutation and return at once.
/// The master never acknowledges writes, so a lost write looks the same as
/// a slow one. Poll with a query when the caller needs to observe the
/// effect.
#[derive(Clone)]
pub struct Frontend {
    store: String,
    request_topic: String,
    reply_to: String,
    bus: Arc<dyn Bus>,
    responses: Arc<ResponseQueue>,
    timeout: Duration,
}

impl Frontend {
    pub(crate) fn new(
        store: String,
        reply_to: String,
        bus: Arc<dyn Bus>,
        responses: Arc<ResponseQueue>,
        timeout: Duration,
    ) -> Self {
        Self {
            request_topic: request_topic(&store),
            store,
            reply_to,
            bus,
            responses,
            timeout,
        }
    }

    /// Get the store name
    pub fn name(&self) -> &str {
        &self.store
    }

    /// Get the default query timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Use a different default query timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Forward a mutation to the master
    pub fn mutate(&self, operation: Operation) -> Result<()> {
        tracing::trace!("Forwarding {} to store {}", operation.kind(), self.store);
        self.send(&Message::Mutation {
            store: self.store.clone(),
            operation,
        })
    }

    /// Send a query and wait for the answer
    ///
    /// `timeout` overrides the default query timeout. A not-found reply
    /// from an endpoint that does not host the store is only reported once
    /// the timeout expires without an answer from the owner.
    pub async fn query(&self, query: Query, timeout: Option<Duration>) -> Result<Answer> {
        let request_id = Uuid::new_v4();
        let kind = query.kind();
        // Register before publishing so a fast reply cannot be missed
        let waiter = self.responses.register(request_id);
        self.send(&Message::Query {
            store: self.store.clone(),
            request_id,
            reply_to: self.reply_to.clone(),
            query,
        })?;

        let reply = waiter.wait(timeout.unwrap_or(self.timeout)).await?;
        match reply {
            Reply::Answer(answer) => Ok(answer),
            Reply::Failed(e) => Err(self.remote_error(e.code)),
            Reply::Snapshot(_) => Err(Error::UnexpectedResponse {
                request: kind.to_string(),
                reason: "received a snapshot".into(),
            }),
        }
    }

    /// Ask the master for a full snapshot without waiting for it
    pub(crate) fn request_snapshot(&self) -> Result<Waiter<Reply>> {
        let request_id = Uuid::new_v4();
        let waiter = self.responses.register(request_id);
        self.send(&Message::SnapshotRequest {
            store: self.store.clone(),
            request_id,
            reply_to: self.reply_to.clone(),
        })?;
        Ok(waiter)
    }

    /// Look up a key, surfacing timeouts and remote errors
    pub async fn try_lookup(&self, key: &Data) -> Result<Option<Data>> {
        match self.query(Query::Lookup(key.clone()), None).await? {
            Answer::Value(value) => Ok(value),
            other => Err(mismatch("lookup", &other)),
        }
    }

    /// Check if a key exists, surfacing timeouts and remote errors
    pub async fn try_exists(&self, key: &Data) -> Result<bool> {
        match self.query(Query::Exists(key.clone()), None).await? {
            Answer::Exists(exists) => Ok(exists),
            other => Err(mismatch("exists", &other)),
        }
    }

    /// Get all keys, surfacing timeouts and remote errors
    pub async fn try_keys(&self) -> Result<BTreeSet<Data>> {
        match self.query(Query::Keys, None).await? {
            Answer::Keys(keys) => Ok(keys),
            other => Err(mismatch("keys", &other)),
        }
    }

    /// Get the number of keys, surfacing timeouts and remote errors
    pub async fn try_size(&self) -> Result<u64> {
        match self.query(Query::Size, None).await? {
            Answer::Size(size) => Ok(size),
            other => Err(mismatch("size", &other)),
        }
    }

    fn send(&self, message: &Message) -> Result<()> {
        let payload = message.encode()?;
        self.bus.publish(&self.request_topic, payload)
    }

    fn remote_error(&self, code: ErrorCode) -> Error {
        match code {
            ErrorCode::StoreNotFound => Error::StoreNotFound(self.store.clone()),
        }
    }

    fn forward(&self, operation: Operation) {
        if let Err(e) = self.mutate(operation) {
            tracing::warn!("Failed to forward write to store {}: {}", self.store, e);
        }
    }

    fn fallback<T: Default>(&self, what: &str, result: Result<T>) -> T {
        result.unwrap_or_else(|e| {
            tracing::warn!("{} on store {} failed: {}", what, self.store, e);
            T::default()
        })
    }
}

fn mismatch(request: &str, answer: &Answer) -> Error {
    Error::UnexpectedResponse {
        request: request.to_string(),
        reason: format!("answer {:?}", answer),
    }
}

#[async_trait::async_trait]
impl StoreHandle for Frontend {
    async fn insert(&self, key: Data, value: Data) {
        self.forward(Operation::Insert { key, value });
    }

    async fn erase(&self, key: Data) {
        self.forward(Operation::Erase { key });
    }

    async fn clear(&self) {
        self.forward(Operation::Clear);
    }

    async fn lookup(&self, key: &Data) -> Option<Data> {
        let result = self.try_lookup(key).await;
        self.fallback("lookup", result)
    }

    async fn exists(&self, key: &Data) -> bool {
        let result = self.try_exists(key).await;
        self.fallback("exists", result)
    }

    async fn keys(&self) -> BTreeSet<Data> {
        let result = self.try_keys().await;
        self.fallback("keys", result)
    }

    async fn size(&self) -> u64 {
        let result = self.try_size().await;
        self.fallback("size", result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::replication::protocol::RemoteError;

    fn frontend(bus: &LocalBus, responses: Arc<ResponseQueue>) -> Frontend {
        Frontend::new(
            "mystore".to_string(),
            "inbox".to_string(),
            Arc::new(bus.clone()),
            responses,
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_write_is_published() {
        let bus = LocalBus::new();
        let mut requests = bus.subscribe(&request_topic("mystore"));
        let frontend = frontend(&bus, Arc::new(ResponseQueue::new()));

        frontend.insert("5".into(), "five".into()).await;
        let envelope = requests.recv().await.unwrap();
        match Message::decode(&envelope.payload).unwrap() {
            Message::Mutation { store, operation } => {
                assert_eq!(store, "mystore");
                assert_eq!(operation, Operation::Insert { key: "5".into(), value: "five".into() });
            }
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_query_times_out_to_empty_result() {
        let bus = LocalBus::new();
        let responses = Arc::new(ResponseQueue::new());
        let frontend = frontend(&bus, Arc::clone(&responses));

        assert!(matches!(frontend.try_size().await, Err(Error::Timeout(_))));
        assert_eq!(frontend.size().await, 0);
        assert!(!frontend.exists(&"1".into()).await);
        assert!(frontend.keys().await.is_empty());
        assert_eq!(responses.pending(), 0);
    }

    #[tokio::test]
    async fn test_reply_routed_by_request_id() {
        let bus = LocalBus::new();
        let mut requests = bus.subscribe(&request_topic("mystore"));
        let responses = Arc::new(ResponseQueue::new());
        let frontend = frontend(&bus, Arc::clone(&responses)).with_timeout(Duration::from_secs(1));

        let queue = Arc::clone(&responses);
        tokio::spawn(async move {
            let envelope = requests.recv().await.unwrap();
            if let Message::Query { request_id, .. } = Message::decode(&envelope.payload).unwrap() {
                queue.deliver(request_id, Reply::Answer(Answer::Value(Some("one".into()))));
            }
        });

        assert_eq!(frontend.try_lookup(&"1".into()).await.unwrap(), Some("one".into()));
    }

    #[tokio::test]
    async fn test_not_found_surfaces_as_error() {
        let bus = LocalBus::new();
        let mut requests = bus.subscribe(&request_topic("mystore"));
        let responses = Arc::new(ResponseQueue::new());
        let frontend = frontend(&bus, Arc::clone(&responses)).with_timeout(Duration::from_millis(200));

        let queue = Arc::clone(&responses);
        tokio::spawn(async move {
            let envelope = requests.recv().await.unwrap();
            if let Message::Query { request_id, .. } = Message::decode(&envelope.payload).unwrap() {
                queue.deliver_fallback(
                    request_id,
                    Reply::Failed(RemoteError {
                        code: ErrorCode::StoreNotFound,
                        message: "mystore".into(),
                    }),
                );
            }
        });

        assert!(matches!(
            frontend.try_keys().await,
            Err(Error::StoreNotFound(name)) if name == "mystore"
        ));
    }
}
