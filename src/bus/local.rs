//! In-process Bus
//!
//! Fans published payloads out to every subscriber in the same process.

use bytes::Bytes;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use super::{Bus, Envelope, Subscription};
use crate::error::Result;

/// Decides whether a published payload is delivered; `false` drops it
pub type DeliveryFilter = Arc<dyn Fn(&str, &Bytes) -> bool + Send + Sync>;

struct Subscriber {
    prefix: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct Inner {
    subscribers: RwLock<Vec<Subscriber>>,
    filter: RwLock<Option<DeliveryFilter>>,
}

/// Bus connecting endpoints that live in one process
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<Inner>,
}

impl LocalBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a filter that can drop messages (for simulating loss)
    pub fn set_filter(&self, filter: Option<DeliveryFilter>) {
        let mut guard = self.inner.filter.write().unwrap_or_else(|e| e.into_inner());
        *guard = filter;
    }

    /// Get the number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }
}

impl Bus for LocalBus {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let filter = self
            .inner
            .filter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(filter) = filter {
            if !filter(topic, &payload) {
                tracing::trace!("Dropping message on {} (filtered)", topic);
                return Ok(());
            }
        }

        let mut closed = false;
        {
            let subscribers = self.inner.subscribers.read().unwrap_or_else(|e| e.into_inner());
            for subscriber in subscribers.iter().filter(|s| topic.starts_with(&s.prefix)) {
                let envelope = Envelope {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                };
                if subscriber.tx.send(envelope).is_err() {
                    closed = true;
                }
            }
        }

        if closed {
            let mut subscribers = self.inner.subscribers.write().unwrap_or_else(|e| e.into_inner());
            subscribers.retain(|s| !s.tx.is_closed());
        }

        Ok(())
    }

    fn subscribe(&self, prefix: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.inner.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subscribers.push(Subscriber {
            prefix: prefix.to_string(),
            tx,
        });
        Subscription::new(rx)
    }
}
