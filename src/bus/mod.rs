//! Bus Module
//!
//! The publish/subscribe transport that endpoints exchange messages over.
//! Delivery is reliable and in order per publisher; nothing is promised
//! across publishers.

mod local;

pub use local::{DeliveryFilter, LocalBus};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// A message as delivered to a subscriber
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Topic the message was published on
    pub topic: String,
    /// Encoded message
    pub payload: Bytes,
}

/// Publish/subscribe transport
///
/// Subscriptions match by topic prefix.
pub trait Bus: Send + Sync {
    /// Publish a payload on a topic
    fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to every topic starting with `prefix`
    fn subscribe(&self, prefix: &str) -> Subscription;
}

/// Receiving side of a bus subscription
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Subscription {
    /// Wrap the receiving half of a subscriber channel
    pub fn new(rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self { rx }
    }

    /// Receive the next message, or `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}
