//! Response Queue
//!
//! Correlates outstanding requests with their replies. Each request
//! registers a waiter under its id; the endpoint's reply loop delivers
//! replies by id. Replies nobody is waiting for are dropped.
//!
//! A reply may also be delivered as a fallback. It does not wake the
//! waiter; it is returned only if nothing better arrives before the
//! deadline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use super::protocol::{Answer, RemoteError, RequestId};
use crate::error::{Error, Result};
use crate::store::Snapshot;

/// Reply routed back to a requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Answer(Answer),
    Snapshot(Snapshot),
    Failed(RemoteError),
}

/// One registered waiter
struct Slot<T> {
    /// Distinguishes re-registrations under the same id
    token: u64,
    tx: oneshot::Sender<T>,
    fallback: Option<T>,
}

type PendingMap<T> = HashMap<RequestId, Slot<T>>;

/// Correlation table for outstanding requests
pub struct ResponseQueue<T = Reply> {
    pending: Arc<Mutex<PendingMap<T>>>,
    next_token: AtomicU64,
}

impl<T> Default for ResponseQueue<T> {
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(0),
        }
    }
}

impl<T> ResponseQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the reply to `id`
    ///
    /// Registering an id that is already pending replaces the earlier waiter,
    /// which then observes a closed channel.
    pub fn register(&self, id: RequestId) -> Waiter<T> {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        lock(&self.pending).insert(
            id,
            Slot {
                token,
                tx,
                fallback: None,
            },
        );
        Waiter {
            id,
            token,
            rx,
            pending: Arc::clone(&self.pending),
        }
    }

    /// Hand a reply to its waiter
    ///
    /// Returns false if no waiter is registered (late, duplicate or unknown).
    pub fn deliver(&self, id: RequestId, response: T) -> bool {
        let slot = lock(&self.pending).remove(&id);
        match slot {
            Some(slot) => slot.tx.send(response).is_ok(),
            None => {
                tracing::trace!("Dropping unmatched reply for request {}", id);
                false
            }
        }
    }

    /// Park a reply to be returned only if the waiter times out
    ///
    /// The first fallback is kept. A later [`deliver`](Self::deliver) still
    /// wins. Returns false if no waiter is registered.
    pub fn deliver_fallback(&self, id: RequestId, response: T) -> bool {
        match lock(&self.pending).get_mut(&id) {
            Some(slot) => {
                if slot.fallback.is_none() {
                    slot.fallback = Some(response);
                }
                true
            }
            None => {
                tracing::trace!("Dropping unmatched fallback for request {}", id);
                false
            }
        }
    }

    /// Wait for the reply of a registered request
    pub async fn wait(&self, waiter: Waiter<T>, timeout: Duration) -> Result<T> {
        waiter.wait(timeout).await
    }

    /// Get the number of outstanding requests
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }
}

/// Handle held by the caller while its request is outstanding
///
/// Dropping the waiter withdraws the registration.
pub struct Waiter<T> {
    id: RequestId,
    token: u64,
    rx: oneshot::Receiver<T>,
    pending: Arc<Mutex<PendingMap<T>>>,
}

impl<T> Waiter<T> {
    /// Get the request id
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the reply without a deadline
    ///
    /// Cancel safe: a reply that arrives while this future is dropped stays
    /// available to the next call.
    pub async fn recv(&mut self) -> Result<T> {
        (&mut self.rx).await.map_err(|_| Error::ShuttingDown)
    }

    /// Wait for the reply, giving up after `timeout`
    ///
    /// On timeout a parked fallback reply is returned instead of
    /// [`Error::Timeout`].
    pub async fn wait(mut self, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => self.take_fallback().ok_or_else(|| Error::Timeout(self.id)),
        }
    }

    /// Take the fallback reply parked for this request, if any
    pub fn take_fallback(&self) -> Option<T> {
        lock(&self.pending)
            .get_mut(&self.id)
            .filter(|slot| slot.token == self.token)
            .and_then(|slot| slot.fallback.take())
    }
}

impl<T> Drop for Waiter<T> {
    fn drop(&mut self) {
        let mut pending = lock(&self.pending);
        // Only withdraw our own registration, not a newer one under the same id
        if pending.get(&self.id).map_or(false, |slot| slot.token == self.token) {
            pending.remove(&self.id);
        }
    }
}

fn lock<T>(pending: &Mutex<PendingMap<T>>) -> std::sync::MutexGuard<'_, PendingMap<T>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_deliver_wakes_waiter() {
        let queue: ResponseQueue<String> = ResponseQueue::new();
        let id = Uuid::new_v4();
        let waiter = queue.register(id);
        assert_eq!(queue.pending(), 1);

        assert!(queue.deliver(id, "pong".to_string()));
        let reply = queue.wait(waiter, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, "pong");
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_reply_dropped() {
        let queue: ResponseQueue<u32> = ResponseQueue::new();
        assert!(!queue.deliver(Uuid::new_v4(), 1));

        let id = Uuid::new_v4();
        let waiter = queue.register(id);
        assert!(queue.deliver(id, 1));
        // Duplicate
        assert!(!queue.deliver(id, 2));
        assert_eq!(waiter.wait(Duration::from_secs(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_timeout_removes_entry() {
        let queue: ResponseQueue<u32> = ResponseQueue::new();
        let id = Uuid::new_v4();
        let waiter = queue.register(id);

        let result = waiter.wait(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Error::Timeout(t)) if t == id));
        assert_eq!(queue.pending(), 0);
        assert!(!queue.deliver(id, 7));
    }

    #[tokio::test]
    async fn test_dropped_waiter_removes_entry() {
        let queue: ResponseQueue<u32> = ResponseQueue::new();
        let waiter = queue.register(Uuid::new_v4());
        drop(waiter);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_fallback_returned_on_timeout() {
        let queue: ResponseQueue<&str> = ResponseQueue::new();
        let id = Uuid::new_v4();
        let waiter = queue.register(id);

        assert!(queue.deliver_fallback(id, "not found"));
        assert!(queue.deliver_fallback(id, "ignored"));
        assert_eq!(queue.pending(), 1);
        assert_eq!(waiter.wait(Duration::from_millis(20)).await.unwrap(), "not found");
        assert_eq!(queue.pending(), 0);
        assert!(!queue.deliver_fallback(id, "late"));
    }

    #[tokio::test]
    async fn test_reply_beats_fallback() {
        let queue: Arc<ResponseQueue<&str>> = Arc::new(ResponseQueue::new());
        let id = Uuid::new_v4();
        let waiter = queue.register(id);

        queue.deliver_fallback(id, "not found");
        let q = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            q.deliver(id, "answer");
        });

        assert_eq!(waiter.wait(Duration::from_secs(1)).await.unwrap(), "answer");
    }

    #[tokio::test]
    async fn test_independent_waiters() {
        let queue: Arc<ResponseQueue<u32>> = Arc::new(ResponseQueue::new());
        let slow = queue.register(Uuid::new_v4());
        let fast_id = Uuid::new_v4();
        let fast = queue.register(fast_id);

        let q = Arc::clone(&queue);
        tokio::spawn(async move {
            q.deliver(fast_id, 2);
        });

        assert_eq!(fast.wait(Duration::from_secs(1)).await.unwrap(), 2);
        assert!(slow.wait(Duration::from_millis(10)).await.is_err());
        assert_eq!(queue.pending(), 0);
    }
}
