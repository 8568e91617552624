//! Live subscriber set.
//!
//! Broadcasts never iterate the live map: they take an owned snapshot under a
//! short read lock, so register/unregister proceed while sends are in flight.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// Per-subscriber delivery failure.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Subscriber connection closed")]
    Closed,

    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    #[error("Payload rejected: {0}")]
    Rejected(String),
}

/// Identifier handed out on registration
pub type SubscriberId = Uuid;

/// Something that can receive serialized events
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Deliver one serialized event.
    async fn send(&self, payload: Arc<str>) -> Result<(), SendError>;
}

/// Subscriber backed by a bounded channel drained by a connection writer.
///
/// A full queue makes `send` wait, which is how a slow connection shows up
/// as send latency and, past the hub timeout, as a failure.
pub struct ChannelSubscriber {
    tx: mpsc::Sender<Arc<str>>,
}

impl ChannelSubscriber {
    /// Create a subscriber and the receiver its writer task drains
    pub fn new(queue_size: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    async fn send(&self, payload: Arc<str>) -> Result<(), SendError> {
        self.tx.send(payload).await.map_err(|_| SendError::Closed)
    }
}

/// Thread-safe set of active subscribers
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<SubscriberId, Arc<dyn Subscriber>>>,
}

impl SubscriberRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber, returning its id.
    pub fn register(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = Uuid::new_v4();
        let count = {
            let mut subscribers = self.subscribers.write();
            subscribers.insert(id, subscriber);
            subscribers.len()
        };

        metrics::gauge!("monitor.subscribers").set(count as f64);
        info!(subscriber_id = %id, total = count, "Subscriber connected");

        id
    }

    /// Remove a subscriber. Returns whether it was registered.
    pub fn unregister(&self, id: &SubscriberId) -> bool {
        let (removed, count) = {
            let mut subscribers = self.subscribers.write();
            let removed = subscribers.remove(id).is_some();
            (removed, subscribers.len())
        };

        if removed {
            metrics::gauge!("monitor.subscribers").set(count as f64);
            info!(subscriber_id = %id, total = count, "Subscriber disconnected");
        }

        removed
    }

    /// Point-in-time copy of the current members.
    pub fn snapshot(&self) -> Vec<(SubscriberId, Arc<dyn Subscriber>)> {
        self.subscribers
            .read()
            .iter()
            .map(|(id, subscriber)| (*id, Arc::clone(subscriber)))
            .collect()
    }

    /// Number of registered subscribers
    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Whether no subscriber is registered
    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSubscriber;

    #[async_trait]
    impl Subscriber for NullSubscriber {
        async fn send(&self, _payload: Arc<str>) -> Result<(), SendError> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = SubscriberRegistry::new();
        let a = registry.register(Arc::new(NullSubscriber));
        let b = registry.register(Arc::new(NullSubscriber));
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister(&a));
        assert!(!registry.unregister(&a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_is_detached_from_registry() {
        let registry = SubscriberRegistry::new();
        let a = registry.register(Arc::new(NullSubscriber));

        let snapshot = registry.snapshot();
        registry.unregister(&a);
        registry.register(Arc::new(NullSubscriber));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, a);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_channel_subscriber_delivers_and_detects_close() {
        let (subscriber, mut rx) = ChannelSubscriber::new(4);

        tokio_test::assert_ok!(subscriber.send(Arc::from("hello")).await);
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));

        drop(rx);
        assert!(matches!(
            subscriber.send(Arc::from("again")).await,
            Err(SendError::Closed)
        ));
    }
}
