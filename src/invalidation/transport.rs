//! Pub/Sub Transports
//!
//! The publish/subscribe contract the invalidation protocol needs, plus two
//! in-process implementations. Cross-process transports (a message queue,
//! Redis pub/sub, ...) implement [`PubSub`] outside this crate.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::error::{CacheError, Result};

/// Callback invoked with each payload delivered on a subscribed topic.
pub type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

// == Subscription ==
/// Registration of one handler on one topic. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Wraps the transport-specific teardown run on drop.
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to release.
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    /// Removes the handler now.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

// == PubSub Trait ==
/// Topic-based, at-least-once, best-effort broadcast.
///
/// Implementations should deliver a message to every subscriber of the
/// topic, including subscribers living in the publishing process.
pub trait PubSub: Send + Sync {
    /// Publishes a payload without waiting for delivery.
    fn publish(&self, topic: &str, payload: Value) -> Result<()>;

    /// Registers a handler for every future message on `topic` until the
    /// returned [`Subscription`] is dropped.
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<Subscription>;
}

// == Local PubSub ==
#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<String, Vec<(u64, MessageHandler)>>,
}

impl Registry {
    fn remove(&mut self, topic: &str, id: u64) {
        if let Some(handlers) = self.topics.get_mut(topic) {
            handlers.retain(|(handler_id, _)| *handler_id != id);
            if handlers.is_empty() {
                self.topics.remove(topic);
            }
        }
    }
}

/// Synchronous in-memory transport.
///
/// `publish` runs every handler for the topic on the caller's stack before
/// returning, which makes delivery deterministic. Instances sharing one
/// `LocalPubSub` behave like a process group on a reliable bus.
#[derive(Default)]
pub struct LocalPubSub {
    registry: Arc<RwLock<Registry>>,
}

impl LocalPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handlers registered on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry.read().topics.get(topic).map_or(0, Vec::len)
    }
}

impl fmt::Debug for LocalPubSub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.read();
        f.debug_struct("LocalPubSub")
            .field("topics", &registry.topics.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PubSub for LocalPubSub {
    fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        // Handlers run outside the lock so they may publish or unsubscribe.
        let handlers: Vec<MessageHandler> = self
            .registry
            .read()
            .topics
            .get(topic)
            .map(|handlers| handlers.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();
        debug!(topic, subscribers = handlers.len(), "Delivering local message");

        for handler in handlers {
            handler(payload.clone());
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<Subscription> {
        let id = {
            let mut registry = self.registry.write();
            let id = registry.next_id;
            registry.next_id += 1;
            registry
                .topics
                .entry(topic.to_string())
                .or_default()
                .push((id, handler));
            id
        };

        let registry = Arc::downgrade(&self.registry);
        let topic = topic.to_string();
        Ok(Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.write().remove(&topic, id);
            }
        }))
    }
}

// == Channel PubSub ==
#[derive(Debug, Clone)]
struct Message {
    topic: Arc<str>,
    payload: Value,
}

/// Asynchronous in-process transport over a tokio broadcast channel.
///
/// Each subscription is a spawned task, so handlers run on the runtime and
/// never on the publisher's stack. Subscribing requires a tokio runtime.
/// A subscriber that falls more than `capacity` messages behind loses the
/// oldest ones; the loss is logged and not retried.
#[derive(Debug, Clone)]
pub struct ChannelPubSub {
    sender: broadcast::Sender<Message>,
}

impl ChannelPubSub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Number of live subscription tasks across all topics.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChannelPubSub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl PubSub for ChannelPubSub {
    fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        let message = Message {
            topic: Arc::from(topic),
            payload,
        };
        self.sender
            .send(message)
            .map(|_| ())
            .map_err(|_| CacheError::Transport(format!("no subscribers for topic {topic}")))
    }

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<Subscription> {
        let runtime = Handle::try_current().map_err(|err| CacheError::Transport(err.to_string()))?;
        let mut receiver = self.sender.subscribe();
        let topic: Arc<str> = Arc::from(topic);

        let task = runtime.spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) if message.topic == topic => handler(message.payload),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "Subscriber lagged, messages dropped");
                    }
                    Err(RecvError::Closed) => {
                        debug!(topic = %topic, "Channel closed, subscription ended");
                        break;
                    }
                }
            }
        });

        let task = task.abort_handle();
        Ok(Subscription::new(move || task.abort()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    fn recording_handler() -> (MessageHandler, Arc<Mutex<Vec<Value>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let handler: MessageHandler = Arc::new(move |payload| sink.lock().push(payload));
        (handler, received)
    }

    #[test]
    fn test_local_delivers_synchronously_to_topic() {
        let bus = LocalPubSub::new();
        let (handler, received) = recording_handler();
        let _subscription = bus.subscribe("a:delete", handler).unwrap();

        bus.publish("a:delete", json!([1])).unwrap();
        bus.publish("b:delete", json!([2])).unwrap();

        assert_eq!(*received.lock(), vec![json!([1])]);
        assert_eq!(bus.subscriber_count("a:delete"), 1);
        assert_eq!(bus.subscriber_count("b:delete"), 0);
    }

    #[test]
    fn test_local_publish_without_subscribers_is_ok() {
        let bus = LocalPubSub::new();
        assert!(bus.publish("nobody", json!(null)).is_ok());
    }

    #[test]
    fn test_local_handler_may_publish() {
        let bus = Arc::new(LocalPubSub::new());
        let (handler, received) = recording_handler();
        let _second = bus.subscribe("second", handler).unwrap();

        let relay = Arc::clone(&bus);
        let _first = bus.subscribe(
            "first",
            Arc::new(move |payload| {
                relay.publish("second", payload).unwrap();
            }),
        )
        .unwrap();

        bus.publish("first", json!("hop")).unwrap();
        assert_eq!(*received.lock(), vec![json!("hop")]);
    }

    #[test]
    fn test_local_drop_subscription_removes_handler() {
        let bus = LocalPubSub::new();
        let (kept_handler, kept) = recording_handler();
        let (dropped_handler, dropped) = recording_handler();
        let _kept = bus.subscribe("a:delete", kept_handler).unwrap();
        let subscription = bus.subscribe("a:delete", dropped_handler).unwrap();
        assert_eq!(bus.subscriber_count("a:delete"), 2);

        drop(subscription);
        bus.publish("a:delete", json!(1)).unwrap();

        assert_eq!(bus.subscriber_count("a:delete"), 1);
        assert_eq!(*kept.lock(), vec![json!(1)]);
        assert!(dropped.lock().is_empty());
    }

    #[test]
    fn test_local_unsubscribe_after_bus_dropped() {
        let bus = LocalPubSub::new();
        let (handler, _) = recording_handler();
        let subscription = bus.subscribe("a:reset", handler).unwrap();

        drop(bus);
        subscription.unsubscribe();
    }

    #[test]
    fn test_channel_subscribe_requires_runtime() {
        let bus = ChannelPubSub::default();
        let (handler, _) = recording_handler();
        let result = bus.subscribe("topic", handler);
        assert!(matches!(result, Err(CacheError::Transport(_))));
    }

    #[test]
    fn test_channel_publish_without_subscribers_errors() {
        let bus = ChannelPubSub::default();
        let result = bus.publish("topic", json!(1));
        assert!(matches!(result, Err(CacheError::Transport(_))));
    }

    #[tokio::test]
    async fn test_channel_delivers_asynchronously() {
        let bus = ChannelPubSub::new(16);
        let (handler, received) = recording_handler();
        let _subscription = bus.subscribe("x:reset", handler).unwrap();

        bus.publish("x:other", json!(0)).unwrap();
        bus.publish("x:reset", json!(1)).unwrap();

        for _ in 0..50 {
            if !received.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*received.lock(), vec![json!(1)]);
    }

    #[tokio::test]
    async fn test_channel_drop_subscription_stops_task() {
        let bus = ChannelPubSub::new(16);
        let (handler, received) = recording_handler();
        let subscription = bus.subscribe("x:delete", handler).unwrap();
        assert_eq!(bus.receiver_count(), 1);

        drop(subscription);
        for _ in 0..50 {
            if bus.receiver_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(bus.receiver_count(), 0);
        assert!(bus.publish("x:delete", json!(1)).is_err());
        assert!(received.lock().is_empty());
    }
}
