//! Invalidation Coordinator
//!
//! Broadcasts deletions and resets of one cache instance to every instance
//! sharing its name, and decodes the events other instances broadcast.
//!
//! Delivery is best-effort. A failed publish is logged and dropped: the
//! publishing instance has already applied the mutation locally, so only
//! remote instances may serve stale data until a later event reaches them.
//! Lost events are never retried.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::invalidation::event::{delete_topic, reset_topic, InvalidationEvent};
use crate::invalidation::transport::{MessageHandler, PubSub, Subscription};

// == Invalidation Coordinator ==
pub struct InvalidationCoordinator<K> {
    cache_name: String,
    transport: Arc<dyn PubSub>,
    _keys: PhantomData<fn() -> K>,
}

impl<K> InvalidationCoordinator<K>
where
    K: Serialize + DeserializeOwned + Clone + 'static,
{
    pub fn new(cache_name: impl Into<String>, transport: Arc<dyn PubSub>) -> Self {
        Self {
            cache_name: cache_name.into(),
            transport,
            _keys: PhantomData,
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    // == Publish ==
    /// Broadcasts a `DeleteKeys` event on `<name>:delete`.
    pub fn publish_delete(&self, keys: &[K]) {
        let event = InvalidationEvent::DeleteKeys {
            cache_name: self.cache_name.clone(),
            keys: keys.to_vec(),
        };
        self.publish(&delete_topic(&self.cache_name), &event);
    }

    /// Broadcasts a `ResetAll` event on `<name>:reset`.
    pub fn publish_reset(&self) {
        let event: InvalidationEvent<K> = InvalidationEvent::ResetAll {
            cache_name: self.cache_name.clone(),
        };
        self.publish(&reset_topic(&self.cache_name), &event);
    }

    fn publish(&self, topic: &str, event: &InvalidationEvent<K>) {
        let sent = serde_json::to_value(event)
            .map_err(CacheError::from)
            .and_then(|payload| self.transport.publish(topic, payload));

        match sent {
            Ok(()) => debug!(cache = %self.cache_name, topic, "Published invalidation event"),
            Err(err) => warn!(
                cache = %self.cache_name,
                topic,
                error = %err,
                "Failed to publish invalidation event, remote instances may serve stale entries"
            ),
        }
    }

    // == Subscribe ==
    /// Registers handlers for both topics of this cache.
    ///
    /// `on_delete` receives the keys of each matching `DeleteKeys` event and
    /// `on_reset` runs for each matching `ResetAll`. Events carrying another
    /// cache name or an undecodable payload are logged and ignored. Events
    /// published by this same instance are delivered too. The handlers stay
    /// registered while the returned subscriptions are alive.
    pub fn subscribe<D, R>(&self, on_delete: D, on_reset: R) -> Result<Vec<Subscription>>
    where
        D: Fn(Vec<K>) + Send + Sync + 'static,
        R: Fn() + Send + Sync + 'static,
    {
        let name = self.cache_name.clone();
        let delete_handler: MessageHandler = Arc::new(move |payload| {
            match decode::<K>(&name, payload) {
                Some(InvalidationEvent::DeleteKeys { keys, .. }) => on_delete(keys),
                Some(_) => debug!(cache = %name, "Ignoring reset event on delete topic"),
                None => {}
            }
        });

        let name = self.cache_name.clone();
        let reset_handler: MessageHandler = Arc::new(move |payload| {
            match decode::<K>(&name, payload) {
                Some(InvalidationEvent::ResetAll { .. }) => on_reset(),
                Some(_) => debug!(cache = %name, "Ignoring delete event on reset topic"),
                None => {}
            }
        });

        let on_delete = self
            .transport
            .subscribe(&delete_topic(&self.cache_name), delete_handler)?;
        let on_reset = self
            .transport
            .subscribe(&reset_topic(&self.cache_name), reset_handler)?;
        Ok(vec![on_delete, on_reset])
    }
}

/// Decodes a payload, keeping only events addressed to `cache_name`.
fn decode<K: DeserializeOwned>(cache_name: &str, payload: Value) -> Option<InvalidationEvent<K>> {
    let event: InvalidationEvent<K> = match serde_json::from_value(payload) {
        Ok(event) => event,
        Err(err) => {
            warn!(cache = %cache_name, error = %err, "Dropping malformed invalidation payload");
            return None;
        }
    };

    if event.cache_name() != cache_name {
        debug!(cache = %cache_name, from = event.cache_name(), "Ignoring event for another cache");
        return None;
    }
    Some(event)
}
