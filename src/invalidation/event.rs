//! Invalidation Events
//!
//! Immutable, idempotent messages broadcast between cache instances that
//! share a name.

use serde::{Deserialize, Serialize};

// == Invalidation Event ==
/// A deletion or full reset performed on one instance of a logical cache.
///
/// Serialized internally tagged, e.g.
/// `{"type":"delete-keys","cache_name":"users","keys":[1,2]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InvalidationEvent<K> {
    /// Remove the listed keys
    DeleteKeys { cache_name: String, keys: Vec<K> },
    /// Drop every entry and zero the counters
    ResetAll { cache_name: String },
}

impl<K> InvalidationEvent<K> {
    pub fn cache_name(&self) -> &str {
        match self {
            InvalidationEvent::DeleteKeys { cache_name, .. } => cache_name,
            InvalidationEvent::ResetAll { cache_name } => cache_name,
        }
    }
}

// == Topics ==
/// Topic carrying [`InvalidationEvent::DeleteKeys`] for a cache.
pub fn delete_topic(cache_name: &str) -> String {
    format!("{cache_name}:delete")
}

/// Topic carrying [`InvalidationEvent::ResetAll`] for a cache.
pub fn reset_topic(cache_name: &str) -> String {
    format!("{cache_name}:reset")
}
