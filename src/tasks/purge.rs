//! Stale Purge Task
//!
//! Background task that periodically removes expired cache entries.
//! Expiry is already enforced on access; the sweep only releases memory held
//! by entries nobody reads again.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::instance::CacheInstance;

/// Spawns a task that calls [`CacheInstance::purge_stale`] every `interval`.
///
/// The task holds only a weak reference and exits once the cache is
/// dropped. Must be called from within a tokio runtime.
///
/// # Example
/// ```ignore
/// let cache = CacheInstance::create(CacheConfig::local(), transport)?;
/// let purge_handle = spawn_purge_task(&cache, Duration::from_secs(1));
/// // Later, during shutdown:
/// purge_handle.abort();
/// ```
pub fn spawn_purge_task<K, V>(
    cache: &Arc<CacheInstance<K, V>>,
    interval: Duration,
) -> JoinHandle<()>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let cache = Arc::downgrade(cache);

    tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "Starting stale purge task");

        loop {
            tokio::time::sleep(interval).await;

            let Some(cache) = cache.upgrade() else {
                debug!("Cache dropped, stopping stale purge task");
                break;
            };

            let removed = cache.purge_stale();
            if removed > 0 {
                info!(cache = %cache.name(), removed, "Purged expired entries");
            } else {
                debug!(cache = %cache.name(), "No expired entries found");
            }
        }
    })
}
