//! Cache Instance
//!
//! The facade callers use: a bounded store behind one lock, hit/miss
//! counters, a runtime enable switch, and invalidation broadcast for
//! deletes and resets.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{BoundedStore, CacheStats, DumpEntry, SizeCalculation, StatsSnapshot};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::invalidation::{InvalidationCoordinator, PubSub, Subscription};

// == Cache Instance ==
/// One process-local instance of a named cache.
///
/// Instances created with the same name on the same transport converge after
/// a `delete` or `reset` on any of them. Construct with
/// [`CacheInstance::create`]. Dropping the last `Arc` unsubscribes the
/// instance from its transport.
pub struct CacheInstance<K, V> {
    name: String,
    store: Mutex<BoundedStore<K, V>>,
    stats: CacheStats,
    enabled: AtomicBool,
    coordinator: InvalidationCoordinator<K>,
    _subscriptions: Vec<Subscription>,
}

impl<K, V> fmt::Debug for CacheInstance<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheInstance")
            .field("name", &self.name)
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<K, V> CacheInstance<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    // == Construction ==
    /// Creates an entry-count bounded cache and subscribes it to its
    /// invalidation topics.
    ///
    /// A failing subscription is logged and does not fail construction; the
    /// instance then only sees its own deletes and resets.
    pub fn create(config: CacheConfig, transport: Arc<dyn PubSub>) -> Result<Arc<Self>> {
        Self::build(config, transport, None)
    }

    /// Like [`CacheInstance::create`], additionally bounding the total size
    /// computed by `size_calculation` to `config.max_size`.
    pub fn create_sized(
        config: CacheConfig,
        transport: Arc<dyn PubSub>,
        size_calculation: SizeCalculation<K, V>,
    ) -> Result<Arc<Self>> {
        Self::build(config, transport, Some(size_calculation))
    }

    fn build(
        config: CacheConfig,
        transport: Arc<dyn PubSub>,
        size_calculation: Option<SizeCalculation<K, V>>,
    ) -> Result<Arc<Self>> {
        config.validate(size_calculation.is_some())?;

        let mut store =
            BoundedStore::new(config.max, config.default_ttl()).with_allow_stale(config.allow_stale);
        if let Some(size_calculation) = size_calculation {
            store = store.with_max_size(config.max_size, size_calculation);
        }

        let cache = Arc::new_cyclic(|weak| {
            let coordinator = InvalidationCoordinator::new(config.name.clone(), transport);
            let subscriptions = Self::subscribe(&config.name, &coordinator, weak);
            Self {
                name: config.name.clone(),
                store: Mutex::new(store),
                stats: CacheStats::new(),
                enabled: AtomicBool::new(config.enabled),
                coordinator,
                _subscriptions: subscriptions,
            }
        });

        info!(
            cache = %config.name,
            max = config.max,
            max_size = config.max_size,
            ttl_ms = config.ttl,
            enabled = config.enabled,
            "Cache created"
        );
        Ok(cache)
    }

    /// Handlers hold a weak reference; they go quiet once the instance is
    /// dropped and are unregistered along with it.
    fn subscribe(
        name: &str,
        coordinator: &InvalidationCoordinator<K>,
        weak: &Weak<Self>,
    ) -> Vec<Subscription> {
        let cache = Weak::clone(weak);
        let on_delete = move |keys: Vec<K>| {
            if let Some(cache) = cache.upgrade() {
                cache.apply_delete(&keys);
            }
        };

        let cache = Weak::clone(weak);
        let on_reset = move || {
            if let Some(cache) = cache.upgrade() {
                cache.local_reset();
            }
        };

        coordinator
            .subscribe(on_delete, on_reset)
            .unwrap_or_else(|err| {
                warn!(
                    cache = %name,
                    error = %err,
                    "Failed to subscribe to invalidation events, remote deletes will not reach this instance"
                );
                Vec::new()
            })
    }

    // == Set ==
    /// Stores a value; `ttl` overrides the default when non-zero.
    /// No-op while disabled.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        if !self.is_enabled() {
            return;
        }
        self.store.lock().set(key, value, ttl);
    }

    // == Get ==
    /// Looks up a value, counting a hit or a miss.
    ///
    /// While disabled always returns None and leaves the counters alone.
    pub fn get(&self, key: &K) -> Option<V> {
        if !self.is_enabled() {
            return None;
        }

        let value = self.store.lock().get(key);
        match value {
            Some(_) => self.stats.record_hit(),
            None => self.stats.record_miss(),
        }
        value
    }

    // == Peek ==
    /// Looks up a value without affecting recency or the counters.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.store.lock().peek(key)
    }

    // == Delete ==
    /// Deletes one key here and on every instance sharing this cache's name.
    pub fn delete(&self, key: &K) {
        self.delete_many(std::slice::from_ref(key));
    }

    /// Deletes keys here and on every instance sharing this cache's name.
    ///
    /// The local store is updated regardless of whether the broadcast
    /// succeeds.
    pub fn delete_many(&self, keys: &[K]) {
        if keys.is_empty() {
            return;
        }
        self.coordinator.publish_delete(keys);
        self.apply_delete(keys);
    }

    fn apply_delete(&self, keys: &[K]) {
        let mut store = self.store.lock();
        for key in keys {
            store.delete(key);
        }
    }

    // == Reset ==
    /// Empties this instance, zeroes its counters, and broadcasts a reset to
    /// every instance sharing this cache's name.
    pub fn reset(&self) {
        self.coordinator.publish_reset();
        self.local_reset();
    }

    /// Alias of [`CacheInstance::reset`].
    pub fn clear(&self) {
        self.reset();
    }

    fn local_reset(&self) {
        self.store.lock().clear();
        self.stats.reset();
        debug!(cache = %self.name, "Cache reset");
    }

    // == Bulk Lookup ==
    /// Splits `keys` into cached and uncached.
    ///
    /// Cached values are written into `cached`; the uncached keys are
    /// returned in input order. Counters move by one hit or miss per key.
    /// While disabled, returns every key and touches nothing.
    pub fn get_uncached_keys(&self, keys: &[K], cached: &mut HashMap<K, V>) -> Vec<K> {
        if !self.is_enabled() {
            return keys.to_vec();
        }

        let mut uncached = Vec::new();
        {
            let mut store = self.store.lock();
            for key in keys {
                match store.get(key) {
                    Some(value) => {
                        cached.insert(key.clone(), value);
                    }
                    None => uncached.push(key.clone()),
                }
            }
        }

        let misses = uncached.len() as u64;
        let hits = keys.len() as u64 - misses;
        self.stats.record_batch(hits, misses);
        uncached
    }

    // == Snapshots ==
    /// Live entries, most recently used first.
    pub fn dump(&self) -> Vec<DumpEntry<K, V>> {
        self.store.lock().dump()
    }

    /// Replaces the local contents with a [`CacheInstance::dump`] snapshot.
    /// Not broadcast. No-op while disabled.
    pub fn load(&self, entries: Vec<DumpEntry<K, V>>) {
        if !self.is_enabled() {
            return;
        }
        self.store.lock().load(entries);
    }

    /// Drops expired entries now instead of on their next access.
    pub fn purge_stale(&self) -> usize {
        self.store.lock().purge_stale()
    }

    // == Enable Switch ==
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Gates reads and writes. Stored entries are kept while disabled.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    // == Properties ==
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hits(&self) -> u64 {
        self.stats.hits()
    }

    pub fn misses(&self) -> u64 {
        self.stats.misses()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of stored entries, including expired ones not yet dropped.
    pub fn size(&self) -> usize {
        self.store.lock().len()
    }

    /// Alias of [`CacheInstance::size`].
    pub fn item_count(&self) -> usize {
        self.size()
    }

    /// Sum of entry sizes charged against `max_size`.
    pub fn calculated_size(&self) -> usize {
        self.store.lock().calculated_size()
    }

    pub fn max(&self) -> usize {
        self.store.lock().max()
    }

    /// Configured size bound, None when the cache is bounded by count only.
    pub fn max_size(&self) -> Option<usize> {
        let max_size = self.store.lock().max_size();
        (max_size > 0).then_some(max_size)
    }

    /// Default TTL, zero = never expire.
    pub fn ttl(&self) -> Duration {
        self.store.lock().default_ttl()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidation::LocalPubSub;
    use crate::CacheError;
    use std::thread::sleep;

    fn cache(max: usize) -> Arc<CacheInstance<String, String>> {
        let bus: Arc<dyn PubSub> = Arc::new(LocalPubSub::new());
        CacheInstance::create(CacheConfig::new("test").with_max(max), bus).unwrap()
    }

    fn key(k: &str) -> String {
        k.to_string()
    }

    #[test]
    fn test_create_rejects_invalid_config() {
        let bus: Arc<dyn PubSub> = Arc::new(LocalPubSub::new());
        let result =
            CacheInstance::<String, String>::create(CacheConfig::new("test").with_max(0), bus);
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_set_get_counts_hits_and_misses() {
        let cache = cache(10);

        cache.set(key("a"), key("1"), None);
        assert_eq!(cache.get(&key("a")), Some(key("1")));
        assert_eq!(cache.get(&key("b")), None);

        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_expired_entry_counts_as_miss() {
        let cache = cache(10);

        cache.set(key("a"), key("1"), Some(Duration::from_millis(10)));
        sleep(Duration::from_millis(20));

        assert_eq!(cache.get(&key("a")), None);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 0);
    }

    #[test]
    fn test_peek_does_not_count() {
        let cache = cache(10);
        cache.set(key("a"), key("1"), None);

        assert_eq!(cache.peek(&key("a")), Some(key("1")));
        assert_eq!(cache.peek(&key("b")), None);
        assert_eq!(cache.stats(), StatsSnapshot::default());
    }

    #[test]
    fn test_get_uncached_keys_partitions_in_order() {
        let cache = cache(10);
        cache.set(key("k1"), key("v1"), None);

        let mut cached = HashMap::new();
        let uncached = cache.get_uncached_keys(&[key("k1"), key("k2"), key("k3")], &mut cached);

        assert_eq!(uncached, vec![key("k2"), key("k3")]);
        assert_eq!(cached.get(&key("k1")), Some(&key("v1")));
        assert_eq!(cached.len(), 1);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 2);
    }

    #[test]
    fn test_disabled_cache_is_pass_through() {
        let cache = cache(10);
        cache.set(key("a"), key("1"), None);
        cache.set_enabled(false);

        assert_eq!(cache.get(&key("a")), None);
        cache.set(key("b"), key("2"), None);

        let mut cached = HashMap::new();
        let keys = vec![key("a"), key("b")];
        assert_eq!(cache.get_uncached_keys(&keys, &mut cached), keys);
        assert!(cached.is_empty());
        assert_eq!(cache.stats(), StatsSnapshot::default());

        cache.set_enabled(true);
        assert_eq!(cache.get(&key("a")), Some(key("1")), "entries survive disabling");
        assert_eq!(cache.get(&key("b")), None, "writes while disabled were dropped");
    }

    #[test]
    fn test_disabled_cache_still_deletes() {
        let cache = cache(10);
        cache.set(key("a"), key("1"), None);
        cache.set_enabled(false);

        cache.delete(&key("a"));
        cache.set_enabled(true);

        assert_eq!(cache.get(&key("a")), None);
    }

    #[test]
    fn test_reset_clears_entries_and_counters() {
        let cache = cache(10);
        cache.set(key("a"), key("1"), None);
        cache.get(&key("a"));
        cache.get(&key("z"));

        cache.reset();

        assert_eq!(cache.size(), 0);
        assert_eq!(cache.hits(), 0);
        assert_eq!(cache.misses(), 0);
    }

    #[test]
    fn test_properties_reflect_live_state() {
        let bus: Arc<dyn PubSub> = Arc::new(LocalPubSub::new());
        let config = CacheConfig::new("props")
            .with_max(5)
            .with_ttl(Duration::from_secs(30));
        let cache = CacheInstance::<String, String>::create(config, bus).unwrap();

        assert_eq!(cache.name(), "props");
        assert_eq!(cache.max(), 5);
        assert_eq!(cache.max_size(), None);
        assert_eq!(cache.ttl(), Duration::from_secs(30));

        cache.set(key("a"), key("1"), None);
        cache.set(key("b"), key("2"), None);
        assert_eq!(cache.size(), 2);
        assert_eq!(cache.item_count(), 2);

        cache.delete_many(&[key("a"), key("b")]);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_sized_cache() {
        let bus: Arc<dyn PubSub> = Arc::new(LocalPubSub::new());
        let size_of: SizeCalculation<String, String> =
            Arc::new(|_key: &String, value: &String| value.len());
        let config = CacheConfig::new("sized").with_max(0).with_max_size(6);
        let cache = CacheInstance::create_sized(config, bus, size_of).unwrap();

        cache.set(key("a"), key("123"), None);
        cache.set(key("b"), key("123"), None);
        cache.set(key("c"), key("1"), None);

        assert_eq!(cache.max_size(), Some(6));
        assert_eq!(cache.calculated_size(), 4);
        assert_eq!(cache.peek(&key("a")), None);
    }

    #[test]
    fn test_dump_and_load() {
        let source = cache(10);
        source.set(key("a"), key("1"), None);
        source.set(key("b"), key("2"), None);

        let target = cache(10);
        target.load(source.dump());

        assert_eq!(target.peek(&key("a")), Some(key("1")));
        assert_eq!(target.dump(), source.dump());
    }

    #[test]
    fn test_dropped_instance_ignores_events() {
        let bus: Arc<dyn PubSub> = Arc::new(LocalPubSub::new());
        let first =
            CacheInstance::<String, String>::create(CacheConfig::new("shared"), Arc::clone(&bus))
                .unwrap();
        let second =
            CacheInstance::<String, String>::create(CacheConfig::new("shared"), bus).unwrap();
        drop(first);

        second.set(key("a"), key("1"), None);
        second.delete(&key("a"));
        assert_eq!(second.peek(&key("a")), None);
    }

    #[test]
    fn test_dropped_instances_release_subscriptions() {
        let bus = Arc::new(LocalPubSub::new());
        let transport: Arc<dyn PubSub> = Arc::clone(&bus) as Arc<dyn PubSub>;

        for _ in 0..1000 {
            let cache = CacheInstance::<String, String>::create(
                CacheConfig::new("churn"),
                Arc::clone(&transport),
            )
            .unwrap();
            drop(cache);
        }
        assert_eq!(bus.subscriber_count("churn:delete"), 0);
        assert_eq!(bus.subscriber_count("churn:reset"), 0);

        let live =
            CacheInstance::<String, String>::create(CacheConfig::new("churn"), transport).unwrap();
        assert_eq!(bus.subscriber_count("churn:delete"), 1);
        drop(live);
        assert_eq!(bus.subscriber_count("churn:delete"), 0);
    }

    #[test]
    fn test_huge_ttl_is_kept() {
        let cache = cache(10);
        cache.set(key("a"), key("1"), Some(Duration::from_secs(u64::MAX)));
        assert_eq!(cache.get(&key("a")), Some(key("1")));
    }
}
