//! Bounded Store Module
//!
//! Cache engine combining a HashMap key index with an LRU list and lazy TTL
//! expiration.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::entry::current_timestamp_ms;
use crate::cache::{CacheEntry, LruList};

/// Computes the size an entry is charged against `max_size`.
pub type SizeCalculation<K, V> = Arc<dyn Fn(&K, &V) -> usize + Send + Sync>;

// == Dump Entry ==
/// One entry of a [`BoundedStore::dump`] snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpEntry<K, V> {
    pub key: K,
    pub value: V,
    pub inserted_at: DateTime<Utc>,
    /// None = never expires
    pub expires_at: Option<DateTime<Utc>>,
    pub size: usize,
}

// == Bounded Store ==
/// Size-limited store with LRU eviction and TTL support.
///
/// `max == 0` leaves the entry count unbounded and `max_size == 0` leaves the
/// calculated size unbounded; validation that at least one bound exists is
/// done by [`crate::CacheConfig::validate`].
pub struct BoundedStore<K, V> {
    /// Key to LRU slot index
    index: HashMap<K, usize>,
    /// Entries in recency order
    order: LruList<(K, CacheEntry<V>)>,
    /// Maximum number of entries allowed
    max: usize,
    /// Maximum total calculated size
    max_size: usize,
    calculated_size: usize,
    /// TTL for entries stored without an explicit one, zero = never expire
    default_ttl: Duration,
    /// Return expired values once before dropping them
    allow_stale: bool,
    size_calculation: Option<SizeCalculation<K, V>>,
}

impl<K, V> fmt::Debug for BoundedStore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedStore")
            .field("len", &self.order.len())
            .field("max", &self.max)
            .field("max_size", &self.max_size)
            .field("calculated_size", &self.calculated_size)
            .field("default_ttl", &self.default_ttl)
            .field("allow_stale", &self.allow_stale)
            .finish()
    }
}

impl<K, V> BoundedStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    // == Constructor ==
    /// Creates a new store with the given entry capacity and default TTL.
    pub fn new(max: usize, default_ttl: Duration) -> Self {
        Self {
            index: HashMap::new(),
            order: LruList::new(),
            max,
            max_size: 0,
            calculated_size: 0,
            default_ttl,
            allow_stale: false,
            size_calculation: None,
        }
    }

    /// Bounds the total calculated size of the store.
    pub fn with_max_size(
        mut self,
        max_size: usize,
        size_calculation: SizeCalculation<K, V>,
    ) -> Self {
        self.max_size = max_size;
        self.size_calculation = Some(size_calculation);
        self
    }

    pub fn with_allow_stale(mut self, allow_stale: bool) -> Self {
        self.allow_stale = allow_stale;
        self
    }

    // == Set ==
    /// Stores a key-value pair, making it the most recently used entry.
    ///
    /// `ttl` overrides the default TTL when it is non-zero. Least recently
    /// used entries are evicted until both capacity bounds hold. An entry
    /// whose own size exceeds `max_size` is not stored and any previous value
    /// under the key is removed; returns `false` in that case.
    pub fn set(&mut self, key: K, value: V, ttl: Option<Duration>) -> bool {
        let size = self.entry_size(&key, &value);
        if self.max_size > 0 && size > self.max_size {
            debug!(size, max_size = self.max_size, "Entry larger than max_size, not stored");
            self.delete(&key);
            return false;
        }

        let ttl = ttl.filter(|ttl| !ttl.is_zero()).unwrap_or(self.default_ttl);
        self.insert_entry(key, CacheEntry::new(value, Some(ttl), size));
        true
    }

    // == Get ==
    /// Retrieves a value and marks it most recently used.
    ///
    /// Expired entries are removed; with `allow_stale` their value is
    /// returned one last time.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let idx = *self.index.get(key)?;
        let expired = self.order.get(idx)?.1.is_expired();

        if expired {
            let (_, entry) = self.remove_slot(key, idx)?;
            return self.allow_stale.then_some(entry.value);
        }

        self.order.move_to_front(idx);
        self.order.get(idx).map(|(_, entry)| entry.value.clone())
    }

    // == Peek ==
    /// Retrieves a value without touching recency or removing expired entries.
    pub fn peek(&self, key: &K) -> Option<V> {
        let idx = *self.index.get(key)?;
        let (_, entry) = self.order.get(idx)?;

        if entry.is_expired() && !self.allow_stale {
            return None;
        }
        Some(entry.value.clone())
    }

    // == Delete ==
    /// Removes an entry by key. Returns whether an entry was present.
    pub fn delete(&mut self, key: &K) -> bool {
        match self.index.get(key).copied() {
            Some(idx) => self.remove_slot(key, idx).is_some(),
            None => false,
        }
    }

    // == Clear ==
    pub fn clear(&mut self) {
        self.index.clear();
        self.order.clear();
        self.calculated_size = 0;
    }

    // == Purge Stale ==
    /// Removes all expired entries. Returns the number removed.
    pub fn purge_stale(&mut self) -> usize {
        let now = current_timestamp_ms();
        let expired: Vec<K> = self
            .order
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.delete(key);
        }
        expired.len()
    }

    // == Dump ==
    /// Snapshot of live entries, most recently used first.
    pub fn dump(&self) -> Vec<DumpEntry<K, V>> {
        let now = current_timestamp_ms();
        self.order
            .iter()
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .map(|(key, entry)| DumpEntry {
                key: key.clone(),
                value: entry.value.clone(),
                inserted_at: timestamp_to_datetime(entry.created_at),
                expires_at: entry.expires_at.map(timestamp_to_datetime),
                size: entry.size,
            })
            .collect()
    }

    // == Load ==
    /// Replaces the contents with a [`BoundedStore::dump`] snapshot.
    ///
    /// Recency order and absolute expiry times are preserved; entries that
    /// expired since the dump are skipped. Capacity bounds still apply.
    pub fn load(&mut self, entries: Vec<DumpEntry<K, V>>) {
        self.clear();
        let now = current_timestamp_ms();

        for dumped in entries.into_iter().rev() {
            let expires_at = dumped
                .expires_at
                .map(|at| at.timestamp_millis().max(0) as u64);
            if expires_at.is_some_and(|at| now >= at) {
                continue;
            }

            let size = self.entry_size(&dumped.key, &dumped.value);
            if self.max_size > 0 && size > self.max_size {
                continue;
            }
            let entry = CacheEntry {
                value: dumped.value,
                created_at: dumped.inserted_at.timestamp_millis().max(0) as u64,
                expires_at,
                size,
            };
            self.insert_entry(dumped.key, entry);
        }
    }

    // == Accessors ==
    /// Number of physically stored entries, including expired ones not yet
    /// purged.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn calculated_size(&self) -> usize {
        self.calculated_size
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn allow_stale(&self) -> bool {
        self.allow_stale
    }

    fn entry_size(&self, key: &K, value: &V) -> usize {
        match &self.size_calculation {
            Some(calculate) => calculate(key, value).max(1),
            None => 1,
        }
    }

    fn insert_entry(&mut self, key: K, entry: CacheEntry<V>) {
        let size = entry.size;

        match self.index.get(&key).copied() {
            Some(idx) => {
                if let Some(slot) = self.order.get_mut(idx) {
                    self.calculated_size -= slot.1.size;
                    slot.1 = entry;
                }
                self.order.move_to_front(idx);
            }
            None => {
                let idx = self.order.push_front((key.clone(), entry));
                self.index.insert(key, idx);
            }
        }
        self.calculated_size += size;

        self.evict_to_capacity();
    }

    fn evict_to_capacity(&mut self) {
        while self.over_capacity() {
            match self.order.pop_back() {
                Some((key, entry)) => {
                    self.index.remove(&key);
                    self.calculated_size -= entry.size;
                }
                None => break,
            }
        }
    }

    fn over_capacity(&self) -> bool {
        (self.max > 0 && self.order.len() > self.max)
            || (self.max_size > 0 && self.calculated_size > self.max_size)
    }

    fn remove_slot(&mut self, key: &K, idx: usize) -> Option<(K, CacheEntry<V>)> {
        self.index.remove(key);
        let removed = self.order.remove(idx)?;
        self.calculated_size -= removed.1.size;
        Some(removed)
    }
}

/// Timestamps past chrono's range clamp to its maximum, keeping far-future
/// expiries in the future.
fn timestamp_to_datetime(ms: u64) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
