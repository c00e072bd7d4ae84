//! Cache Module
//!
//! Provides the bounded in-memory store with TTL expiration and LRU
//! eviction, plus the hit/miss counters layered over it.

mod entry;
mod lru;
mod stats;
mod store;


// Re-export public types
pub use entry::CacheEntry;
pub(crate) use entry::ttl_millis;
pub use lru::LruList;
pub use stats::{CacheStats, StatsSnapshot};
pub use store::{BoundedStore, DumpEntry, SizeCalculation};
