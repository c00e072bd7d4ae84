//! Coherent Cache - A bounded in-process cache kept consistent across processes
//!
//! Provides an LRU cache with TTL expiration, hit/miss accounting, and
//! delete/reset invalidation broadcast to every instance sharing a name.

pub mod cache;
pub mod config;
pub mod error;
pub mod instance;
pub mod invalidation;
pub mod tasks;

pub use cache::{DumpEntry, SizeCalculation, StatsSnapshot};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use instance::CacheInstance;
pub use invalidation::{ChannelPubSub, InvalidationEvent, LocalPubSub, PubSub, Subscription};
pub use tasks::spawn_purge_task;
