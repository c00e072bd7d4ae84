//! Cache Entry Module
//!
//! Defines the structure for individual cache entries with TTL support.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

// == Cache Entry ==
/// Represents a single cache entry with value and metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The stored value
    pub value: V,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: u64,
    /// Expiration timestamp (Unix milliseconds), None = no expiration
    pub expires_at: Option<u64>,
    /// Calculated size charged against `max_size` (1 when unsized)
    pub size: usize,
}

impl<V> CacheEntry<V> {
    // == Constructor ==
    /// Creates a new cache entry with optional TTL.
    ///
    /// A zero TTL means the entry never expires. Sub-millisecond TTLs are
    /// rounded up to one millisecond.
    pub fn new(value: V, ttl: Option<Duration>, size: usize) -> Self {
        let now = current_timestamp_ms();
        let expires_at = ttl
            .filter(|ttl| !ttl.is_zero())
            .map(|ttl| now.saturating_add(ttl_millis(ttl)));

        Self {
            value,
            created_at: now,
            expires_at,
            size,
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// An entry is expired once the current time is greater than or equal to
    /// the expiration time.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp_ms())
    }

    /// Expiry check against a caller-supplied clock reading, so bulk scans
    /// read the clock once.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        match self.expires_at {
            Some(expires) => now_ms >= expires,
            None => false,
        }
    }

    // == Time To Live ==
    /// Returns the remaining TTL, or None if no expiration is set.
    ///
    /// Returns `Some(Duration::ZERO)` once the entry has expired.
    pub fn ttl_remaining(&self) -> Option<Duration> {
        self.expires_at.map(|expires| {
            let now = current_timestamp_ms();
            Duration::from_millis(expires.saturating_sub(now))
        })
    }
}

// == Utility Functions ==
/// Converts a TTL to whole milliseconds.
///
/// Zero stays zero, anything shorter than a millisecond rounds up to one,
/// and durations beyond `u64::MAX` milliseconds saturate.
pub fn ttl_millis(ttl: Duration) -> u64 {
    if ttl.is_zero() {
        return 0;
    }
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
