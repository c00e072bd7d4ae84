//! Error types for the cache
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for cache construction and invalidation plumbing.
///
/// Read and write operations on a live cache never return these; only
/// construction and the transport layer do.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Configuration rejected at construction time
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Pub/sub transport failed to publish or subscribe
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalidation payload could not be encoded or decoded
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;
