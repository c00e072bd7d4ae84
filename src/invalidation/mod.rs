//! Invalidation Module
//!
//! Keeps instances of the same logical cache consistent across processes by
//! broadcasting deletions and resets over a pub/sub transport.
//!
//! # Topics
//! - `<name>:delete` - `DeleteKeys` events
//! - `<name>:reset` - `ResetAll` events

mod coordinator;
mod event;
mod transport;

pub use coordinator::InvalidationCoordinator;
pub use event::{delete_topic, reset_topic, InvalidationEvent};
pub use transport::{ChannelPubSub, LocalPubSub, MessageHandler, PubSub, Subscription};
