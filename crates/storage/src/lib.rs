//! Storage layer for Rosterline
//!
//! This crate provides the durable key-value substrate, the tiered response
//! cache, and the offline mutation queue.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod clock;
pub mod kv;
pub mod queue;

pub use cache::{CacheEntry, CacheError, CacheStore, TierConfig};
pub use clock::{Clock, ManualClock, SystemClock};
pub use kv::{KvConfig, KvError, KvStore, KvTree};
pub use queue::{MutationId, MutationRequest, MutationType, OfflineQueue, QueueError, QueuedMutation};
