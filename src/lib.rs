//! # firehose-broker
//!
//! An event fan-out broker between a durable firehose log and many
//! long-lived streaming subscribers.
//!
//! ## Core Concepts
//!
//! - **Events**: tagged frames (commits, handle changes, migrations,
//!   tombstones, labels, info) with a log sequence assigned at append time
//! - **Persistence port**: the append-then-broadcast contract the broker
//!   drives; an in-memory implementation ships with the crate
//! - **Subscribers**: bounded per-consumer queues with filters and
//!   slow-consumer eviction
//! - **Catch-up**: subscribe from any past sequence and hand over to the
//!   live stream with no gaps and no duplicates
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use firehose_broker::{EventManager, MemoryPersister, Sequence};
//!
//! let manager = EventManager::new(Arc::new(MemoryPersister::new()));
//!
//! // Attach a live subscriber.
//! let live = manager.subscribe("relay-1", None, None)?;
//!
//! // Publish an event; every matching subscriber receives it.
//! manager.submit(commit_event)?;
//!
//! // Join from a historical cursor and catch up to the live tail.
//! let replaying = manager.subscribe("relay-2", None, Some(Sequence(50)))?;
//! ```

pub mod error;
pub mod events;
pub mod persist;
pub mod types;

// Re-exports
pub use error::{BrokerError, Result};
pub use events::{filters, EventFilter, EventManager, EventManagerConfig, Subscription};
pub use persist::{Broadcaster, EventPersistence, MemoryPersister, PlaybackVisitor};
pub use types::*;
