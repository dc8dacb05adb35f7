//! Event fan-out: the broker, subscribers, and subscription handles.
//!
//! This module sits between the persistence port and the streaming
//! transport:
//! - Producers call [`EventManager::submit`]; the event is made durable and
//!   then broadcast to every matching subscriber.
//! - Consumers call [`EventManager::subscribe`], either at the live tail or
//!   from a historical sequence with transparent catch-up.
//! - Slow consumers are evicted with a best-effort `ConsumerTooSlow` error
//!   frame instead of stalling the fan-out.
//!
//! # Example
//!
//! ```ignore
//! let manager = EventManager::new(Arc::new(MemoryPersister::new()));
//!
//! // Join from sequence 50 and catch up to the live stream.
//! let sub = manager.subscribe("indexer", None, Some(Sequence(50)))?;
//!
//! loop {
//!     match sub.recv() {
//!         Ok(evt) => println!("got event: {:?}", evt.sequence()),
//!         Err(_) => break, // evicted or cancelled
//!     }
//! }
//! ```

mod manager;
mod subscriber;
mod types;

pub use manager::EventManager;
pub use types::{filters, EventFilter, EventManagerConfig, Subscription};
