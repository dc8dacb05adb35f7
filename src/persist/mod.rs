//! Persistence port for the event broker.
//!
//! The broker drives durable storage through [`EventPersistence`]: events are
//! appended and made durable before anything is broadcast, historical
//! subscribers replay the log through [`EventPersistence::playback`], and
//! moderation removes whole accounts with
//! [`EventPersistence::take_down_repo`].

mod memory;

pub use memory::MemoryPersister;

use std::sync::Arc;

use crate::error::Result;
use crate::types::{AccountId, Sequence, StreamEvent};

/// Broadcast callback registered by the event manager.
///
/// Implementations must invoke it exactly once per successfully appended
/// event, after durability, in sequence order.
pub type Broadcaster = Box<dyn Fn(Arc<StreamEvent>) + Send + Sync>;

/// Visitor driven by [`EventPersistence::playback`].
///
/// Returning [`BrokerError::PlaybackShutdown`] or [`BrokerError::CaughtUp`]
/// stops the iteration; playback propagates the error to its caller.
///
/// [`BrokerError::PlaybackShutdown`]: crate::error::BrokerError::PlaybackShutdown
/// [`BrokerError::CaughtUp`]: crate::error::BrokerError::CaughtUp
pub type PlaybackVisitor<'a> = dyn FnMut(Arc<StreamEvent>) -> Result<()> + 'a;

/// The contract the broker depends on for durable event storage.
pub trait EventPersistence: Send + Sync {
    /// Assign a sequence to sequenced variants, durably record the event,
    /// and return only once it is durable.
    fn append(&self, evt: StreamEvent) -> Result<()>;

    /// Invoke `visit` for every persisted event with sequence greater than
    /// `since`, in sequence order. Sequence gaps are expected and visitors
    /// must tolerate them.
    fn playback(&self, since: Sequence, visit: &mut PlaybackVisitor<'_>) -> Result<()>;

    /// Remove (or mark removed) all events for an account.
    fn take_down_repo(&self, account: AccountId) -> Result<()>;

    /// Register the broadcast callback, replacing any previous one.
    fn set_broadcaster(&self, broadcast: Broadcaster);

    /// Flush and release resources. Subsequent appends must fail.
    fn shutdown(&self) -> Result<()>;
}
