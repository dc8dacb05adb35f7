//! Configuration and subscription types for the event broker.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, TryRecvError};

use crate::types::StreamEvent;

use super::manager::SubscriberSet;
use super::subscriber::Subscriber;

/// Configuration for the event manager.
#[derive(Clone, Debug)]
pub struct EventManagerConfig {
    /// Capacity of each subscriber's outgoing queue.
    /// Default: 32768
    pub buffer_size: usize,

    /// How long an eviction may spend delivering the final error frame to a
    /// slow consumer before giving up.
    /// Default: 5s
    pub slow_consumer_grace: Duration,
}

impl Default for EventManagerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 32 << 10,
            slow_consumer_grace: Duration::from_secs(5),
        }
    }
}

/// Filter predicate over events.
///
/// Must be pure and non-blocking: the broker evaluates it while holding the
/// subscriber-list lock.
pub type EventFilter = Box<dyn Fn(&StreamEvent) -> bool + Send + Sync>;

/// Filters for common subscription shapes.
pub mod filters {
    use super::EventFilter;
    use crate::types::{EventPayload, ServerId};

    /// Accept every event.
    pub fn accept_all() -> EventFilter {
        Box::new(|_| true)
    }

    /// Accept repository events only (commits, handles, migrations,
    /// tombstones).
    pub fn repo_events() -> EventFilter {
        Box::new(|evt| {
            matches!(
                evt.payload,
                EventPayload::Commit(_)
                    | EventPayload::Handle(_)
                    | EventPayload::Migrate(_)
                    | EventPayload::Tombstone(_)
            )
        })
    }

    /// Accept label events only.
    pub fn label_events() -> EventFilter {
        Box::new(|evt| {
            matches!(
                evt.payload,
                EventPayload::Labels(_) | EventPayload::LabelInfo(_)
            )
        })
    }

    /// Accept events originating from, or relevant to, one federated server.
    pub fn relevant_to(server: ServerId) -> EventFilter {
        Box::new(move |evt| {
            evt.routing.origin == Some(server) || evt.routing.relevant_servers.contains(&server)
        })
    }
}

/// Handle to an active subscription.
///
/// Events arrive on [`receiver`](Self::receiver). Cancelling (or dropping
/// the handle) detaches the subscriber and closes the queue; events already
/// queued may still be drained until the channel reports disconnection.
pub struct Subscription {
    /// Channel delivering the subscriber's events.
    pub receiver: Receiver<Arc<StreamEvent>>,

    subscriber: Arc<Subscriber>,
    set: Arc<SubscriberSet>,
}

impl Subscription {
    pub(crate) fn new(
        receiver: Receiver<Arc<StreamEvent>>,
        subscriber: Arc<Subscriber>,
        set: Arc<SubscriberSet>,
    ) -> Self {
        Self {
            receiver,
            subscriber,
            set,
        }
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<Arc<StreamEvent>, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<Arc<StreamEvent>, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Arc<StreamEvent>, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Cancel the subscription. Idempotent; safe to call from any thread.
    pub fn cancel(&self) {
        self.subscriber.cleanup(&self.set);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
