//! A single attached consumer: filter, bounded queue, lifecycle.

use std::sync::{Arc, Once};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use metrics::{counter, Counter};
use parking_lot::Mutex;
use tracing::warn;

use crate::types::StreamEvent;

use super::manager::SubscriberSet;
use super::types::EventFilter;

/// Outcome of a non-blocking enqueue attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EnqueueOutcome {
    /// The event was queued.
    Delivered,
    /// The subscriber is cancelled or mid-cleanup; discard silently.
    Gone,
    /// The queue is full; the subscriber must be evicted.
    Full,
}

/// One attached consumer.
pub(crate) struct Subscriber {
    ident: String,
    filter: EventFilter,
    state: Mutex<SubscriberState>,

    /// Disconnects when cleanup drops the sender half; forwarders blocked on
    /// behalf of this subscriber select on it.
    done: Receiver<()>,

    cleanup_once: Once,
    enqueued_counter: Counter,
    broadcast_counter: Counter,
}

struct SubscriberState {
    /// Sender half of the outgoing queue; taken on cleanup to close it.
    outgoing: Option<Sender<Arc<StreamEvent>>>,

    /// Dropped on cleanup to signal done.
    done_tx: Option<Sender<()>>,

    /// Set once an eviction notice has been attempted, so overlapping
    /// evictions deliver at most one frame.
    eviction_notified: bool,

    cleaned_up: bool,
}

impl Subscriber {
    /// Create a subscriber and hand back the receiving half of its queue.
    pub(crate) fn new(
        ident: String,
        filter: EventFilter,
        buffer_size: usize,
    ) -> (Arc<Self>, Receiver<Arc<StreamEvent>>) {
        let (outgoing_tx, outgoing_rx) = bounded(buffer_size);
        let (done_tx, done_rx) = bounded(0);

        let enqueued_counter = counter!("firehose_events_enqueued_total", "ident" => ident.clone());
        let broadcast_counter =
            counter!("firehose_events_broadcast_total", "ident" => ident.clone());

        let sub = Arc::new(Self {
            ident,
            filter,
            state: Mutex::new(SubscriberState {
                outgoing: Some(outgoing_tx),
                done_tx: Some(done_tx),
                eviction_notified: false,
                cleaned_up: false,
            }),
            done: done_rx,
            cleanup_once: Once::new(),
            enqueued_counter,
            broadcast_counter,
        });

        (sub, outgoing_rx)
    }

    pub(crate) fn ident(&self) -> &str {
        &self.ident
    }

    pub(crate) fn matches(&self, evt: &StreamEvent) -> bool {
        (self.filter)(evt)
    }

    pub(crate) fn done(&self) -> &Receiver<()> {
        &self.done
    }

    /// Non-blocking enqueue. Never waits: a subscriber mutex held by an
    /// in-flight eviction counts as gone.
    pub(crate) fn enqueue(&self, evt: &Arc<StreamEvent>) -> EnqueueOutcome {
        self.enqueued_counter.increment(1);

        let Some(state) = self.state.try_lock() else {
            return EnqueueOutcome::Gone;
        };
        let Some(outgoing) = state.outgoing.as_ref() else {
            return EnqueueOutcome::Gone;
        };

        match outgoing.try_send(Arc::clone(evt)) {
            Ok(()) => {
                self.broadcast_counter.increment(1);
                EnqueueOutcome::Delivered
            }
            Err(TrySendError::Full(_)) => EnqueueOutcome::Full,
            Err(TrySendError::Disconnected(_)) => EnqueueOutcome::Gone,
        }
    }

    /// Current queue depth, for logging.
    pub(crate) fn queued(&self) -> usize {
        self.state
            .try_lock()
            .and_then(|state| state.outgoing.as_ref().map(|tx| tx.len()))
            .unwrap_or(0)
    }

    /// Best-effort delivery of the eviction error frame. Holds the
    /// subscriber mutex for at most `grace` and sends at most one frame.
    pub(crate) fn deliver_eviction_notice(&self, grace: Duration) {
        let mut state = self.state.lock();
        if state.cleaned_up || state.eviction_notified {
            return;
        }
        state.eviction_notified = true;

        let Some(outgoing) = state.outgoing.as_ref() else {
            return;
        };
        let frame = Arc::new(StreamEvent::error("ConsumerTooSlow", ""));
        if outgoing.send_timeout(frame, grace).is_err() {
            warn!(ident = %self.ident, "failed to send error frame to backed up consumer");
        }
    }

    /// Tear the subscriber down: close the done channel, detach from the
    /// broker, close the outgoing queue. Runs at most once regardless of how
    /// many paths invoke it; the queue may still be drained until empty.
    pub(crate) fn cleanup(&self, set: &SubscriberSet) {
        self.cleanup_once.call_once(|| {
            let mut state = self.state.lock();
            state.done_tx.take();
            set.remove(self);
            state.outgoing.take();
            state.cleaned_up = true;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::filters;
    use crate::types::{EventPayload, RepoTombstone, Sequence};

    fn event(seq: i64) -> Arc<StreamEvent> {
        Arc::new(StreamEvent::new(EventPayload::Tombstone(RepoTombstone {
            seq: Sequence(seq),
            did: "did:plc:abc".into(),
            time: "2024-01-01T00:00:00Z".into(),
        })))
    }

    #[test]
    fn test_enqueue_outcomes() {
        let (sub, rx) = Subscriber::new("test".into(), filters::accept_all(), 2);

        assert_eq!(sub.enqueue(&event(1)), EnqueueOutcome::Delivered);
        assert_eq!(sub.enqueue(&event(2)), EnqueueOutcome::Delivered);
        assert_eq!(sub.enqueue(&event(3)), EnqueueOutcome::Full);

        // Draining makes room again.
        rx.recv().unwrap();
        assert_eq!(sub.enqueue(&event(3)), EnqueueOutcome::Delivered);
    }

    #[test]
    fn test_enqueue_after_cleanup_is_gone() {
        let set = SubscriberSet::new(Duration::from_secs(5));
        let (sub, rx) = Subscriber::new("test".into(), filters::accept_all(), 2);

        sub.enqueue(&event(1));
        sub.cleanup(&set);

        assert_eq!(sub.enqueue(&event(2)), EnqueueOutcome::Gone);

        // The queued event survives cleanup; then the channel closes.
        assert!(rx.recv().is_ok());
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_cleanup_runs_once() {
        let set = SubscriberSet::new(Duration::from_secs(5));
        let (sub, rx) = Subscriber::new("test".into(), filters::accept_all(), 2);

        sub.cleanup(&set);
        sub.cleanup(&set);
        sub.cleanup(&set);

        assert!(rx.recv().is_err());
        assert!(sub.done().try_recv().is_err());
    }

    #[test]
    fn test_eviction_notice_sent_once() {
        let (sub, rx) = Subscriber::new("test".into(), filters::accept_all(), 4);

        sub.deliver_eviction_notice(Duration::from_millis(100));
        sub.deliver_eviction_notice(Duration::from_millis(100));

        let frame = rx.try_recv().unwrap();
        assert!(matches!(&frame.payload, EventPayload::Error(e) if e.error == "ConsumerTooSlow"));
        assert!(rx.try_recv().is_err());
    }
}
