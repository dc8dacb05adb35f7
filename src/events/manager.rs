//! Event manager: fan-out, subscriptions, slow-consumer policy.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::error::{BrokerError, Result};
use crate::persist::EventPersistence;
use crate::types::{AccountId, Sequence, StreamEvent};

use super::subscriber::{EnqueueOutcome, Subscriber};
use super::types::{filters, EventFilter, EventManagerConfig, Subscription};

/// The process-wide fan-out broker.
///
/// Producers submit events through [`submit`](Self::submit); the persistence
/// layer makes each durable and hands it back through the broadcast callback,
/// which fans it out to every attached subscriber whose filter matches.
/// Consumers attach with [`subscribe`](Self::subscribe), either at the live
/// tail or from a historical sequence with transparent catch-up.
pub struct EventManager {
    subs: Arc<SubscriberSet>,
    persister: Arc<dyn EventPersistence>,
    config: EventManagerConfig,
}

impl EventManager {
    /// Create a manager with default configuration and register its
    /// broadcast callback with the persister.
    pub fn new(persister: Arc<dyn EventPersistence>) -> Self {
        Self::with_config(persister, EventManagerConfig::default())
    }

    pub fn with_config(persister: Arc<dyn EventPersistence>, config: EventManagerConfig) -> Self {
        let subs = Arc::new(SubscriberSet::new(config.slow_consumer_grace));

        let broadcast_subs = Arc::clone(&subs);
        persister.set_broadcaster(Box::new(move |evt| {
            SubscriberSet::broadcast(&broadcast_subs, &evt);
        }));

        Self {
            subs,
            persister,
            config,
        }
    }

    /// Persist one event; on success the persister broadcasts it to every
    /// matching subscriber.
    ///
    /// Persistence failures are logged and swallowed so that one bad append
    /// does not take the producer down with it. Callers that need the error
    /// should drive the persister directly.
    pub fn submit(&self, evt: StreamEvent) -> Result<()> {
        if let Err(err) = self.persister.append(evt) {
            error!(%err, "failed to persist outbound event");
        }
        Ok(())
    }

    /// Attach a subscriber.
    ///
    /// With `since = None` the subscriber joins the live tail and the handle
    /// reads straight from its queue. With a sequence, a catch-up worker
    /// replays history after `since` and hands over to the live stream with
    /// no gap and no duplicates.
    ///
    /// A `None` filter accepts every event.
    pub fn subscribe(
        &self,
        ident: impl Into<String>,
        filter: Option<EventFilter>,
        since: Option<Sequence>,
    ) -> Result<Subscription> {
        let ident = ident.into();
        let filter = filter.unwrap_or_else(filters::accept_all);
        let (sub, live_rx) = Subscriber::new(ident.clone(), filter, self.config.buffer_size);

        let Some(since) = since else {
            self.subs.add(Arc::clone(&sub));
            return Ok(Subscription::new(live_rx, sub, Arc::clone(&self.subs)));
        };

        let (out_tx, out_rx) = bounded(self.config.buffer_size);
        let worker = CatchUpWorker {
            persister: Arc::clone(&self.persister),
            set: Arc::clone(&self.subs),
            sub: Arc::clone(&sub),
            live_rx,
            out: out_tx,
        };
        thread::Builder::new()
            .name(format!("catchup-{ident}"))
            .spawn(move || worker.run(since))?;

        Ok(Subscription::new(out_rx, sub, Arc::clone(&self.subs)))
    }

    /// Remove all persisted events for an account.
    pub fn take_down_repo(&self, account: AccountId) -> Result<()> {
        self.persister.take_down_repo(account)
    }

    /// Shut down the persistence layer. Attached subscriber queues are not
    /// forcibly closed; consumers observe end-of-stream when their side
    /// closes them.
    pub fn shutdown(&self) -> Result<()> {
        self.persister.shutdown()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subs.len()
    }
}

/// The live subscriber set and its fan-out loop.
pub(crate) struct SubscriberSet {
    subs: Mutex<Vec<Arc<Subscriber>>>,
    grace: Duration,
}

impl SubscriberSet {
    pub(crate) fn new(grace: Duration) -> Self {
        Self {
            subs: Mutex::new(Vec::new()),
            grace,
        }
    }

    pub(crate) fn add(&self, sub: Arc<Subscriber>) {
        self.subs.lock().push(sub);
    }

    /// O(1) removal: swap with the last entry, then truncate.
    pub(crate) fn remove(&self, sub: &Subscriber) {
        let target: *const Subscriber = sub;
        let mut subs = self.subs.lock();
        if let Some(i) = subs.iter().position(|s| std::ptr::eq(Arc::as_ptr(s), target)) {
            subs.swap_remove(i);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.subs.lock().len()
    }

    /// Fan one event out to every matching subscriber.
    ///
    /// Holds the list lock for the duration of the loop; every
    /// per-subscriber attempt is non-blocking. A full queue detaches the
    /// eviction to its own thread so the loop never stalls on one consumer.
    fn broadcast(set: &Arc<SubscriberSet>, evt: &Arc<StreamEvent>) {
        let subs = set.subs.lock();
        for sub in subs.iter() {
            if !sub.matches(evt) {
                continue;
            }
            match sub.enqueue(evt) {
                EnqueueOutcome::Delivered | EnqueueOutcome::Gone => {}
                EnqueueOutcome::Full => {
                    warn!(
                        ident = %sub.ident(),
                        queued = sub.queued(),
                        "dropping slow consumer due to event overflow"
                    );
                    Self::evict(set, Arc::clone(sub));
                }
            }
        }
    }

    /// Evict a slow subscriber: a detached thread delivers the error frame,
    /// bounded by the grace period, and then runs cleanup.
    fn evict(set: &Arc<SubscriberSet>, sub: Arc<Subscriber>) {
        let set = Arc::clone(set);
        let grace = set.grace;
        let spawned = thread::Builder::new()
            .name(format!("evict-{}", sub.ident()))
            .spawn(move || {
                sub.deliver_eviction_notice(grace);
                sub.cleanup(&set);
            });
        if let Err(err) = spawned {
            error!(%err, "failed to spawn eviction worker");
        }
    }
}

/// Worker that stitches historical replay to the live stream for one
/// subscriber.
struct CatchUpWorker {
    persister: Arc<dyn EventPersistence>,
    set: Arc<SubscriberSet>,
    sub: Arc<Subscriber>,
    live_rx: Receiver<Arc<StreamEvent>>,
    out: Sender<Arc<StreamEvent>>,
}

impl CatchUpWorker {
    /// Deliver every event after `since`, in order, exactly once, across the
    /// replay-to-live handoff:
    ///
    /// 1. Cold replay of the log after `since`.
    /// 2. Attach live, then wait for the first sequenced live event.
    /// 3. Hot replay of the window the log accumulated meanwhile, strictly
    ///    below the first live sequence.
    /// 4. Forward the first live event, then stream the live queue.
    ///
    /// Dropping `out` on any exit closes the consumer's channel.
    fn run(self, since: Sequence) {
        let mut last_seq = since;

        // Phase 1: cold replay.
        let replayed = self.persister.playback(since, &mut |evt| {
            let seq = evt.sequence();
            self.forward(evt)?;
            if let Some(seq) = seq {
                if seq > last_seq {
                    last_seq = seq;
                }
            }
            Ok(())
        });
        if let Err(err) = replayed {
            self.log_playback_failure(&err);
            return;
        }

        // Phase 2: attach live. The first sequenced live event bounds what
        // the log must still be asked for; non-sequenced frames read here
        // are held back and forwarded after the hot replay.
        self.set.add(Arc::clone(&self.sub));

        let mut held_back = Vec::new();
        let first_seq;
        let first = loop {
            match self.live_rx.recv() {
                Ok(evt) => match evt.sequence() {
                    Some(seq) => {
                        first_seq = seq;
                        break evt;
                    }
                    None => held_back.push(evt),
                },
                // The live queue only closes through cleanup, which has
                // already detached the subscriber.
                Err(_) => return,
            }
        };

        // Phase 3: hot replay of the window persisted between the cold
        // replay and live attachment.
        let caught_up = self.persister.playback(last_seq, &mut |evt| {
            match evt.sequence() {
                Some(seq) if seq >= first_seq => Err(BrokerError::CaughtUp),
                _ => self.forward(evt),
            }
        });
        match caught_up {
            Ok(()) | Err(BrokerError::CaughtUp) => {}
            Err(err) => {
                self.log_playback_failure(&err);
                self.sub.cleanup(&self.set);
                return;
            }
        }

        // Phase 4: flush held-back frames, forward the first live event,
        // then stream the live queue.
        for evt in held_back {
            if self.forward(evt).is_err() {
                self.sub.cleanup(&self.set);
                return;
            }
        }
        if self.forward(first).is_err() {
            self.sub.cleanup(&self.set);
            return;
        }
        loop {
            match self.live_rx.recv() {
                Ok(evt) => {
                    if self.forward(evt).is_err() {
                        self.sub.cleanup(&self.set);
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }

    /// Forward one event to the merged output, or observe cancellation.
    fn forward(&self, evt: Arc<StreamEvent>) -> Result<()> {
        select! {
            recv(self.sub.done()) -> _ => Err(BrokerError::PlaybackShutdown),
            send(self.out, evt) -> sent => sent.map_err(|_| BrokerError::PlaybackShutdown),
        }
    }

    fn log_playback_failure(&self, err: &BrokerError) {
        match err {
            BrokerError::PlaybackShutdown => {
                warn!(ident = %self.sub.ident(), "events playback: {err}");
            }
            _ => {
                error!(ident = %self.sub.ident(), "events playback: {err}");
            }
        }
    }
}
