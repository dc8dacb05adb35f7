//! In-memory event persistence.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{BrokerError, Result};
use crate::types::{AccountId, Sequence, StreamEvent};

use super::{Broadcaster, EventPersistence, PlaybackVisitor};

/// Vec-backed [`EventPersistence`] implementation.
///
/// Keeps the whole log in memory; suited to tests and single-process
/// deployments that can afford to lose history on restart. Appends are
/// serialized under one lock and the broadcast callback runs inside it, so
/// the callback fires exactly once per event, in sequence order.
pub struct MemoryPersister {
    log: Mutex<MemoryLog>,
    broadcaster: RwLock<Option<Broadcaster>>,
}

struct MemoryLog {
    events: Vec<Arc<StreamEvent>>,
    next_seq: Sequence,
    shut_down: bool,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(MemoryLog {
                events: Vec::new(),
                next_seq: Sequence(1),
                shut_down: false,
            }),
            broadcaster: RwLock::new(None),
        }
    }

    /// Number of events currently retained.
    pub fn len(&self) -> usize {
        self.log.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().events.is_empty()
    }
}

impl Default for MemoryPersister {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPersistence for MemoryPersister {
    fn append(&self, mut evt: StreamEvent) -> Result<()> {
        let mut log = self.log.lock();
        if log.shut_down {
            return Err(BrokerError::Shutdown);
        }

        let seq = log.next_seq;
        if evt.set_sequence(seq) {
            log.next_seq = seq.next();
        }

        let evt = Arc::new(evt);
        log.events.push(Arc::clone(&evt));

        // Broadcast inside the append lock; concurrent appends would
        // otherwise race their callbacks out of sequence order.
        let broadcaster = self.broadcaster.read();
        if let Some(broadcast) = broadcaster.as_ref() {
            broadcast(evt);
        }

        Ok(())
    }

    fn playback(&self, since: Sequence, visit: &mut PlaybackVisitor<'_>) -> Result<()> {
        // Snapshot under the lock and visit outside it; a visitor blocked on
        // a full subscriber queue must not stall appends.
        let snapshot: Vec<Arc<StreamEvent>> = {
            let log = self.log.lock();
            log.events
                .iter()
                .filter(|evt| matches!(evt.sequence(), Some(seq) if seq > since))
                .cloned()
                .collect()
        };

        for evt in snapshot {
            visit(evt)?;
        }
        Ok(())
    }

    fn take_down_repo(&self, account: AccountId) -> Result<()> {
        let mut log = self.log.lock();
        log.events
            .retain(|evt| evt.routing.account != Some(account));
        Ok(())
    }

    fn set_broadcaster(&self, broadcast: Broadcaster) {
        *self.broadcaster.write() = Some(broadcast);
    }

    fn shutdown(&self) -> Result<()> {
        let mut log = self.log.lock();
        log.shut_down = true;
        *self.broadcaster.write() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventPayload, RepoInfo, RepoTombstone, Routing};

    fn tombstone(account: u64) -> StreamEvent {
        StreamEvent::with_routing(
            EventPayload::Tombstone(RepoTombstone {
                seq: Sequence(0),
                did: format!("did:plc:{account}"),
                time: "2024-01-01T00:00:00Z".into(),
            }),
            Routing {
                account: Some(AccountId(account)),
                ..Default::default()
            },
        )
    }

    fn collect_sequences(persister: &MemoryPersister, since: i64) -> Vec<i64> {
        let mut seqs = Vec::new();
        persister
            .playback(Sequence(since), &mut |evt| {
                seqs.push(evt.sequence().unwrap().0);
                Ok(())
            })
            .unwrap();
        seqs
    }

    #[test]
    fn test_append_assigns_monotonic_sequences() {
        let persister = MemoryPersister::new();
        for account in [1, 2, 3] {
            persister.append(tombstone(account)).unwrap();
        }
        assert_eq!(collect_sequences(&persister, 0), vec![1, 2, 3]);
    }

    #[test]
    fn test_info_frames_consume_no_sequence() {
        let persister = MemoryPersister::new();
        persister.append(tombstone(1)).unwrap();
        persister
            .append(StreamEvent::new(EventPayload::Info(RepoInfo {
                name: "OutdatedCursor".into(),
                message: None,
            })))
            .unwrap();
        persister.append(tombstone(2)).unwrap();

        // The info frame is retained but invisible to playback.
        assert_eq!(persister.len(), 3);
        assert_eq!(collect_sequences(&persister, 0), vec![1, 2]);
    }

    #[test]
    fn test_playback_starts_strictly_after_cursor() {
        let persister = MemoryPersister::new();
        for account in 1..=10 {
            persister.append(tombstone(account)).unwrap();
        }
        assert_eq!(collect_sequences(&persister, 7), vec![8, 9, 10]);
        assert_eq!(collect_sequences(&persister, 10), Vec::<i64>::new());
    }

    #[test]
    fn test_playback_stops_on_sentinel() {
        let persister = MemoryPersister::new();
        for account in 1..=5 {
            persister.append(tombstone(account)).unwrap();
        }

        let mut seen = Vec::new();
        let result = persister.playback(Sequence(0), &mut |evt| {
            let seq = evt.sequence().unwrap();
            if seq >= Sequence(3) {
                return Err(BrokerError::CaughtUp);
            }
            seen.push(seq.0);
            Ok(())
        });
        assert!(matches!(result, Err(BrokerError::CaughtUp)));
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_takedown_leaves_gaps() {
        let persister = MemoryPersister::new();
        for account in [1, 2, 1, 3, 1] {
            persister.append(tombstone(account)).unwrap();
        }

        persister.take_down_repo(AccountId(1)).unwrap();

        assert_eq!(collect_sequences(&persister, 0), vec![2, 4]);
        // New appends keep counting past the removed range.
        persister.append(tombstone(4)).unwrap();
        assert_eq!(collect_sequences(&persister, 0), vec![2, 4, 6]);
    }

    #[test]
    fn test_broadcaster_sees_assigned_sequences_in_order() {
        let persister = MemoryPersister::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        persister.set_broadcaster(Box::new(move |evt| {
            sink.lock().push(evt.sequence().unwrap().0);
        }));

        for account in [1, 2, 3] {
            persister.append(tombstone(account)).unwrap();
        }
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_append_fails_after_shutdown() {
        let persister = MemoryPersister::new();
        persister.append(tombstone(1)).unwrap();
        persister.shutdown().unwrap();

        assert!(matches!(
            persister.append(tombstone(2)),
            Err(BrokerError::Shutdown)
        ));
        // Already-persisted events stay readable.
        assert_eq!(collect_sequences(&persister, 0), vec![1]);
    }
}
