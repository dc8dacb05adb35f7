//! Core types for the firehose event stream.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position in the event log.
///
/// Assigned by the persistence layer at append time, strictly increasing
/// across all sequenced events. Gaps are possible where events have been
/// taken down; replay tolerates them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub i64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }
}

/// Internal identifier for an account (the owner of a repository).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(pub u64);

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self.0)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Internal identifier for a federated server.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId(pub u64);

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerId({})", self.0)
    }
}

/// Routing metadata attached to every event for filter evaluation.
///
/// Never serialized to consumers; the framing layer sees only the payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Routing {
    /// Account whose repository originated the event.
    pub account: Option<AccountId>,

    /// Server the event was received from.
    pub origin: Option<ServerId>,

    /// Servers this event is relevant to.
    pub relevant_servers: Vec<ServerId>,
}

/// A commit to an account's repository.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepoCommit {
    pub seq: Sequence,
    /// DID of the repository.
    pub repo: String,
    /// CID of the commit.
    pub commit: String,
    /// CID of the previous commit, if any.
    pub prev: Option<String>,
    pub rebase: bool,
    /// Set when the block slice was too large to inline.
    pub too_big: bool,
    /// CAR slice carrying the commit blocks.
    pub blocks: Vec<u8>,
    pub ops: Vec<CommitOp>,
    /// CIDs of blobs referenced by this commit.
    pub blobs: Vec<String>,
    pub time: String,
}

/// A single mutation inside a commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitOp {
    pub action: OpAction,
    /// Record path, e.g. `app.feed.post/3jx...`.
    pub path: String,
    /// CID of the new record; absent for deletes.
    pub cid: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpAction {
    Create,
    Update,
    Delete,
}

/// An account changed its handle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepoHandle {
    pub seq: Sequence,
    pub did: String,
    pub handle: String,
    pub time: String,
}

/// An account migrated to another server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepoMigrate {
    pub seq: Sequence,
    pub did: String,
    pub migrate_to: Option<String>,
    pub time: String,
}

/// An account's repository was deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepoTombstone {
    pub seq: Sequence,
    pub did: String,
    pub time: String,
}

/// Connection metadata frame. Carries no sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepoInfo {
    pub name: String,
    pub message: Option<String>,
}

/// A batch of moderation labels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabelBatch {
    pub seq: Sequence,
    pub labels: Vec<Label>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Label {
    /// DID of the labeler.
    pub src: String,
    /// Subject of the label (account or record URI).
    pub uri: String,
    pub cid: Option<String>,
    /// Label value, e.g. `spam`.
    pub val: String,
    /// True when this negates an earlier label.
    pub neg: bool,
    pub cts: String,
}

/// Label-stream metadata frame. Carries no sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabelInfo {
    pub name: String,
    pub message: Option<String>,
}

/// Terminal error frame delivered to a subscriber before its stream closes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
    pub message: String,
}

/// The tagged union of firehose frames. Exactly one variant per event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    Commit(RepoCommit),
    Handle(RepoHandle),
    Info(RepoInfo),
    Migrate(RepoMigrate),
    Tombstone(RepoTombstone),
    Labels(LabelBatch),
    LabelInfo(LabelInfo),
    Error(ErrorFrame),
}

/// One event on the firehose: a payload plus private routing metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub payload: EventPayload,

    /// Filter-evaluation metadata; skipped by serialization so it can never
    /// reach a consumer.
    #[serde(skip)]
    pub routing: Routing,
}

impl StreamEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            routing: Routing::default(),
        }
    }

    pub fn with_routing(payload: EventPayload, routing: Routing) -> Self {
        Self { payload, routing }
    }

    /// Synthetic error frame, e.g. the slow-consumer eviction notice.
    pub fn error(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventPayload::Error(ErrorFrame {
            error: error.into(),
            message: message.into(),
        }))
    }

    /// The log sequence, or `None` for info and error frames.
    pub fn sequence(&self) -> Option<Sequence> {
        match &self.payload {
            EventPayload::Commit(c) => Some(c.seq),
            EventPayload::Handle(h) => Some(h.seq),
            EventPayload::Migrate(m) => Some(m.seq),
            EventPayload::Tombstone(t) => Some(t.seq),
            EventPayload::Labels(l) => Some(l.seq),
            EventPayload::Info(_) | EventPayload::LabelInfo(_) | EventPayload::Error(_) => None,
        }
    }

    /// Assign the log sequence. Returns false for variants that carry none.
    pub fn set_sequence(&mut self, seq: Sequence) -> bool {
        match &mut self.payload {
            EventPayload::Commit(c) => c.seq = seq,
            EventPayload::Handle(h) => h.seq = seq,
            EventPayload::Migrate(m) => m.seq = seq,
            EventPayload::Tombstone(t) => t.seq = seq,
            EventPayload::Labels(l) => l.seq = seq,
            EventPayload::Info(_) | EventPayload::LabelInfo(_) | EventPayload::Error(_) => {
                return false
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tombstone(seq: i64) -> StreamEvent {
        StreamEvent::new(EventPayload::Tombstone(RepoTombstone {
            seq: Sequence(seq),
            did: "did:plc:abc".into(),
            time: "2024-01-01T00:00:00Z".into(),
        }))
    }

    #[test]
    fn test_sequence_accessor() {
        assert_eq!(tombstone(7).sequence(), Some(Sequence(7)));

        let info = StreamEvent::new(EventPayload::Info(RepoInfo {
            name: "OutdatedCursor".into(),
            message: None,
        }));
        assert_eq!(info.sequence(), None);

        let err = StreamEvent::error("ConsumerTooSlow", "");
        assert_eq!(err.sequence(), None);
    }

    #[test]
    fn test_set_sequence() {
        let mut evt = tombstone(0);
        assert!(evt.set_sequence(Sequence(42)));
        assert_eq!(evt.sequence(), Some(Sequence(42)));

        let mut info = StreamEvent::new(EventPayload::Info(RepoInfo {
            name: "OutdatedCursor".into(),
            message: None,
        }));
        assert!(!info.set_sequence(Sequence(42)));
        assert_eq!(info.sequence(), None);
    }

    #[test]
    fn test_routing_is_not_serialized() {
        let evt = StreamEvent::with_routing(
            EventPayload::Tombstone(RepoTombstone {
                seq: Sequence(1),
                did: "did:plc:abc".into(),
                time: "2024-01-01T00:00:00Z".into(),
            }),
            Routing {
                account: Some(AccountId(9)),
                origin: Some(ServerId(3)),
                relevant_servers: vec![ServerId(3), ServerId(4)],
            },
        );

        let value = serde_json::to_value(&evt).unwrap();
        assert!(value.get("routing").is_none());
        assert!(value.get("payload").is_some());

        // Round-trip drops routing entirely.
        let back: StreamEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.routing, Routing::default());
        assert_eq!(back.payload, evt.payload);
    }

    #[test]
    fn test_sequence_ordering() {
        assert!(Sequence(1) < Sequence(2));
        assert_eq!(Sequence(5).next(), Sequence(6));
    }
}
