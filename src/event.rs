//! Node identity and event model (spec §3, C2).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Stable binary identifier for a node (spec GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QuineId(pub [u8; 16]);

impl QuineId {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for QuineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// `(namespace, quine_id, at_time?)` — spec §3. `at_time = None` is the live node; `Some(t)` is a
/// historical read-only snapshot at millisecond `t`. Historical refs refuse all mutations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub namespace: String,
    pub quine_id: QuineId,
    pub at_time: Option<u64>,
}

impl NodeRef {
    pub fn live(namespace: impl Into<String>, quine_id: QuineId) -> Self {
        Self {
            namespace: namespace.into(),
            quine_id,
            at_time: None,
        }
    }

    pub fn historical(namespace: impl Into<String>, quine_id: QuineId, at_time: u64) -> Self {
        Self {
            namespace: namespace.into(),
            quine_id,
            at_time: Some(at_time),
        }
    }

    pub fn is_historical(&self) -> bool {
        self.at_time.is_some()
    }
}

/// Monotonic per-node 64-bit logical clock: `(wall_millis, sequence_within_millis)`, packed so
/// that ordering by the packed `u64` matches ordering by the tuple (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTime {
    packed: u64,
}

const SEQUENCE_BITS: u32 = 16;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

impl EventTime {
    pub const MAX: EventTime = EventTime { packed: u64::MAX };
    pub const MIN: EventTime = EventTime { packed: 0 };

    pub fn new(wall_millis: u64, sequence_within_millis: u16) -> Self {
        let packed = (wall_millis << SEQUENCE_BITS) | (sequence_within_millis as u64 & SEQUENCE_MASK);
        Self { packed }
    }

    pub fn wall_millis(self) -> u64 {
        self.packed >> SEQUENCE_BITS
    }

    pub fn sequence_within_millis(self) -> u16 {
        (self.packed & SEQUENCE_MASK) as u16
    }

    /// The smallest `EventTime` strictly greater than `self`, saturating rather than wrapping.
    pub fn next(self) -> Self {
        EventTime { packed: self.packed.saturating_add(1) }
    }

    pub fn as_u64(self) -> u64 {
        self.packed
    }

    pub fn from_u64(packed: u64) -> Self {
        Self { packed }
    }
}

impl PartialOrd for EventTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.packed.cmp(&other.packed)
    }
}

impl fmt::Display for EventTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.wall_millis(), self.sequence_within_millis())
    }
}

/// Opaque property value: serialized bytes plus an optional already-deserialized view, so
/// frequently-read properties don't pay a re-parse cost (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyValue {
    pub bytes: Vec<u8>,
}

impl PropertyValue {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}
impl Eq for PropertyValue {}

pub type PropertyKey = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Out,
    In,
}

pub type EdgeLabel = String;

/// A single directed edge endpoint stored on this node (spec §3). Duplicates are forbidden;
/// insertion order is preserved for replay determinism.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HalfEdge {
    pub direction: Direction,
    pub label: EdgeLabel,
    pub peer: QuineId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyEvent {
    Set { key: PropertyKey, value: PropertyValue },
    Removed { key: PropertyKey, previous_value: PropertyValue },
}

impl PropertyEvent {
    pub fn key(&self) -> &PropertyKey {
        match self {
            PropertyEvent::Set { key, .. } => key,
            PropertyEvent::Removed { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeEvent {
    Added(HalfEdge),
    Removed(HalfEdge),
}

impl EdgeEvent {
    pub fn half_edge(&self) -> &HalfEdge {
        match self {
            EdgeEvent::Added(e) => e,
            EdgeEvent::Removed(e) => e,
        }
    }
}

pub type DgnId = String;
pub type StandingQueryId = String;
pub type SubscriberId = QuineId;
/// Identifies one partial-match branch of a `Multiple-Values SQ` (spec GLOSSARY,
/// `multiple_values_sqs: (GlobalSqId, PartId) -> ...`).
pub type PartId = String;

/// Subscription create/cancel and subscription-result messages (spec §3, four variants).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DomainIndexEvent {
    SubscriptionCreated {
        dgn_id: DgnId,
        subscriber: SubscriberId,
        related_queries: Vec<StandingQueryId>,
    },
    SubscriptionCancelled {
        dgn_id: DgnId,
        subscriber: SubscriberId,
    },
    IndexUpdate {
        from_peer: QuineId,
        dgn_id: DgnId,
        result: Option<bool>,
    },
    ReplyRequested {
        dgn_id: DgnId,
        subscriber: SubscriberId,
    },
}

/// A node-change event as seen by C5/C6 post-actions: property or edge events only (domain-index
/// events are a separate logical stream per spec §4.1).
#[derive(Debug, Clone, PartialEq)]
pub enum NodeChangeEvent {
    Property(PropertyEvent),
    Edge(EdgeEvent),
}

/// Any of the three event kinds, as journaled with its stamped `EventTime` (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Property(PropertyEvent),
    Edge(EdgeEvent),
    DomainIndex(DomainIndexEvent),
}

impl Event {
    pub fn as_node_change(&self) -> Option<NodeChangeEvent> {
        match self {
            Event::Property(p) => Some(NodeChangeEvent::Property(p.clone())),
            Event::Edge(e) => Some(NodeChangeEvent::Edge(e.clone())),
            Event::DomainIndex(_) => None,
        }
    }
}

/// A journaled event with its `EventTime`.
pub type Stamped<T> = (EventTime, T);
