//! The persistor interface (spec §4.1, C1).
//!
//! Only the interface is specified here; concrete backends (Cassandra/MapDB/RocksDB in the
//! original system) are out of scope per spec.md §1. Grounded on the teacher's `EventStore` trait
//! in `swarm::event_store.rs` (an abstract backend interface the store drives) and, for the
//! async-trait shape, the `convex`/`eventually-rs` reference examples.

use crate::error::PersistorError;
use crate::event::{DomainIndexEvent, EventTime, NodeChangeEvent, QuineId, StandingQueryId};
use async_trait::async_trait;

/// A non-empty, time-ordered batch of node-change events to persist atomically (spec §4.1: "all
/// effectful events in the batch are journaled or none").
pub type NodeChangeBatch = Vec<(EventTime, NodeChangeEvent)>;
pub type DomainIndexBatch = Vec<(EventTime, DomainIndexEvent)>;

/// A single record read back from the journal, tagged by kind (spec §6 "Journal record").
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEvent {
    NodeChange(NodeChangeEvent),
    DomainIndex(DomainIndexEvent),
}

/// Abstract journal + snapshot store for a single node's durable history (spec §4.1).
///
/// All operations may fail with a retryable `PersistorError::Transient`, or a terminal
/// `PersistorError::Permanent`. Ordering guarantee: within one `persist_*` call events are durable
/// atomically or not at all; across calls, durability matches call order only when the caller
/// awaits each completion before issuing the next — the node actor does so for all per-node
/// writes (spec §4.1).
#[async_trait]
pub trait Persistor: Send + Sync + 'static {
    /// Appends `events` to the node-change journal stream, in order. `events` must be non-empty;
    /// callers (the `guard_events` pipeline) never invoke this with an empty batch.
    async fn persist_node_change_events(
        &self,
        qid: QuineId,
        events: NodeChangeBatch,
    ) -> Result<(), PersistorError>;

    /// Appends `events` to the domain-index journal stream — a separate logical stream from
    /// node-change events (spec §4.1).
    async fn persist_domain_index_events(
        &self,
        qid: QuineId,
        events: DomainIndexBatch,
    ) -> Result<(), PersistorError>;

    /// Writes a snapshot. When `singleton` is set the caller passes `at = EventTime::MAX` and the
    /// write replaces any prior snapshot; otherwise snapshots are keyed by their creation time.
    async fn persist_snapshot(
        &self,
        qid: QuineId,
        at: EventTime,
        bytes: Vec<u8>,
    ) -> Result<(), PersistorError>;

    /// Reads the journal for `qid` in the inclusive range `[from, to]`, across both logical
    /// streams when `include_domain_index` is set, merged in `EventTime` order.
    async fn get_journal_with_time(
        &self,
        qid: QuineId,
        from: EventTime,
        to: EventTime,
        include_domain_index: bool,
    ) -> Result<Vec<(EventTime, JournalEvent)>, PersistorError>;

    /// Returns the most recent snapshot at or before `at_or_before`, if any.
    async fn get_latest_snapshot(
        &self,
        qid: QuineId,
        at_or_before: EventTime,
    ) -> Result<Option<(EventTime, Vec<u8>)>, PersistorError>;
}

/// Standing-query metadata CRUD (spec §6: "out of core scope for this document, but the core
/// expects list/get/put/delete by `sq_id` with durable semantics"). Kept as a narrow, separate
/// trait so a `Persistor` implementation can back it the same way as the journal/snapshot store
/// without C4 needing to know the storage details.
#[async_trait]
pub trait StandingQueryMetadataStore: Send + Sync + 'static {
    async fn list(&self) -> Result<Vec<StandingQueryId>, PersistorError>;
    async fn get(&self, id: &StandingQueryId) -> Result<Option<Vec<u8>>, PersistorError>;
    async fn put(&self, id: StandingQueryId, bytes: Vec<u8>) -> Result<(), PersistorError>;
    async fn delete(&self, id: &StandingQueryId) -> Result<(), PersistorError>;
}
