//! In-memory fakes for the external collaborators this crate expects (spec §6, §9). Mirrors
//! `swarm::event_store.rs`'s `BanyanStore::test(name)` fixture-constructor convention: cheap,
//! synchronous-to-build, no real backend required.
//!
//! Only compiled for tests (`dev-dependencies` only reach this module via `#[cfg(test)]` on the
//! declaration in `lib.rs`), so it's free to take shortcuts (everything held behind a plain
//! `parking_lot::Mutex`) a production `Persistor` backend would not.

use crate::dgn::{DgnRegistryHandle, DomainGraphNode, PeerLink, SubscriberRef};
use crate::error::PersistorError;
use crate::event::{DgnId, DomainIndexEvent, EventTime, NodeChangeEvent, QuineId, StandingQueryId};
use crate::persistor::{DomainIndexBatch, JournalEvent, NodeChangeBatch, Persistor, StandingQueryMetadataStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Journal {
    node_changes: Vec<(EventTime, NodeChangeEvent)>,
    domain_index: Vec<(EventTime, DomainIndexEvent)>,
    snapshots: Vec<(EventTime, Vec<u8>)>,
}

/// A `Persistor` backed entirely by in-process `Vec`s, keyed per `QuineId`.
#[derive(Default)]
pub struct InMemoryPersistor {
    journals: Mutex<HashMap<QuineId, Journal>>,
}

impl InMemoryPersistor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistor for InMemoryPersistor {
    async fn persist_node_change_events(&self, qid: QuineId, events: NodeChangeBatch) -> Result<(), PersistorError> {
        self.journals.lock().entry(qid).or_default().node_changes.extend(events);
        Ok(())
    }

    async fn persist_domain_index_events(&self, qid: QuineId, events: DomainIndexBatch) -> Result<(), PersistorError> {
        self.journals.lock().entry(qid).or_default().domain_index.extend(events);
        Ok(())
    }

    async fn persist_snapshot(&self, qid: QuineId, at: EventTime, bytes: Vec<u8>) -> Result<(), PersistorError> {
        let mut journals = self.journals.lock();
        let journal = journals.entry(qid).or_default();
        journal.snapshots.retain(|(existing_at, _)| *existing_at != at);
        journal.snapshots.push((at, bytes));
        Ok(())
    }

    async fn get_journal_with_time(
        &self,
        qid: QuineId,
        from: EventTime,
        to: EventTime,
        include_domain_index: bool,
    ) -> Result<Vec<(EventTime, JournalEvent)>, PersistorError> {
        let journals = self.journals.lock();
        let Some(journal) = journals.get(&qid) else { return Ok(vec![]) };
        let mut out: Vec<(EventTime, JournalEvent)> = journal
            .node_changes
            .iter()
            .filter(|(at, _)| *at >= from && *at <= to)
            .map(|(at, e)| (*at, JournalEvent::NodeChange(e.clone())))
            .collect();
        if include_domain_index {
            out.extend(
                journal
                    .domain_index
                    .iter()
                    .filter(|(at, _)| *at >= from && *at <= to)
                    .map(|(at, e)| (*at, JournalEvent::DomainIndex(e.clone()))),
            );
        }
        out.sort_by_key(|(at, _)| *at);
        Ok(out)
    }

    async fn get_latest_snapshot(&self, qid: QuineId, at_or_before: EventTime) -> Result<Option<(EventTime, Vec<u8>)>, PersistorError> {
        let journals = self.journals.lock();
        let Some(journal) = journals.get(&qid) else { return Ok(None) };
        Ok(journal
            .snapshots
            .iter()
            .filter(|(at, _)| *at <= at_or_before)
            .max_by_key(|(at, _)| *at)
            .cloned())
    }
}

/// Wraps another `Persistor` so its writes fail a fixed number of times (`Transient`) before
/// succeeding, or fail forever (`Permanent`) — for exercising `MemoryFirst` retry and
/// `PersistorFirst` failure-surfacing behavior (spec §7 scenarios).
pub struct FailingPersistor<P> {
    inner: P,
    remaining_transient_failures: AtomicUsize,
    permanent: bool,
}

impl<P: Persistor> FailingPersistor<P> {
    pub fn transient_then_succeed(inner: P, failures: usize) -> Self {
        Self { inner, remaining_transient_failures: AtomicUsize::new(failures), permanent: false }
    }

    pub fn permanently_failing(inner: P) -> Self {
        Self { inner, remaining_transient_failures: AtomicUsize::new(0), permanent: true }
    }

    fn maybe_fail(&self) -> Result<(), PersistorError> {
        if self.permanent {
            return Err(PersistorError::permanent("fixture: permanent failure"));
        }
        let remaining = self.remaining_transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_transient_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(PersistorError::transient("fixture: transient failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl<P: Persistor> Persistor for FailingPersistor<P> {
    async fn persist_node_change_events(&self, qid: QuineId, events: NodeChangeBatch) -> Result<(), PersistorError> {
        self.maybe_fail()?;
        self.inner.persist_node_change_events(qid, events).await
    }

    async fn persist_domain_index_events(&self, qid: QuineId, events: DomainIndexBatch) -> Result<(), PersistorError> {
        self.maybe_fail()?;
        self.inner.persist_domain_index_events(qid, events).await
    }

    async fn persist_snapshot(&self, qid: QuineId, at: EventTime, bytes: Vec<u8>) -> Result<(), PersistorError> {
        self.maybe_fail()?;
        self.inner.persist_snapshot(qid, at, bytes).await
    }

    async fn get_journal_with_time(
        &self,
        qid: QuineId,
        from: EventTime,
        to: EventTime,
        include_domain_index: bool,
    ) -> Result<Vec<(EventTime, JournalEvent)>, PersistorError> {
        self.inner.get_journal_with_time(qid, from, to, include_domain_index).await
    }

    async fn get_latest_snapshot(&self, qid: QuineId, at_or_before: EventTime) -> Result<Option<(EventTime, Vec<u8>)>, PersistorError> {
        self.inner.get_latest_snapshot(qid, at_or_before).await
    }
}

/// A fixed, in-process global DGN registry (spec §9: "inject as an explicit handle").
#[derive(Default)]
pub struct InMemoryDgnRegistry {
    definitions: Mutex<HashMap<DgnId, DomainGraphNode>>,
}

impl InMemoryDgnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, def: DomainGraphNode) {
        self.definitions.lock().insert(def.id.clone(), def);
    }

    pub fn unregister(&self, dgn_id: &DgnId) {
        self.definitions.lock().remove(dgn_id);
    }
}

impl DgnRegistryHandle for InMemoryDgnRegistry {
    fn is_registered(&self, dgn_id: &DgnId) -> bool {
        self.definitions.lock().contains_key(dgn_id)
    }

    fn get(&self, dgn_id: &DgnId) -> Option<DomainGraphNode> {
        self.definitions.lock().get(dgn_id).cloned()
    }
}

/// Records cross-node messaging calls instead of sending them anywhere, for assertions in tests.
#[derive(Default)]
pub struct RecordingPeerLink {
    pub subscriptions: Mutex<Vec<(QuineId, DgnId, HashSet<StandingQueryId>, bool)>>,
    pub cancellations: Mutex<Vec<(QuineId, DgnId)>>,
    pub notifications: Mutex<Vec<(SubscriberRef, DgnId, bool)>>,
}

impl RecordingPeerLink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerLink for RecordingPeerLink {
    fn subscribe_to_peer(&self, peer: QuineId, dgn_id: DgnId, related_queries: HashSet<StandingQueryId>, should_send_replies: bool) {
        self.subscriptions.lock().push((peer, dgn_id, related_queries, should_send_replies));
    }

    fn cancel_peer_subscription(&self, peer: QuineId, dgn_id: DgnId) {
        self.cancellations.lock().push((peer, dgn_id));
    }

    fn notify_subscriber(&self, subscriber: SubscriberRef, dgn_id: DgnId, result: bool) {
        self.notifications.lock().push((subscriber, dgn_id, result));
    }
}

/// In-process fixture for standing-query metadata CRUD (spec §6), backing `sync_standing_queries`
/// in tests the same way `InMemoryPersistor` backs the journal/snapshot store.
#[derive(Default)]
pub struct InMemoryStandingQueryMetadataStore {
    entries: Mutex<HashMap<StandingQueryId, Vec<u8>>>,
}

impl InMemoryStandingQueryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_sync(&self, id: StandingQueryId, bytes: Vec<u8>) {
        self.entries.lock().insert(id, bytes);
    }
}

#[async_trait]
impl StandingQueryMetadataStore for InMemoryStandingQueryMetadataStore {
    async fn list(&self) -> Result<Vec<StandingQueryId>, PersistorError> {
        Ok(self.entries.lock().keys().cloned().collect())
    }

    async fn get(&self, id: &StandingQueryId) -> Result<Option<Vec<u8>>, PersistorError> {
        Ok(self.entries.lock().get(id).cloned())
    }

    async fn put(&self, id: StandingQueryId, bytes: Vec<u8>) -> Result<(), PersistorError> {
        self.entries.lock().insert(id, bytes);
        Ok(())
    }

    async fn delete(&self, id: &StandingQueryId) -> Result<(), PersistorError> {
        self.entries.lock().remove(id);
        Ok(())
    }
}

/// Convenience constructor bundle for tests that don't care about DGN/peer/standing-query
/// collaborator behavior at all.
pub fn noop_collaborators() -> (Arc<InMemoryDgnRegistry>, Arc<RecordingPeerLink>, Arc<InMemoryStandingQueryMetadataStore>) {
    (Arc::new(InMemoryDgnRegistry::new()), Arc::new(RecordingPeerLink::new()), Arc::new(InMemoryStandingQueryMetadataStore::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EdgeEvent, HalfEdge};

    fn qid(b: u8) -> QuineId {
        QuineId::new([b; 16])
    }

    #[tokio::test]
    async fn in_memory_persistor_round_trips_node_changes() {
        let persistor = InMemoryPersistor::new();
        let q = qid(1);
        let edge = HalfEdge { direction: crate::event::Direction::Out, label: "knows".into(), peer: qid(2) };
        let batch = vec![(EventTime::new(1, 0), NodeChangeEvent::Edge(EdgeEvent::Added(edge)))];
        persistor.persist_node_change_events(q, batch.clone()).await.unwrap();

        let read = persistor.get_journal_with_time(q, EventTime::MIN, EventTime::MAX, false).await.unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test]
    async fn failing_persistor_recovers_after_configured_failures() {
        let inner = InMemoryPersistor::new();
        let failing = FailingPersistor::transient_then_succeed(inner, 2);
        let q = qid(3);
        assert!(failing.persist_snapshot(q, EventTime::MIN, vec![1]).await.is_err());
        assert!(failing.persist_snapshot(q, EventTime::MIN, vec![1]).await.is_err());
        assert!(failing.persist_snapshot(q, EventTime::MIN, vec![1]).await.is_ok());
    }

    #[tokio::test]
    async fn failing_persistor_permanent_never_recovers() {
        let inner = InMemoryPersistor::new();
        let failing = FailingPersistor::permanently_failing(inner);
        let q = qid(4);
        let err = failing.persist_snapshot(q, EventTime::MIN, vec![1]).await.unwrap_err();
        assert!(err.is_permanent());
    }
}
