//! The node actor core (spec §4.4, C4) — the per-node message loop that owns a single node's
//! mutable state exclusively, the way the teacher's store owns its state behind one lock domain.
//!
//! Split the way `swarm::lib.rs` splits `BanyanStore{,Data,State,Guard}`: [`NodeData`] is the
//! immutable collaborators and configuration handed in at construction; [`NodeState`] is the
//! mutable in-memory state only the running actor task ever touches; [`NodeActor`] owns both and
//! runs the message loop. External callers never see either — they get a [`NodeHandle`], grounded
//! on `swarm::event_store_ref.rs`'s request-enum-plus-oneshot-reply shape.

use crate::clock::ActorClock;
use crate::config::{EffectOrder, NodeConfig};
use crate::dgn::{DgnEngine, DgnRegistryHandle, PeerLink, SubscriberRef};
use crate::edge_processor::{self, EdgeSet};
use crate::error::{InternalInvariantViolation, NodeError, PersistorError};
use crate::event::{
    DomainIndexEvent, EdgeEvent, EdgeLabel, EventTime, HalfEdge, NodeChangeEvent, NodeRef, PartId, PropertyEvent, PropertyKey,
    PropertyValue, QuineId, StandingQueryId,
};
use crate::hash::get_node_hash;
use crate::index::{LocalEventIndex, Subscriber};
use crate::persistor::{DomainIndexBatch, JournalEvent, NodeChangeBatch, Persistor, StandingQueryMetadataStore};
use crate::snapshot::{Snapshot, SnapshotCodec, SubscriberRecord};
use crate::wake::{ActorRefLock, WakefulState};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Capacity of a node's inbound message channel. Senders beyond this block, same as any bounded
/// `mpsc` channel; a node with a persistently full inbox needs sharding attention, not a bigger
/// buffer.
const MESSAGE_BUFFER: usize = 256;

/// Immutable collaborators and configuration, shared into the actor task at spawn time.
struct NodeData {
    node_ref: NodeRef,
    config: NodeConfig,
    persistor: Arc<dyn Persistor>,
    dgn_registry: Arc<dyn DgnRegistryHandle>,
    peer_link: Arc<dyn PeerLink>,
    snapshot_codec: Arc<dyn SnapshotCodec>,
    standing_query_store: Arc<dyn StandingQueryMetadataStore>,
    healthy: Arc<AtomicBool>,
    actor_ref_lock: Arc<ActorRefLock>,
}

/// Per-node metadata for one partial-match branch of a `MultipleValuesSq` (spec §3:
/// `multiple_values_sqs: (GlobalSqId, PartId) -> (subscribers, partial-match state)`). The bytes a
/// `StandingQueryMetadataStore` hands back are opaque to the persistor; this is the schema this
/// crate itself uses to decode them, mirroring `DomainGraphNode`'s required-properties/edges shape
/// in `dgn.rs` but evaluated purely against this node's own state (no peer-index dependency).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StandingQueryMetadata {
    required_properties: Vec<(PropertyKey, PropertyValue)>,
    required_edge_labels: Vec<EdgeLabel>,
    subscribers: Vec<SubscriberRef>,
}

/// Per-node-per-part tracked answer for one `StandingQueryMetadata` (spec §3, §4.7 step 5).
struct MultipleValuesSqState {
    metadata: StandingQueryMetadata,
    last_notification: Option<bool>,
}

fn mvsq_local_match(metadata: &StandingQueryMetadata, properties: &HashMap<PropertyKey, PropertyValue>, edges: &EdgeSet) -> bool {
    let props_ok = metadata.required_properties.iter().all(|(key, value)| properties.get(key) == Some(value));
    let edges_ok = metadata.required_edge_labels.iter().all(|label| edges.iter().any(|e| &e.label == label));
    props_ok && edges_ok
}

/// Mutable in-memory state, exclusively owned by the running [`NodeActor`].
struct NodeState {
    properties: HashMap<PropertyKey, PropertyValue>,
    edges: EdgeSet,
    local_index: LocalEventIndex,
    dgn_engine: DgnEngine,
    multiple_values_sqs: HashMap<(StandingQueryId, PartId), MultipleValuesSqState>,
    clock: ActorClock,
    /// Set on every effective write, cleared when a snapshot is taken (spec §4.4, §6). Used by an
    /// operator/shard to decide whether a node is worth snapshotting before sleep.
    latest_update_after_snapshot: Option<EventTime>,
}

impl NodeState {
    fn empty() -> Self {
        Self {
            properties: HashMap::new(),
            edges: EdgeSet::new(),
            local_index: LocalEventIndex::new(),
            dgn_engine: DgnEngine::new(),
            multiple_values_sqs: HashMap::new(),
            clock: ActorClock::new(),
            latest_update_after_snapshot: None,
        }
    }
}

/// A snapshot of debugging-relevant state, returned by `debug_internal_state` (SPEC_FULL.md §D
/// supplement — richer than the one-line description in spec.md).
#[derive(Debug, Clone)]
pub struct DebugState {
    pub node_ref: NodeRef,
    pub properties: HashMap<PropertyKey, PropertyValue>,
    pub edges: Vec<HalfEdge>,
    pub healthy: bool,
    pub subscribed_dgn_ids: Vec<String>,
    pub multiple_values_sq_answers: Vec<(StandingQueryId, PartId, Option<bool>)>,
    pub latest_update_after_snapshot: Option<EventTime>,
    pub wakeful_state: WakefulState,
    pub cost_to_sleep: u64,
}

enum WriteJob {
    NodeChange(NodeChangeBatch),
    DomainIndex(DomainIndexBatch),
    Snapshot { at: EventTime, bytes: Vec<u8>, singleton: bool },
}

/// The background fire-and-forget persistence worker for `MemoryFirst` writes (spec §4.3). A
/// single task per node, so writes for one node are still persisted in submission order even
/// though they never block the message loop — grounded on `util::pinned_resource.rs`'s
/// single-dedicated-task resource-owning idiom and the teacher's `JoinHandle` task bookkeeping.
struct WriteLane {
    tx: mpsc::UnboundedSender<WriteJob>,
    _task: tokio::task::JoinHandle<()>,
}

impl WriteLane {
    fn spawn(qid: QuineId, persistor: Arc<dyn Persistor>, retry: crate::config::RetryConfig, healthy: Arc<AtomicBool>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob>();
        let task = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let outcome = match job {
                    WriteJob::NodeChange(batch) => {
                        let persistor = persistor.clone();
                        edge_processor::retry_forever(retry, "node-change-write", move || {
                            let persistor = persistor.clone();
                            let batch = batch.clone();
                            async move { persistor.persist_node_change_events(qid, batch).await }
                        })
                        .await
                    }
                    WriteJob::DomainIndex(batch) => {
                        let persistor = persistor.clone();
                        edge_processor::retry_forever(retry, "domain-index-write", move || {
                            let persistor = persistor.clone();
                            let batch = batch.clone();
                            async move { persistor.persist_domain_index_events(qid, batch).await }
                        })
                        .await
                    }
                    WriteJob::Snapshot { at, bytes, singleton } => {
                        let persistor = persistor.clone();
                        let write_at = if singleton { EventTime::MAX } else { at };
                        edge_processor::retry_forever(retry, "snapshot-write", move || {
                            let persistor = persistor.clone();
                            let bytes = bytes.clone();
                            async move { persistor.persist_snapshot(qid, write_at, bytes).await }
                        })
                        .await
                    }
                };
                if let edge_processor::RetryOutcome::GaveUpPermanently(e) = outcome {
                    tracing::error!(node = %qid, error = %e, "write lane giving up permanently, marking node unhealthy");
                    healthy.store(false, Ordering::SeqCst);
                }
            }
        });
        Self { tx, _task: task }
    }

    fn enqueue(&self, job: WriteJob) {
        // The receiver only goes away if the actor task has ended; a send failing there is moot,
        // the node is gone either way.
        let _ = self.tx.send(job);
    }
}

/// Messages accepted by a running [`NodeActor`], mirroring `swarm::event_store_ref.rs`'s
/// `EventStoreRequest` request-enum-plus-oneshot shape.
enum NodeMessage {
    ProcessPropertyEvents {
        events: Vec<PropertyEvent>,
        at_override: Option<EventTime>,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    ProcessEdgeEvents {
        events: Vec<EdgeEvent>,
        at_override: Option<EventTime>,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    ProcessDomainIndexEvent {
        event: DomainIndexEvent,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    SnapshotNow {
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    DebugInternalState {
        reply: oneshot::Sender<DebugState>,
    },
    GetNodeHash {
        reply: oneshot::Sender<u64>,
    },
}

/// Cheap, cloneable external reference to a running node actor (spec §6 "To callers"). Sending on
/// a handle after the actor has ended (e.g. after an `InternalInvariantViolation` panic) surfaces
/// as [`NodeError::Gone`].
#[derive(Clone)]
pub struct NodeHandle {
    tx: mpsc::Sender<NodeMessage>,
    healthy: Arc<AtomicBool>,
    node_ref: NodeRef,
    actor_ref_lock: Arc<ActorRefLock>,
}

impl NodeHandle {
    pub fn node_ref(&self) -> &NodeRef {
        &self.node_ref
    }

    /// The lock a `ShardRouter` consults before delivering to this node (spec §4.7, §6).
    pub fn actor_ref_lock(&self) -> Arc<ActorRefLock> {
        self.actor_ref_lock.clone()
    }

    /// Non-blocking health check (SPEC_FULL.md §D supplement): backed by a shared atomic rather
    /// than a round-trip message, so routing decisions don't wait on the actor's inbox.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub async fn process_property_event(&self, event: PropertyEvent) -> Result<(), NodeError> {
        self.process_property_events(vec![event]).await
    }

    pub async fn process_property_event_at(&self, event: PropertyEvent, at: EventTime) -> Result<(), NodeError> {
        self.send_property_batch(vec![event], Some(at)).await
    }

    pub async fn process_property_events(&self, events: Vec<PropertyEvent>) -> Result<(), NodeError> {
        self.send_property_batch(events, None).await
    }

    async fn send_property_batch(&self, events: Vec<PropertyEvent>, at_override: Option<EventTime>) -> Result<(), NodeError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(NodeMessage::ProcessPropertyEvents { events, at_override, reply })
            .await
            .map_err(|_| NodeError::Gone)?;
        reply_rx.await.map_err(|_| NodeError::Gone)?
    }

    pub async fn process_edge_event(&self, event: EdgeEvent) -> Result<(), NodeError> {
        self.process_edge_events(vec![event]).await
    }

    pub async fn process_edge_event_at(&self, event: EdgeEvent, at: EventTime) -> Result<(), NodeError> {
        self.send_edge_batch(vec![event], Some(at)).await
    }

    pub async fn process_edge_events(&self, events: Vec<EdgeEvent>) -> Result<(), NodeError> {
        self.send_edge_batch(events, None).await
    }

    async fn send_edge_batch(&self, events: Vec<EdgeEvent>, at_override: Option<EventTime>) -> Result<(), NodeError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(NodeMessage::ProcessEdgeEvents { events, at_override, reply })
            .await
            .map_err(|_| NodeError::Gone)?;
        reply_rx.await.map_err(|_| NodeError::Gone)?
    }

    pub async fn process_domain_index_event(&self, event: DomainIndexEvent) -> Result<(), NodeError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx.send(NodeMessage::ProcessDomainIndexEvent { event, reply }).await.map_err(|_| NodeError::Gone)?;
        reply_rx.await.map_err(|_| NodeError::Gone)?
    }

    pub async fn snapshot_now(&self) -> Result<(), NodeError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx.send(NodeMessage::SnapshotNow { reply }).await.map_err(|_| NodeError::Gone)?;
        reply_rx.await.map_err(|_| NodeError::Gone)?
    }

    pub async fn debug_internal_state(&self) -> Result<DebugState, NodeError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx.send(NodeMessage::DebugInternalState { reply }).await.map_err(|_| NodeError::Gone)?;
        reply_rx.await.map_err(|_| NodeError::Gone)
    }

    pub async fn get_node_hash(&self) -> Result<u64, NodeError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx.send(NodeMessage::GetNodeHash { reply }).await.map_err(|_| NodeError::Gone)?;
        reply_rx.await.map_err(|_| NodeError::Gone)
    }
}

/// Only property `Set`/`Removed` need their own effect-check: unlike edges they have no ordered
/// dedup container of their own, so there's no dedicated "property processor" module (spec only
/// names C3 for edges).
fn property_has_effect(properties: &HashMap<PropertyKey, PropertyValue>, event: &PropertyEvent) -> bool {
    match event {
        PropertyEvent::Set { key, value } => properties.get(key) != Some(value),
        PropertyEvent::Removed { key, .. } => properties.contains_key(key),
    }
}

fn property_apply(properties: &mut HashMap<PropertyKey, PropertyValue>, event: &PropertyEvent) {
    match event {
        PropertyEvent::Set { key, value } => {
            properties.insert(key.clone(), value.clone());
        }
        PropertyEvent::Removed { key, .. } => {
            properties.remove(key);
        }
    }
}

fn node_change_has_effect(state: &NodeState, event: &NodeChangeEvent) -> bool {
    match event {
        NodeChangeEvent::Property(p) => property_has_effect(&state.properties, p),
        NodeChangeEvent::Edge(e) => edge_processor::has_effect(&state.edges, e),
    }
}

fn apply_node_change(state: &mut NodeState, event: &NodeChangeEvent) {
    match event {
        NodeChangeEvent::Property(p) => property_apply(&mut state.properties, p),
        NodeChangeEvent::Edge(e) => edge_processor::apply(&mut state.edges, e),
    }
}

/// Keeps only the last event per property key within one submitted batch (spec §3 invariant 4);
/// edges have no such intra-batch collapsing rule, so non-property events always survive.
fn dedup_batch(events: Vec<NodeChangeEvent>) -> Vec<NodeChangeEvent> {
    let mut last_index_for_key: HashMap<PropertyKey, usize> = HashMap::new();
    let mut keep = vec![true; events.len()];
    for (i, event) in events.iter().enumerate() {
        if let NodeChangeEvent::Property(p) = event {
            if let Some(&prev) = last_index_for_key.get(p.key()) {
                keep[prev] = false;
            }
            last_index_for_key.insert(p.key().clone(), i);
        }
    }
    events.into_iter().zip(keep).filter_map(|(e, k)| k.then_some(e)).collect()
}

/// Applies one domain-index event to `dgn_engine` (spec §4.6). Shared between live processing and
/// journal replay; replay always passes `should_send_replies = false` (spec: "replay suppresses
/// notifications").
fn apply_domain_index_event(
    dgn_engine: &mut DgnEngine,
    registry: &dyn DgnRegistryHandle,
    peer_link: &dyn PeerLink,
    properties: &HashMap<PropertyKey, PropertyValue>,
    edges: &EdgeSet,
    event: DomainIndexEvent,
    should_send_replies: bool,
) {
    match event {
        DomainIndexEvent::SubscriptionCreated { dgn_id, subscriber, related_queries } => {
            dgn_engine.receive_domain_node_subscription(
                registry,
                peer_link,
                properties,
                edges,
                SubscriberRef::Peer(subscriber),
                dgn_id,
                related_queries,
                should_send_replies,
            );
        }
        DomainIndexEvent::SubscriptionCancelled { dgn_id, subscriber } => {
            dgn_engine.cancel_subscription(registry, peer_link, edges, &dgn_id, Some(&SubscriberRef::Peer(subscriber)));
        }
        DomainIndexEvent::IndexUpdate { from_peer, dgn_id, result } => {
            dgn_engine.receive_index_update(registry, peer_link, properties, edges, from_peer, dgn_id, result, should_send_replies);
        }
        DomainIndexEvent::ReplyRequested { dgn_id, subscriber } => {
            if should_send_replies {
                dgn_engine.reply_to(peer_link, &dgn_id, SubscriberRef::Peer(subscriber));
            }
        }
    }
}

/// Owns a single node's mutable state exclusively; runs the message loop that is this crate's
/// single-writer guarantee (spec §3, §9).
struct NodeActor {
    data: NodeData,
    state: NodeState,
    write_lane: WriteLane,
}

impl NodeActor {
    /// Starts the actor task and returns a handle to it immediately; restoration from the
    /// persistor (snapshot + journal replay) runs inside the task, so messages sent before
    /// restoration completes simply queue in the bounded channel (spec §4.7 wake sequence).
    pub fn spawn(
        node_ref: NodeRef,
        config: NodeConfig,
        persistor: Arc<dyn Persistor>,
        dgn_registry: Arc<dyn DgnRegistryHandle>,
        peer_link: Arc<dyn PeerLink>,
        snapshot_codec: Arc<dyn SnapshotCodec>,
        standing_query_store: Arc<dyn StandingQueryMetadataStore>,
    ) -> NodeHandle {
        let healthy = Arc::new(AtomicBool::new(true));
        let actor_ref_lock = Arc::new(ActorRefLock::new());
        let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
        let handle = NodeHandle { tx, healthy: healthy.clone(), node_ref: node_ref.clone(), actor_ref_lock: actor_ref_lock.clone() };

        let write_lane = WriteLane::spawn(node_ref.quine_id, persistor.clone(), config.retry, healthy.clone());
        let data = NodeData {
            node_ref,
            config,
            persistor,
            dgn_registry,
            peer_link,
            snapshot_codec,
            standing_query_store,
            healthy,
            actor_ref_lock,
        };

        tokio::spawn(async move {
            data.actor_ref_lock.transition(|_| WakefulState::Waking);
            let state = match NodeActor::restore(&data).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::error!(node = %data.node_ref.quine_id, error = %e, "failed to restore node on wake, marking unhealthy");
                    data.healthy.store(false, Ordering::SeqCst);
                    NodeState::empty()
                }
            };
            data.actor_ref_lock.transition(|_| WakefulState::Awake);
            data.actor_ref_lock.record_wake();
            let actor = NodeActor { data, state, write_lane };
            actor.run(rx).await;
        });

        handle
    }

    /// Reconstructs [`NodeState`] from the latest snapshot (if any) plus the journal tail after
    /// it, bounded by `node_ref.at_time` for historical refs (spec §4.7, §3).
    async fn restore(data: &NodeData) -> Result<NodeState, PersistorError> {
        let qid = data.node_ref.quine_id;
        let upper_bound = data.node_ref.at_time.map(|millis| EventTime::new(millis, u16::MAX)).unwrap_or(EventTime::MAX);

        let latest = data.persistor.get_latest_snapshot(qid, upper_bound).await?;

        let (mut properties, mut edges, mut dgn_engine, mut last_applied) = match latest {
            Some((at, bytes)) => {
                let snapshot = data.snapshot_codec.decode(&bytes).map_err(|e| PersistorError::permanent(e.to_string()))?;
                let subscriptions = snapshot
                    .subscribers
                    .into_iter()
                    .map(|(id, rec): (String, SubscriberRecord)| (id, (rec.subscribers, rec.last_notification, rec.related_queries)))
                    .collect();
                let engine = DgnEngine::restore(subscriptions, snapshot.domain_node_index);
                (snapshot.properties, snapshot.edge_set(), engine, Some(at))
            }
            None => (HashMap::new(), EdgeSet::new(), DgnEngine::new(), None),
        };

        let from = last_applied.map(EventTime::next).unwrap_or(EventTime::MIN);
        let journal = data.persistor.get_journal_with_time(qid, from, upper_bound, true).await?;

        for (at, record) in journal {
            match record {
                JournalEvent::NodeChange(NodeChangeEvent::Property(p)) => property_apply(&mut properties, &p),
                JournalEvent::NodeChange(NodeChangeEvent::Edge(e)) => edge_processor::apply(&mut edges, &e),
                JournalEvent::DomainIndex(event) => {
                    apply_domain_index_event(
                        &mut dgn_engine,
                        data.dgn_registry.as_ref(),
                        data.peer_link.as_ref(),
                        &properties,
                        &edges,
                        event,
                        false,
                    );
                }
            }
            last_applied = Some(at);
        }

        let dgn_ids: Vec<String> = dgn_engine.subscribed_dgn_ids().cloned().collect();
        let watches: Vec<(String, HashSet<PropertyKey>, HashSet<String>)> = dgn_ids
            .iter()
            .map(|id| {
                let (props, labels) = dgn_engine.watched_properties_and_edges(data.dgn_registry.as_ref(), id);
                (id.clone(), props, labels)
            })
            .collect();

        let (mut local_index, stale) = LocalEventIndex::reconstruct(
            watches.iter().map(|(id, props, labels)| (id, props, labels, false)),
            std::iter::empty(),
            |id| data.dgn_registry.is_registered(id),
        );

        for dgn_id in &stale {
            dgn_engine.cancel_subscription(data.dgn_registry.as_ref(), data.peer_link.as_ref(), &edges, dgn_id, None);
        }

        let multiple_values_sqs = Self::sync_standing_queries(data, &properties, &edges, &mut local_index).await?;

        Ok(NodeState {
            properties,
            edges,
            local_index,
            dgn_engine,
            multiple_values_sqs,
            clock: last_applied.map(ActorClock::restored_at).unwrap_or_else(ActorClock::new),
            latest_update_after_snapshot: None,
        })
    }

    /// Spec §4.7 wake-sequence step 5: register any standing queries created while asleep
    /// (nothing persisted about them was known to `reconstruct`, above, since that only rebuilds
    /// DGN subscriptions) and cancel watches for any the metadata store no longer lists. Initial
    /// results are always emitted for the surviving set, since `last_notification` starts `None`
    /// and is therefore always "new" under the same change-detection rule
    /// `DgnEngine::update_answer_and_notify_subscribers` uses.
    ///
    /// `PartId` is derived from this node's own `quine_id` (SPEC_FULL.md §F Open Question
    /// decision): one partial-match branch per node per standing query, since the metadata store
    /// is keyed by `sq_id` alone (spec §6) and this crate has no broader partial-match engine to
    /// hand out finer-grained part ids.
    async fn sync_standing_queries(
        data: &NodeData,
        properties: &HashMap<PropertyKey, PropertyValue>,
        edges: &EdgeSet,
        local_index: &mut LocalEventIndex,
    ) -> Result<HashMap<(StandingQueryId, PartId), MultipleValuesSqState>, PersistorError> {
        let part_id: PartId = data.node_ref.quine_id.to_string();
        let mut multiple_values_sqs = HashMap::new();

        for sq_id in data.standing_query_store.list().await? {
            let Some(bytes) = data.standing_query_store.get(&sq_id).await? else { continue };
            let metadata: StandingQueryMetadata = match serde_cbor::from_slice(&bytes) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(node = %data.node_ref.quine_id, sq_id = %sq_id, error = %e, "failed to decode standing query metadata during wake sync, skipping");
                    continue;
                }
            };

            let subscriber = Subscriber::MultipleValuesSq(sq_id.clone(), part_id.clone());
            for (key, _) in &metadata.required_properties {
                local_index.watch_property(key.clone(), subscriber.clone());
            }
            for label in &metadata.required_edge_labels {
                local_index.watch_edge_label(label.clone(), subscriber.clone());
            }

            let answer = mvsq_local_match(&metadata, properties, edges);
            for sub in &metadata.subscribers {
                data.peer_link.notify_subscriber(sub.clone(), sq_id.clone(), answer);
            }
            multiple_values_sqs.insert((sq_id, part_id.clone()), MultipleValuesSqState { metadata, last_notification: Some(answer) });
        }

        Ok(multiple_values_sqs)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<NodeMessage>) {
        let mut inbox: VecDeque<NodeMessage> = VecDeque::new();
        loop {
            let msg = match inbox.pop_front() {
                Some(m) => m,
                None => match rx.recv().await {
                    Some(m) => m,
                    None => break,
                },
            };
            self.dispatch(msg, &mut rx, &mut inbox).await;
        }
        self.data.actor_ref_lock.transition(|_| WakefulState::GoingToSleep);
        self.data.actor_ref_lock.transition(|_| WakefulState::Asleep);
        tracing::debug!(node = %self.data.node_ref.quine_id, "node actor loop ended");
    }

    async fn dispatch(&mut self, msg: NodeMessage, rx: &mut mpsc::Receiver<NodeMessage>, inbox: &mut VecDeque<NodeMessage>) {
        match msg {
            NodeMessage::ProcessPropertyEvents { events, at_override, reply } => {
                let raw = events.into_iter().map(NodeChangeEvent::Property).collect();
                let result = self.handle_node_change_batch(raw, at_override, rx, inbox).await;
                let _ = reply.send(result);
            }
            NodeMessage::ProcessEdgeEvents { events, at_override, reply } => {
                let raw = events.into_iter().map(NodeChangeEvent::Edge).collect();
                let result = self.handle_node_change_batch(raw, at_override, rx, inbox).await;
                let _ = reply.send(result);
            }
            NodeMessage::ProcessDomainIndexEvent { event, reply } => {
                let result = self.handle_domain_index_event(event, rx, inbox).await;
                let _ = reply.send(result);
            }
            NodeMessage::SnapshotNow { reply } => {
                // spec §4.4: "forces a snapshot (no-op on historical)".
                let result = if self.data.node_ref.is_historical() { Ok(()) } else { self.trigger_snapshot(rx, inbox).await };
                let _ = reply.send(result);
            }
            NodeMessage::DebugInternalState { reply } => {
                let _ = reply.send(self.debug_state());
            }
            NodeMessage::GetNodeHash { reply } => {
                let hash = get_node_hash(self.data.node_ref.quine_id, &self.state.properties, &self.state.edges);
                let _ = reply.send(hash);
            }
        }
    }

    /// The generic C4 persist-and-apply pipeline (spec §4.4), shared by the property and edge
    /// paths: reject historical refs, filter no-ops, stamp, persist (ordering per `EffectOrder`),
    /// apply in-memory, run post-actions.
    async fn handle_node_change_batch(
        &mut self,
        raw: Vec<NodeChangeEvent>,
        at_override: Option<EventTime>,
        rx: &mut mpsc::Receiver<NodeMessage>,
        inbox: &mut VecDeque<NodeMessage>,
    ) -> Result<(), NodeError> {
        if self.data.node_ref.is_historical() {
            return Err(NodeError::IllegalHistoricalUpdate);
        }
        if !self.data.healthy.load(Ordering::SeqCst) {
            return Err(NodeError::Unhealthy);
        }

        let deduped = dedup_batch(raw);
        let effective: Vec<NodeChangeEvent> = deduped.into_iter().filter(|e| node_change_has_effect(&self.state, e)).collect();
        if effective.is_empty() {
            return Ok(());
        }

        let times = self.state.clock.tick_many(effective.len(), at_override);
        let stamped: Vec<(EventTime, NodeChangeEvent)> = times.into_iter().zip(effective).collect();

        match self.data.config.effect_order {
            EffectOrder::PersistorFirst => {
                let persistor = self.data.persistor.clone();
                let qid = self.data.node_ref.quine_id;
                let batch = stamped.clone();
                let result = self.pause_until(async move { persistor.persist_node_change_events(qid, batch).await }, rx, inbox).await;
                if let Err(e) = result {
                    if e.is_permanent() {
                        self.data.healthy.store(false, Ordering::SeqCst);
                    }
                    return Err(e.into());
                }
            }
            EffectOrder::MemoryFirst => {
                self.write_lane.enqueue(WriteJob::NodeChange(stamped.clone()));
            }
        }

        if self.data.node_ref.is_historical() {
            InternalInvariantViolation::panic("historical-update reaching mutation path in handle_node_change_batch");
        }
        for (_, event) in &stamped {
            apply_node_change(&mut self.state, event);
        }
        self.notify_node_update(&stamped, rx, inbox).await
    }

    async fn handle_domain_index_event(
        &mut self,
        event: DomainIndexEvent,
        rx: &mut mpsc::Receiver<NodeMessage>,
        inbox: &mut VecDeque<NodeMessage>,
    ) -> Result<(), NodeError> {
        if self.data.node_ref.is_historical() {
            return Err(NodeError::IllegalHistoricalUpdate);
        }
        if !self.data.healthy.load(Ordering::SeqCst) {
            return Err(NodeError::Unhealthy);
        }

        let at = self.state.clock.tick_event_sequence();
        let stamped: DomainIndexBatch = vec![(at, event.clone())];

        match self.data.config.effect_order {
            EffectOrder::PersistorFirst => {
                let persistor = self.data.persistor.clone();
                let qid = self.data.node_ref.quine_id;
                let batch = stamped.clone();
                let result = self.pause_until(async move { persistor.persist_domain_index_events(qid, batch).await }, rx, inbox).await;
                if let Err(e) = result {
                    if e.is_permanent() {
                        self.data.healthy.store(false, Ordering::SeqCst);
                    }
                    return Err(e.into());
                }
            }
            EffectOrder::MemoryFirst => {
                self.write_lane.enqueue(WriteJob::DomainIndex(stamped));
            }
        }

        if let DomainIndexEvent::SubscriptionCreated { dgn_id, .. } = &event {
            let (props, labels) = self.state.dgn_engine.watched_properties_and_edges(self.data.dgn_registry.as_ref(), dgn_id);
            let sub = Subscriber::DomainNodeIndex(dgn_id.clone());
            for key in props {
                self.state.local_index.watch_property(key, sub.clone());
            }
            for label in labels {
                self.state.local_index.watch_edge_label(label, sub.clone());
            }
        }

        if self.data.node_ref.is_historical() {
            InternalInvariantViolation::panic("historical-update reaching mutation path in handle_domain_index_event");
        }
        apply_domain_index_event(
            &mut self.state.dgn_engine,
            self.data.dgn_registry.as_ref(),
            self.data.peer_link.as_ref(),
            &self.state.properties,
            &self.state.edges,
            event,
            true,
        );

        if self.data.config.snapshot_on_update {
            self.trigger_snapshot(rx, inbox).await?;
        }
        Ok(())
    }

    /// Post-actions (spec §4.5/§4.6): fans a node-change event out through the local event index,
    /// recomputing this node's answer for any domain-graph node it's locally evaluated for and any
    /// multiple-values standing query it's tracking.
    fn run_post_actions(&mut self, event: &NodeChangeEvent) {
        let mut dgn_ids = Vec::new();
        let mut mvsq_keys = Vec::new();
        self.state.local_index.standing_queries_watching(event, |s| {
            match s {
                Subscriber::DomainNodeIndex(id) => dgn_ids.push(id.clone()),
                Subscriber::MultipleValuesSq(sq_id, part_id) => mvsq_keys.push((sq_id.clone(), part_id.clone())),
            }
            false
        });
        for dgn_id in dgn_ids {
            self.state.dgn_engine.update_answer_and_notify_subscribers(
                self.data.dgn_registry.as_ref(),
                self.data.peer_link.as_ref(),
                &self.state.properties,
                &self.state.edges,
                &dgn_id,
                true,
            );
        }
        for key in mvsq_keys {
            self.update_mvsq_answer_and_notify(&key);
        }
    }

    /// Recomputes the tracked answer for one `(sq_id, part_id)` branch and notifies its
    /// subscribers if it changed (spec §3, §4.7 step 5's change-detection convention, mirroring
    /// `DgnEngine::update_answer_and_notify_subscribers`).
    fn update_mvsq_answer_and_notify(&mut self, key: &(StandingQueryId, PartId)) {
        let Some(state) = self.state.multiple_values_sqs.get_mut(key) else { return };
        let answer = mvsq_local_match(&state.metadata, &self.state.properties, &self.state.edges);
        if state.last_notification == Some(answer) {
            return;
        }
        state.last_notification = Some(answer);
        for subscriber in state.metadata.subscribers.clone() {
            self.data.peer_link.notify_subscriber(subscriber, key.0.clone(), answer);
        }
    }

    async fn notify_node_update(
        &mut self,
        stamped: &[(EventTime, NodeChangeEvent)],
        rx: &mut mpsc::Receiver<NodeMessage>,
        inbox: &mut VecDeque<NodeMessage>,
    ) -> Result<(), NodeError> {
        if let Some((last_time, _)) = stamped.last() {
            self.state.latest_update_after_snapshot = Some(*last_time);
        }
        for (_, event) in stamped {
            self.run_post_actions(event);
        }
        if self.data.config.snapshot_on_update {
            self.trigger_snapshot(rx, inbox).await?;
        }
        Ok(())
    }

    fn build_snapshot(&self) -> Snapshot {
        let at = self.state.clock.peek_event_sequence().unwrap_or(EventTime::MIN);
        let subscribers = self
            .state
            .dgn_engine
            .export_subscriptions()
            .into_iter()
            .map(|(id, (subscribers, last_notification, related_queries))| {
                (id, SubscriberRecord { subscribers, last_notification, related_queries })
            })
            .collect();
        Snapshot {
            at,
            properties: self.state.properties.clone(),
            edges: self.state.edges.iter().cloned().collect(),
            subscribers,
            domain_node_index: self.state.dgn_engine.domain_node_index().clone(),
        }
    }

    /// Writes a snapshot now (spec §4.4, §6). Per the resolution of SPEC_FULL.md Open Question 3,
    /// the dirty marker is cleared before the write is confirmed durable: a crash between here and
    /// the write landing loses the marker, so a future wake could under-report staleness. Accepted
    /// as specified rather than redesigned.
    async fn trigger_snapshot(&mut self, rx: &mut mpsc::Receiver<NodeMessage>, inbox: &mut VecDeque<NodeMessage>) -> Result<(), NodeError> {
        let snapshot = self.build_snapshot();
        let bytes = self.data.snapshot_codec.encode(&snapshot);
        let at = snapshot.at;
        self.state.latest_update_after_snapshot = None;

        match self.data.config.effect_order {
            EffectOrder::PersistorFirst => {
                let persistor = self.data.persistor.clone();
                let qid = self.data.node_ref.quine_id;
                let singleton = self.data.config.snapshot_singleton;
                let write_at = if singleton { EventTime::MAX } else { at };
                let bytes_for_write = bytes.clone();
                let result = self.pause_until(async move { persistor.persist_snapshot(qid, write_at, bytes_for_write).await }, rx, inbox).await;
                if let Err(e) = result {
                    if e.is_permanent() {
                        self.data.healthy.store(false, Ordering::SeqCst);
                    }
                    return Err(e.into());
                }
            }
            EffectOrder::MemoryFirst => {
                self.write_lane.enqueue(WriteJob::Snapshot { at, bytes, singleton: self.data.config.snapshot_singleton });
            }
        }
        Ok(())
    }

    fn debug_state(&self) -> DebugState {
        DebugState {
            node_ref: self.data.node_ref.clone(),
            properties: self.state.properties.clone(),
            edges: self.state.edges.iter().cloned().collect(),
            healthy: self.data.healthy.load(Ordering::SeqCst),
            subscribed_dgn_ids: self.state.dgn_engine.subscribed_dgn_ids().cloned().collect(),
            multiple_values_sq_answers: self
                .state
                .multiple_values_sqs
                .iter()
                .map(|((sq_id, part_id), mvsq)| (sq_id.clone(), part_id.clone(), mvsq.last_notification))
                .collect(),
            latest_update_after_snapshot: self.state.latest_update_after_snapshot,
            wakeful_state: self.data.actor_ref_lock.read().clone(),
            cost_to_sleep: self.data.actor_ref_lock.cost_to_sleep(),
        }
    }

    /// Suspends processing of the *current* message on `fut` while stashing any newly-arriving
    /// messages into `inbox` in order, so they're processed strictly after this one finishes (spec
    /// §4.4's suspend/stash requirement for `PersistorFirst` writes — never used for `MemoryFirst`,
    /// which never awaits a persistor call on the hot path).
    async fn pause_until<T>(&mut self, fut: impl Future<Output = T>, rx: &mut mpsc::Receiver<NodeMessage>, inbox: &mut VecDeque<NodeMessage>) -> T {
        tokio::pin!(fut);
        let mut channel_closed = false;
        loop {
            tokio::select! {
                biased;
                result = &mut fut => return result,
                maybe_msg = rx.recv(), if !channel_closed => {
                    match maybe_msg {
                        Some(m) => inbox.push_back(m),
                        None => channel_closed = true,
                    }
                }
            }
        }
    }
}

/// Spawns a node actor and returns an external handle to it (spec §4.7 wake sequence, §6 "To
/// callers").
pub fn spawn(
    node_ref: NodeRef,
    config: NodeConfig,
    persistor: Arc<dyn Persistor>,
    dgn_registry: Arc<dyn DgnRegistryHandle>,
    peer_link: Arc<dyn PeerLink>,
    snapshot_codec: Arc<dyn SnapshotCodec>,
    standing_query_store: Arc<dyn StandingQueryMetadataStore>,
) -> NodeHandle {
    NodeActor::spawn(node_ref, config, persistor, dgn_registry, peer_link, snapshot_codec, standing_query_store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Direction;
    use quickcheck_macros::quickcheck;

    fn qid(b: u8) -> QuineId {
        QuineId::new([b; 16])
    }

    /// Spec §8 universal property 3: deduping a batch keeps at most one `Property` event per key
    /// (the last one submitted) and never drops or reorders non-property events.
    #[quickcheck]
    fn dedup_batch_keeps_last_write_per_property_key(keys: Vec<u8>, values: Vec<u8>) -> bool {
        let n = keys.len().min(values.len());
        let events: Vec<NodeChangeEvent> = keys
            .iter()
            .zip(values.iter())
            .take(n)
            .map(|(k, v)| NodeChangeEvent::Property(PropertyEvent::Set { key: format!("k{k}"), value: PropertyValue::new(vec![*v]) }))
            .collect();

        let mut expected_last: HashMap<PropertyKey, PropertyValue> = HashMap::new();
        for event in &events {
            if let NodeChangeEvent::Property(PropertyEvent::Set { key, value }) = event {
                expected_last.insert(key.clone(), value.clone());
            }
        }

        let deduped = dedup_batch(events);

        let mut seen_keys: HashSet<PropertyKey> = HashSet::new();
        for event in &deduped {
            if let NodeChangeEvent::Property(PropertyEvent::Set { key, value }) = event {
                if !seen_keys.insert(key.clone()) {
                    return false; // more than one surviving event for the same key
                }
                if expected_last.get(key) != Some(value) {
                    return false; // survivor isn't the last value submitted for this key
                }
            }
        }
        seen_keys.len() == expected_last.len()
    }

    #[test]
    fn dedup_batch_preserves_non_property_events() {
        let edge = HalfEdge { direction: Direction::Out, label: "knows".into(), peer: qid(1) };
        let events = vec![
            NodeChangeEvent::Edge(EdgeEvent::Added(edge.clone())),
            NodeChangeEvent::Property(PropertyEvent::Set { key: "x".into(), value: PropertyValue::new(vec![1]) }),
            NodeChangeEvent::Property(PropertyEvent::Set { key: "x".into(), value: PropertyValue::new(vec![2]) }),
            NodeChangeEvent::Edge(EdgeEvent::Removed(edge)),
        ];
        let deduped = dedup_batch(events);
        assert_eq!(deduped.len(), 3, "both edge events survive, only the last property write does");
    }
}
