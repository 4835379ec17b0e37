//! The domain-graph subscription engine (spec §4.6, C6).
//!
//! A DGN (Domain Graph Node) is an external, globally-registered pattern fragment; a node may be
//! a subscriber-of and/or subscribed-to for one. The DGN *definitions* and the fact of global
//! registration live in an injected, read-mostly `DgnRegistryHandle` (spec §9: "Global mutable DGN
//! registry. Inject as an explicit handle on node construction ... updates propagate via a
//! notification channel rather than shared mutation"). Cross-node messaging (subscribing to a
//! peer, notifying a peer or standing query of this node's answer) goes through the injected
//! `PeerLink`, since cyclic peer references are broken by addressing peers only by `QuineId`
//! (spec §9) — this crate never holds a direct reference to another node's actor.
//!
//! Grounded on the reference pack's `eventually-rs` `subscription.rs` (subscriber/stream module
//! shape) and `swarm::gossip.rs` (propagation via an explicit notification channel rather than
//! shared mutable state).

use crate::edge_processor::EdgeSet;
use crate::event::{DgnId, Direction, EdgeLabel, PropertyKey, PropertyValue, QuineId, StandingQueryId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Either a peer node or a standing query, subscribed to this node's answer for a DGN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriberRef {
    Peer(QuineId),
    Query(StandingQueryId),
}

/// An edge this node must have, to a peer whose answer for `dependency_dgn` feeds into this
/// node's own evaluation of the owning DGN.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequiredEdge {
    pub direction: Direction,
    pub label: EdgeLabel,
    pub dependency_dgn: DgnId,
}

/// The globally-registered definition of a DGN: the local conditions this node must satisfy to
/// answer "true" for it.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainGraphNode {
    pub id: DgnId,
    pub required_properties: Vec<(PropertyKey, PropertyValue)>,
    pub required_edges: Vec<RequiredEdge>,
}

/// Read-mostly handle to the global DGN registry (spec §9). Implementations are expected to be
/// backed by a shared, externally-replicated registry; this crate only ever reads it.
pub trait DgnRegistryHandle: Send + Sync + 'static {
    fn is_registered(&self, dgn_id: &DgnId) -> bool;
    fn get(&self, dgn_id: &DgnId) -> Option<DomainGraphNode>;
}

/// Cross-node messaging collaborator (spec §6/§9): subscribing to a peer's answer for a DGN, and
/// notifying a subscriber (peer or standing query) of this node's answer. `related_queries` names
/// the standing queries this particular edge-subscription serves (spec §4.6
/// `ensure_subscription_to_domain_edges(dgn, related_queries, should_send_replies)`), so a peer can
/// attribute the subscription to the queries driving it rather than just the DGN.
pub trait PeerLink: Send + Sync + 'static {
    fn subscribe_to_peer(&self, peer: QuineId, dgn_id: DgnId, related_queries: HashSet<StandingQueryId>, should_send_replies: bool);
    fn cancel_peer_subscription(&self, peer: QuineId, dgn_id: DgnId);
    fn notify_subscriber(&self, subscriber: SubscriberRef, dgn_id: DgnId, result: bool);
}

#[derive(Debug, Clone, Default)]
struct SubscriptionRecord {
    subscribers: HashSet<SubscriberRef>,
    last_notification: Option<bool>,
    related_queries: HashSet<StandingQueryId>,
}

/// Per-node domain-graph subscription state and logic (spec §4.6).
#[derive(Debug, Default)]
pub struct DgnEngine {
    subscribers_to_this_node: HashMap<DgnId, SubscriptionRecord>,
    domain_node_index: HashMap<QuineId, HashMap<DgnId, Option<bool>>>,
}

impl DgnEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribed_dgn_ids(&self) -> impl Iterator<Item = &DgnId> {
        self.subscribers_to_this_node.keys()
    }

    pub fn related_queries(&self, dgn_id: &DgnId) -> HashSet<StandingQueryId> {
        self.subscribers_to_this_node
            .get(dgn_id)
            .map(|r| r.related_queries.clone())
            .unwrap_or_default()
    }

    pub fn last_notification(&self, dgn_id: &DgnId) -> Option<bool> {
        self.subscribers_to_this_node.get(dgn_id).and_then(|r| r.last_notification)
    }

    pub fn domain_node_index(&self) -> &HashMap<QuineId, HashMap<DgnId, Option<bool>>> {
        &self.domain_node_index
    }

    /// Flattens subscription bookkeeping into plain owned data for snapshotting (spec §6).
    #[allow(clippy::type_complexity)]
    pub fn export_subscriptions(&self) -> HashMap<DgnId, (Vec<SubscriberRef>, Option<bool>, Vec<StandingQueryId>)> {
        self.subscribers_to_this_node
            .iter()
            .map(|(id, record)| {
                (
                    id.clone(),
                    (
                        record.subscribers.iter().cloned().collect(),
                        record.last_notification,
                        record.related_queries.iter().cloned().collect(),
                    ),
                )
            })
            .collect()
    }

    /// Rebuilds an engine from a decoded snapshot's subscription bookkeeping (spec §6 restore).
    pub fn restore(
        subscriptions: HashMap<DgnId, (Vec<SubscriberRef>, Option<bool>, Vec<StandingQueryId>)>,
        domain_node_index: HashMap<QuineId, HashMap<DgnId, Option<bool>>>,
    ) -> Self {
        let subscribers_to_this_node = subscriptions
            .into_iter()
            .map(|(id, (subscribers, last_notification, related_queries))| {
                let record = SubscriptionRecord {
                    subscribers: subscribers.into_iter().collect(),
                    last_notification,
                    related_queries: related_queries.into_iter().collect(),
                };
                (id, record)
            })
            .collect();
        Self { subscribers_to_this_node, domain_node_index }
    }

    /// Property keys and edge labels a DGN requires — used by C5 to rebuild the local event index
    /// over the DGNs this node currently answers for.
    pub fn watched_properties_and_edges(
        &self,
        registry: &dyn DgnRegistryHandle,
        dgn_id: &DgnId,
    ) -> (HashSet<PropertyKey>, HashSet<EdgeLabel>) {
        let mut props = HashSet::new();
        let mut labels = HashSet::new();
        if let Some(def) = registry.get(dgn_id) {
            for (key, _) in def.required_properties {
                props.insert(key);
            }
            for edge in def.required_edges {
                labels.insert(edge.label);
            }
        }
        (props, labels)
    }

    /// Registers `subscriber` as interested in this node's answer for `dgn_id` (spec §4.6). If
    /// `should_send_replies`, immediately evaluates and replies (suppressed during wake replay).
    #[allow(clippy::too_many_arguments)]
    pub fn receive_domain_node_subscription(
        &mut self,
        registry: &dyn DgnRegistryHandle,
        peer_link: &dyn PeerLink,
        properties: &HashMap<PropertyKey, PropertyValue>,
        edges: &EdgeSet,
        subscriber: SubscriberRef,
        dgn_id: DgnId,
        for_queries: Vec<StandingQueryId>,
        should_send_replies: bool,
    ) {
        let record = self.subscribers_to_this_node.entry(dgn_id.clone()).or_default();
        record.subscribers.insert(subscriber);
        record.related_queries.extend(for_queries);
        self.update_answer_and_notify_subscribers(registry, peer_link, properties, edges, &dgn_id, should_send_replies);
    }

    /// Sends the current answer (if one has been computed) to a single subscriber without
    /// requiring the answer to have changed — used to serve an explicit reply request.
    pub fn reply_to(&self, peer_link: &dyn PeerLink, dgn_id: &DgnId, subscriber: SubscriberRef) {
        if let Some(answer) = self.last_notification(dgn_id) {
            peer_link.notify_subscriber(subscriber, dgn_id.clone(), answer);
        }
    }

    /// Updates `domain_node_index` for `from_peer`/`dgn_id` and re-evaluates any locally-answered
    /// DGN whose required edges depend on that peer/DGN pair (spec §4.6).
    #[allow(clippy::too_many_arguments)]
    pub fn receive_index_update(
        &mut self,
        registry: &dyn DgnRegistryHandle,
        peer_link: &dyn PeerLink,
        properties: &HashMap<PropertyKey, PropertyValue>,
        edges: &EdgeSet,
        from_peer: QuineId,
        dgn_id: DgnId,
        result: Option<bool>,
        should_send_replies: bool,
    ) {
        self.domain_node_index.entry(from_peer).or_default().insert(dgn_id.clone(), result);

        let dependents: Vec<DgnId> = self
            .subscribers_to_this_node
            .keys()
            .filter(|owner| {
                registry
                    .get(owner)
                    .map(|def| {
                        def.required_edges.iter().any(|req| {
                            req.dependency_dgn == dgn_id
                                && edges.by_label(req.direction, &req.label).any(|e| e.peer == from_peer)
                        })
                    })
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        for owner in dependents {
            self.update_answer_and_notify_subscribers(registry, peer_link, properties, edges, &owner, should_send_replies);
        }
    }

    /// Removes `subscriber` (or all subscribers, if `from` is `None`) from `dgn_id`; once the
    /// subscriber set becomes empty, cancels this node's outgoing subscriptions to the peers it
    /// was depending on for `dgn_id` (spec §4.6).
    pub fn cancel_subscription(
        &mut self,
        registry: &dyn DgnRegistryHandle,
        peer_link: &dyn PeerLink,
        edges: &EdgeSet,
        dgn_id: &DgnId,
        from: Option<&SubscriberRef>,
    ) {
        let Some(record) = self.subscribers_to_this_node.get_mut(dgn_id) else { return };
        match from {
            Some(s) => {
                record.subscribers.remove(s);
            }
            None => record.subscribers.clear(),
        }
        if !record.subscribers.is_empty() {
            return;
        }
        self.subscribers_to_this_node.remove(dgn_id);
        if let Some(def) = registry.get(dgn_id) {
            for req in &def.required_edges {
                for e in edges.by_label(req.direction, &req.label) {
                    peer_link.cancel_peer_subscription(e.peer, req.dependency_dgn.clone());
                }
            }
        }
    }

    /// Idempotent: for each edge the DGN requires, ensures an outgoing subscription to the peer(s)
    /// currently at the far side (spec §4.6). `PeerLink` implementations are expected to dedupe
    /// repeated subscribe calls to the same `(peer, dgn_id)` pair.
    fn ensure_subscription_to_domain_edges(
        &self,
        def: &DomainGraphNode,
        related_queries: &HashSet<StandingQueryId>,
        peer_link: &dyn PeerLink,
        edges: &EdgeSet,
        should_send_replies: bool,
    ) {
        for req in &def.required_edges {
            for e in edges.by_label(req.direction, &req.label) {
                peer_link.subscribe_to_peer(e.peer, req.dependency_dgn.clone(), related_queries.clone(), should_send_replies);
            }
        }
    }

    fn local_match(
        def: &DomainGraphNode,
        properties: &HashMap<PropertyKey, PropertyValue>,
        edges: &EdgeSet,
        domain_node_index: &HashMap<QuineId, HashMap<DgnId, Option<bool>>>,
    ) -> bool {
        let props_ok = def
            .required_properties
            .iter()
            .all(|(key, value)| properties.get(key) == Some(value));
        let edges_ok = def.required_edges.iter().all(|req| {
            edges.by_label(req.direction, &req.label).any(|e| {
                domain_node_index
                    .get(&e.peer)
                    .and_then(|idx| idx.get(&req.dependency_dgn))
                    .copied()
                    .flatten()
                    == Some(true)
            })
        });
        props_ok && edges_ok
    }

    /// Recomputes this node's local truth for `dgn_id` and, if it differs from the last
    /// notification, notifies subscribers (spec §4.6). If the DGN is no longer globally
    /// registered, the entry is dropped instead (index self-healing).
    #[allow(clippy::too_many_arguments)]
    pub fn update_answer_and_notify_subscribers(
        &mut self,
        registry: &dyn DgnRegistryHandle,
        peer_link: &dyn PeerLink,
        properties: &HashMap<PropertyKey, PropertyValue>,
        edges: &EdgeSet,
        dgn_id: &DgnId,
        should_send_replies: bool,
    ) {
        let Some(def) = registry.get(dgn_id).filter(|_| registry.is_registered(dgn_id)) else {
            self.subscribers_to_this_node.remove(dgn_id);
            return;
        };

        let related_queries = self.subscribers_to_this_node.get(dgn_id).map(|r| r.related_queries.clone()).unwrap_or_default();
        self.ensure_subscription_to_domain_edges(&def, &related_queries, peer_link, edges, should_send_replies);
        let answer = Self::local_match(&def, properties, edges, &self.domain_node_index);

        let Some(record) = self.subscribers_to_this_node.get_mut(dgn_id) else { return };
        if record.last_notification == Some(answer) {
            return;
        }
        record.last_notification = Some(answer);
        if should_send_replies {
            for subscriber in record.subscribers.clone() {
                peer_link.notify_subscriber(subscriber, dgn_id.clone(), answer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeRegistry(HashMap<DgnId, DomainGraphNode>);
    impl DgnRegistryHandle for FakeRegistry {
        fn is_registered(&self, dgn_id: &DgnId) -> bool {
            self.0.contains_key(dgn_id)
        }
        fn get(&self, dgn_id: &DgnId) -> Option<DomainGraphNode> {
            self.0.get(dgn_id).cloned()
        }
    }

    #[derive(Default)]
    struct FakePeerLink {
        notifications: Mutex<Vec<(SubscriberRef, DgnId, bool)>>,
    }
    impl PeerLink for FakePeerLink {
        fn subscribe_to_peer(&self, _peer: QuineId, _dgn_id: DgnId, _related_queries: HashSet<StandingQueryId>, _should_send_replies: bool) {}
        fn cancel_peer_subscription(&self, _peer: QuineId, _dgn_id: DgnId) {}
        fn notify_subscriber(&self, subscriber: SubscriberRef, dgn_id: DgnId, result: bool) {
            self.notifications.lock().unwrap().push((subscriber, dgn_id, result));
        }
    }

    #[test]
    fn notifies_on_property_match_and_is_idempotent_after() {
        let dgn_id: DgnId = "age-over-18".into();
        let def = DomainGraphNode {
            id: dgn_id.clone(),
            required_properties: vec![("adult".into(), PropertyValue::new(vec![1]))],
            required_edges: vec![],
        };
        let registry = FakeRegistry(HashMap::from([(dgn_id.clone(), def)]));
        let peer_link = FakePeerLink::default();
        let mut engine = DgnEngine::new();
        let edges = EdgeSet::new();
        let mut properties = HashMap::new();

        engine.receive_domain_node_subscription(
            &registry,
            &peer_link,
            &properties,
            &edges,
            SubscriberRef::Peer(QuineId::new([9; 16])),
            dgn_id.clone(),
            Vec::new(),
            true,
        );
        assert_eq!(peer_link.notifications.lock().unwrap().len(), 1);
        assert_eq!(peer_link.notifications.lock().unwrap()[0].2, false);

        properties.insert("adult".to_string(), PropertyValue::new(vec![1]));
        engine.update_answer_and_notify_subscribers(&registry, &peer_link, &properties, &edges, &dgn_id, true);
        assert_eq!(peer_link.notifications.lock().unwrap().len(), 2);
        assert_eq!(peer_link.notifications.lock().unwrap()[1].2, true);

        // calling again with the same answer does not re-notify
        engine.update_answer_and_notify_subscribers(&registry, &peer_link, &properties, &edges, &dgn_id, true);
        assert_eq!(peer_link.notifications.lock().unwrap().len(), 2);
    }

    #[test]
    fn stale_dgn_is_dropped_on_recompute() {
        let dgn_id: DgnId = "gone".into();
        let registry = FakeRegistry(HashMap::new());
        let peer_link = FakePeerLink::default();
        let mut engine = DgnEngine::new();
        engine.subscribers_to_this_node.insert(dgn_id.clone(), SubscriptionRecord::default());
        engine.update_answer_and_notify_subscribers(&registry, &peer_link, &HashMap::new(), &EdgeSet::new(), &dgn_id, true);
        assert!(!engine.subscribers_to_this_node.contains_key(&dgn_id));
    }

    #[test]
    fn replay_mode_suppresses_notifications() {
        let dgn_id: DgnId = "silent".into();
        let def = DomainGraphNode { id: dgn_id.clone(), required_properties: vec![], required_edges: vec![] };
        let registry = FakeRegistry(HashMap::from([(dgn_id.clone(), def)]));
        let peer_link = FakePeerLink::default();
        let mut engine = DgnEngine::new();
        engine.receive_domain_node_subscription(
            &registry,
            &peer_link,
            &HashMap::new(),
            &EdgeSet::new(),
            SubscriberRef::Peer(QuineId::new([1; 16])),
            dgn_id,
            Vec::new(),
            false,
        );
        assert!(peer_link.notifications.lock().unwrap().is_empty());
    }

    #[test]
    fn cancel_cancels_peer_subscriptions_once_empty() {
        let dgn_id: DgnId = "dep".into();
        let def = DomainGraphNode {
            id: dgn_id.clone(),
            required_properties: vec![],
            required_edges: vec![RequiredEdge { direction: Direction::Out, label: "knows".into(), dependency_dgn: "inner".into() }],
        };
        let registry = FakeRegistry(HashMap::from([(dgn_id.clone(), def)]));
        let peer_link = FakePeerLink::default();
        let mut engine = DgnEngine::new();
        let mut edges = EdgeSet::new();
        let peer = QuineId::new([2; 16]);
        edges.insert(crate::event::HalfEdge { direction: Direction::Out, label: "knows".into(), peer });

        let subscriber = SubscriberRef::Peer(QuineId::new([3; 16]));
        engine.receive_domain_node_subscription(&registry, &peer_link, &HashMap::new(), &edges, subscriber.clone(), dgn_id.clone(), Vec::new(), false);
        engine.cancel_subscription(&registry, &peer_link, &edges, &dgn_id, Some(&subscriber));
        assert!(!engine.subscribed_dgn_ids().any(|id| id == &dgn_id));
    }
}
