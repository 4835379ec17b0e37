//! The local event index (spec §4.5, C5): maps this node's property/edge events to the
//! standing-query subscribers interested in them.
//!
//! Grounded on `swarm::lib.rs`'s `known_streams: Vec<mpsc::UnboundedSender<StreamId>>`
//! dispatcher-set pattern, generalized from "one list of listeners" to a keyed multi-map.

use crate::event::{DgnId, EdgeLabel, NodeChangeEvent, PartId, PropertyEvent, PropertyKey, StandingQueryId};
use std::collections::{HashMap, HashSet};

/// A thing interested in this node's events (spec §4.5).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscriber {
    MultipleValuesSq(StandingQueryId, PartId),
    DomainNodeIndex(DgnId),
}

#[derive(Debug, Default)]
pub struct LocalEventIndex {
    watching_for_property: HashMap<PropertyKey, HashSet<Subscriber>>,
    watching_for_edge: HashMap<EdgeLabel, HashSet<Subscriber>>,
    watching_for_any_edge: HashSet<Subscriber>,
}

impl LocalEventIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch_property(&mut self, key: PropertyKey, subscriber: Subscriber) {
        self.watching_for_property.entry(key).or_default().insert(subscriber);
    }

    pub fn watch_edge_label(&mut self, label: EdgeLabel, subscriber: Subscriber) {
        self.watching_for_edge.entry(label).or_default().insert(subscriber);
    }

    pub fn watch_any_edge(&mut self, subscriber: Subscriber) {
        self.watching_for_any_edge.insert(subscriber);
    }

    pub fn unwatch(&mut self, subscriber: &Subscriber) {
        self.watching_for_property.values_mut().for_each(|s| {
            s.remove(subscriber);
        });
        self.watching_for_edge.values_mut().for_each(|s| {
            s.remove(subscriber);
        });
        self.watching_for_any_edge.remove(subscriber);
    }

    fn candidates(&self, event: &NodeChangeEvent) -> Vec<&Subscriber> {
        match event {
            NodeChangeEvent::Property(p) => self
                .watching_for_property
                .get(p.key())
                .map(|s| s.iter().collect())
                .unwrap_or_default(),
            NodeChangeEvent::Edge(e) => {
                let mut out: Vec<&Subscriber> = self.watching_for_any_edge.iter().collect();
                if let Some(s) = self.watching_for_edge.get(&e.half_edge().label) {
                    out.extend(s.iter());
                }
                out
            }
        }
    }

    /// Invokes `callback(subscriber)` for each subscriber interested in `event` (spec §4.5). The
    /// callback returns `true` to request removal of that subscription (used when the subscriber
    /// is a `DomainNodeIndex` for a DGN that has disappeared globally).
    pub fn standing_queries_watching(&mut self, event: &NodeChangeEvent, mut callback: impl FnMut(&Subscriber) -> bool) {
        let to_remove: Vec<Subscriber> = self
            .candidates(event)
            .into_iter()
            .filter(|s| callback(s))
            .cloned()
            .collect();
        for s in to_remove {
            self.unwatch(&s);
        }
    }

    /// Rebuilds the index from current domain-graph subscribers and multiple-values standing
    /// queries after journal restoration (spec §4.5). Returns the rebuilt index and the set of
    /// DGN ids no longer registered in the global DGN registry, for the caller to garbage-collect.
    pub fn reconstruct<'a>(
        dgn_subscriptions: impl Iterator<Item = (&'a DgnId, &'a HashSet<PropertyKey>, &'a HashSet<EdgeLabel>, bool)>,
        mvsq_subscriptions: impl Iterator<Item = (&'a StandingQueryId, &'a PartId, &'a HashSet<PropertyKey>, &'a HashSet<EdgeLabel>, bool)>,
        globally_registered: impl Fn(&DgnId) -> bool,
    ) -> (Self, HashSet<DgnId>) {
        let mut index = Self::new();
        let mut stale = HashSet::new();

        for (dgn_id, props, edge_labels, watches_any_edge) in dgn_subscriptions {
            if !globally_registered(dgn_id) {
                stale.insert(dgn_id.clone());
                continue;
            }
            let subscriber = Subscriber::DomainNodeIndex(dgn_id.clone());
            for key in props {
                index.watch_property(key.clone(), subscriber.clone());
            }
            for label in edge_labels {
                index.watch_edge_label(label.clone(), subscriber.clone());
            }
            if watches_any_edge {
                index.watch_any_edge(subscriber.clone());
            }
        }

        for (sq_id, part_id, props, edge_labels, watches_any_edge) in mvsq_subscriptions {
            let subscriber = Subscriber::MultipleValuesSq(sq_id.clone(), part_id.clone());
            for key in props {
                index.watch_property(key.clone(), subscriber.clone());
            }
            for label in edge_labels {
                index.watch_edge_label(label.clone(), subscriber.clone());
            }
            if watches_any_edge {
                index.watch_any_edge(subscriber.clone());
            }
        }

        (index, stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Direction, HalfEdge, PropertyValue, QuineId};

    #[test]
    fn property_watcher_is_invoked_for_matching_key_only() {
        let mut index = LocalEventIndex::new();
        let sub = Subscriber::DomainNodeIndex("dgn-1".into());
        index.watch_property("name".into(), sub.clone());

        let mut seen = vec![];
        index.standing_queries_watching(
            &NodeChangeEvent::Property(PropertyEvent::Set { key: "name".into(), value: PropertyValue::new(vec![]) }),
            |s| {
                seen.push(s.clone());
                false
            },
        );
        assert_eq!(seen, vec![sub]);

        let mut seen_other = vec![];
        index.standing_queries_watching(
            &NodeChangeEvent::Property(PropertyEvent::Set { key: "age".into(), value: PropertyValue::new(vec![]) }),
            |s| {
                seen_other.push(s.clone());
                false
            },
        );
        assert!(seen_other.is_empty());
    }

    #[test]
    fn callback_requesting_removal_unwatches() {
        let mut index = LocalEventIndex::new();
        let sub = Subscriber::DomainNodeIndex("stale-dgn".into());
        index.watch_any_edge(sub.clone());

        let edge = HalfEdge { direction: Direction::Out, label: "knows".into(), peer: QuineId::new([1; 16]) };
        index.standing_queries_watching(&NodeChangeEvent::Edge(crate::event::EdgeEvent::Added(edge.clone())), |_| true);

        let mut seen = vec![];
        index.standing_queries_watching(&NodeChangeEvent::Edge(crate::event::EdgeEvent::Added(edge)), |s| {
            seen.push(s.clone());
            false
        });
        assert!(seen.is_empty(), "subscriber should have been removed on first pass");
    }
}
