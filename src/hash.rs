//! Content hash over `(qid, properties, edges)` for `get_node_hash` (spec §4.4).
//!
//! Grounded on the teacher's own `fnv` dependency (used throughout the Actyx pack, e.g.
//! `FnvHashMap` in `discovery.rs`, for fast non-cryptographic hashing). Purely a testing/debugging
//! tool for the journal-replay-equivalence property (spec §8, property 1); not cryptographic.

use crate::edge_processor::EdgeSet;
use crate::event::{PropertyKey, PropertyValue, QuineId};
use fnv::FnvHasher;
use std::collections::BTreeMap;
use std::hash::Hasher;

/// A canonicalized, order-independent encoding of the node's identity-relevant state, hashed with
/// `FnvHasher`. Properties are sorted by key (a `HashMap` has no stable iteration order) before
/// encoding so two structurally-identical nodes hash identically regardless of insertion order;
/// edges are hashed in their stored (insertion) order, since that order is itself part of the
/// replay-determinism guarantee spec §3 invariant 1 asks us to preserve.
pub fn get_node_hash(qid: QuineId, properties: &std::collections::HashMap<PropertyKey, PropertyValue>, edges: &EdgeSet) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(&qid.0);

    let sorted: BTreeMap<&PropertyKey, &PropertyValue> = properties.iter().collect();
    for (key, value) in sorted {
        hasher.write(key.as_bytes());
        hasher.write(&value.bytes);
    }

    for edge in edges.iter() {
        hasher.write(&[edge.direction as u8]);
        hasher.write(edge.label.as_bytes());
        hasher.write(&edge.peer.0);
    }

    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Direction, HalfEdge};

    #[test]
    fn hash_is_independent_of_property_insertion_order() {
        let qid = QuineId::new([1; 16]);
        let edges = EdgeSet::new();

        let mut a = std::collections::HashMap::new();
        a.insert("x".to_string(), PropertyValue::new(vec![1]));
        a.insert("y".to_string(), PropertyValue::new(vec![2]));

        let mut b = std::collections::HashMap::new();
        b.insert("y".to_string(), PropertyValue::new(vec![2]));
        b.insert("x".to_string(), PropertyValue::new(vec![1]));

        assert_eq!(get_node_hash(qid, &a, &edges), get_node_hash(qid, &b, &edges));
    }

    #[test]
    fn hash_differs_on_edge_order() {
        let qid = QuineId::new([1; 16]);
        let properties = std::collections::HashMap::new();

        let mut edges_a = EdgeSet::new();
        edges_a.insert(HalfEdge { direction: Direction::Out, label: "a".into(), peer: QuineId::new([2; 16]) });
        edges_a.insert(HalfEdge { direction: Direction::Out, label: "b".into(), peer: QuineId::new([3; 16]) });

        let mut edges_b = EdgeSet::new();
        edges_b.insert(HalfEdge { direction: Direction::Out, label: "b".into(), peer: QuineId::new([3; 16]) });
        edges_b.insert(HalfEdge { direction: Direction::Out, label: "a".into(), peer: QuineId::new([2; 16]) });

        assert_ne!(get_node_hash(qid, &properties, &edges_a), get_node_hash(qid, &properties, &edges_b));
    }
}
