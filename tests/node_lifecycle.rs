//! End-to-end scenarios and universal properties from spec §8, driven through `NodeHandle`
//! against the in-memory fixtures in `testing`. Grounded on `swarm::event_store.rs`'s
//! `#[tokio::test(flavor = "multi_thread")]` convention for actor-backed integration tests.

use std::sync::Arc;
use std::time::Duration;

use streamgraph_core::config::{EffectOrder, NodeConfig, RetryConfig};
use streamgraph_core::dgn::DomainGraphNode;
use streamgraph_core::event::{DomainIndexEvent, EdgeEvent, Direction, HalfEdge, NodeRef, PropertyEvent, PropertyValue, QuineId};
use streamgraph_core::persistor::Persistor;
use streamgraph_core::snapshot::CborSnapshotCodec;
use streamgraph_core::testing::{
    noop_collaborators, FailingPersistor, InMemoryDgnRegistry, InMemoryPersistor, InMemoryStandingQueryMetadataStore, RecordingPeerLink,
};
use streamgraph_core::{node, NodeError};

fn qid(byte: u8) -> QuineId {
    QuineId::new([byte; 16])
}

fn persistor_first_config() -> NodeConfig {
    NodeConfig {
        effect_order: EffectOrder::PersistorFirst,
        snapshot_on_update: false,
        snapshot_singleton: true,
        retry: RetryConfig::default(),
    }
}

fn memory_first_config(retry: RetryConfig) -> NodeConfig {
    NodeConfig {
        effect_order: EffectOrder::MemoryFirst,
        snapshot_on_update: false,
        snapshot_singleton: true,
        retry,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn s1_property_set_overwrite_noop_collapses_to_one_journal_record() {
    let persistor = Arc::new(InMemoryPersistor::new());
    let (registry, peer_link, sq_store) = noop_collaborators();
    let q = qid(1);
    let handle = node::spawn(
        NodeRef::live("test", q),
        persistor_first_config(),
        persistor.clone(),
        registry,
        peer_link,
        Arc::new(CborSnapshotCodec),
        sq_store,
    );

    let batch = vec![
        PropertyEvent::Set { key: "x".into(), value: PropertyValue::new(vec![1]) },
        PropertyEvent::Set { key: "x".into(), value: PropertyValue::new(vec![2]) },
        PropertyEvent::Set { key: "x".into(), value: PropertyValue::new(vec![2]) },
    ];
    handle.process_property_events(batch).await.unwrap();

    let journal = persistor.get_journal_with_time(q, streamgraph_core::EventTime::MIN, streamgraph_core::EventTime::MAX, false).await.unwrap();
    assert_eq!(journal.len(), 1);

    let state = handle.debug_internal_state().await.unwrap();
    assert_eq!(state.properties.get("x"), Some(&PropertyValue::new(vec![2])));
    assert!(state.latest_update_after_snapshot.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn s2_edge_add_twice_is_idempotent() {
    let persistor = Arc::new(InMemoryPersistor::new());
    let (registry, peer_link, sq_store) = noop_collaborators();
    let q = qid(2);
    let handle = node::spawn(
        NodeRef::live("test", q),
        persistor_first_config(),
        persistor.clone(),
        registry,
        peer_link,
        Arc::new(CborSnapshotCodec),
        sq_store,
    );

    let edge = HalfEdge { direction: Direction::Out, label: "knows".into(), peer: qid(42) };
    handle.process_edge_event(EdgeEvent::Added(edge.clone())).await.unwrap();
    let after_first = persistor.get_journal_with_time(q, streamgraph_core::EventTime::MIN, streamgraph_core::EventTime::MAX, false).await.unwrap();
    assert_eq!(after_first.len(), 1);

    handle.process_edge_event(EdgeEvent::Added(edge)).await.unwrap();
    let after_second = persistor.get_journal_with_time(q, streamgraph_core::EventTime::MIN, streamgraph_core::EventTime::MAX, false).await.unwrap();
    assert_eq!(after_second.len(), 1, "second add should be a no-op, not a second journal write");
}

#[tokio::test(flavor = "multi_thread")]
async fn s3_memory_first_retries_until_durable() {
    let inner = InMemoryPersistor::new();
    let persistor = Arc::new(FailingPersistor::transient_then_succeed(inner, 2));
    let (registry, peer_link, sq_store) = noop_collaborators();
    let q = qid(3);
    let retry = RetryConfig { base: Duration::from_millis(1), cap: Duration::from_millis(20), jitter: 0.0 };
    let handle = node::spawn(
        NodeRef::live("test", q),
        memory_first_config(retry),
        persistor.clone(),
        registry,
        peer_link,
        Arc::new(CborSnapshotCodec),
        sq_store,
    );

    handle.process_property_event(PropertyEvent::Set { key: "a".into(), value: PropertyValue::new(b"v".to_vec()) }).await.unwrap();

    let state = handle.debug_internal_state().await.unwrap();
    assert_eq!(state.properties.get("a"), Some(&PropertyValue::new(b"v".to_vec())), "visible immediately under MemoryFirst");

    let mut attempts = 0;
    loop {
        let journal = persistor.get_journal_with_time(q, streamgraph_core::EventTime::MIN, streamgraph_core::EventTime::MAX, false).await.unwrap();
        if journal.len() == 1 {
            break;
        }
        attempts += 1;
        assert!(attempts < 200, "write lane never became durable");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn s4_persistor_first_failure_is_isolated() {
    let inner = InMemoryPersistor::new();
    let persistor = Arc::new(FailingPersistor::permanently_failing(inner));
    let (registry, peer_link, sq_store) = noop_collaborators();
    let q = qid(4);
    let handle = node::spawn(
        NodeRef::live("test", q),
        persistor_first_config(),
        persistor,
        registry,
        peer_link,
        Arc::new(CborSnapshotCodec),
        sq_store,
    );

    let err = handle.process_property_event(PropertyEvent::Set { key: "a".into(), value: PropertyValue::new(vec![1]) }).await;
    assert!(err.is_err());

    // actor remains responsive to reads even though it's now marked unhealthy
    let state = handle.debug_internal_state().await.unwrap();
    assert!(!state.properties.contains_key("a"));
    assert!(!state.healthy);
}

#[tokio::test(flavor = "multi_thread")]
async fn s5_wake_equivalence_after_mixed_events() {
    let persistor = Arc::new(InMemoryPersistor::new());
    let q = qid(5);

    let (registry_a, peer_link_a, sq_store_a) = noop_collaborators();
    let handle_a = node::spawn(
        NodeRef::live("test", q),
        persistor_first_config(),
        persistor.clone(),
        registry_a,
        peer_link_a,
        Arc::new(CborSnapshotCodec),
        sq_store_a,
    );

    for i in 0..500u32 {
        handle_a
            .process_property_event(PropertyEvent::Set { key: format!("k{i}"), value: PropertyValue::new(i.to_le_bytes().to_vec()) })
            .await
            .unwrap();
        handle_a
            .process_edge_event(EdgeEvent::Added(HalfEdge { direction: Direction::Out, label: "knows".into(), peer: qid((i % 250) as u8) }))
            .await
            .unwrap();
    }

    let hash_a = handle_a.get_node_hash().await.unwrap();
    drop(handle_a);

    let (registry_b, peer_link_b, sq_store_b) = noop_collaborators();
    let handle_b = node::spawn(
        NodeRef::live("test", q),
        persistor_first_config(),
        persistor,
        registry_b,
        peer_link_b,
        Arc::new(CborSnapshotCodec),
        sq_store_b,
    );
    let hash_b = handle_b.get_node_hash().await.unwrap();

    assert_eq!(hash_a, hash_b);
}

#[tokio::test(flavor = "multi_thread")]
async fn s6_historical_ref_refuses_mutation() {
    let persistor = Arc::new(InMemoryPersistor::new());
    let (registry, peer_link, sq_store) = noop_collaborators();
    let q = qid(6);
    let handle = node::spawn(
        NodeRef::historical("test", q, 1000),
        persistor_first_config(),
        persistor.clone(),
        registry,
        peer_link,
        Arc::new(CborSnapshotCodec),
        sq_store,
    );

    let result = handle.process_property_event(PropertyEvent::Set { key: "a".into(), value: PropertyValue::new(vec![1]) }).await;
    assert!(matches!(result, Err(NodeError::IllegalHistoricalUpdate)));

    let journal = persistor.get_journal_with_time(q, streamgraph_core::EventTime::MIN, streamgraph_core::EventTime::MAX, true).await.unwrap();
    assert!(journal.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn property_2_noop_event_performs_zero_journal_writes() {
    let persistor = Arc::new(InMemoryPersistor::new());
    let (registry, peer_link, sq_store) = noop_collaborators();
    let q = qid(7);
    let handle = node::spawn(
        NodeRef::live("test", q),
        persistor_first_config(),
        persistor.clone(),
        registry,
        peer_link,
        Arc::new(CborSnapshotCodec),
        sq_store,
    );

    // removing a property that was never set has no effect
    handle
        .process_property_event(PropertyEvent::Removed { key: "never-set".into(), previous_value: PropertyValue::new(vec![]) })
        .await
        .unwrap();

    let journal = persistor.get_journal_with_time(q, streamgraph_core::EventTime::MIN, streamgraph_core::EventTime::MAX, false).await.unwrap();
    assert!(journal.is_empty());

    let state = handle.debug_internal_state().await.unwrap();
    assert!(state.latest_update_after_snapshot.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn property_7_standing_query_self_heals_after_dgn_deregistration() {
    let persistor = Arc::new(InMemoryPersistor::new());
    let registry = Arc::new(InMemoryDgnRegistry::new());
    let peer_link = Arc::new(RecordingPeerLink::new());
    let sq_store = Arc::new(InMemoryStandingQueryMetadataStore::new());
    let q = qid(8);
    let dgn_id = "adult".to_string();

    registry.register(DomainGraphNode {
        id: dgn_id.clone(),
        required_properties: vec![("flag".into(), PropertyValue::new(vec![1]))],
        required_edges: vec![],
    });

    let handle = node::spawn(
        NodeRef::live("test", q),
        persistor_first_config(),
        persistor,
        registry.clone(),
        peer_link,
        Arc::new(CborSnapshotCodec),
        sq_store,
    );

    handle
        .process_domain_index_event(DomainIndexEvent::SubscriptionCreated { dgn_id: dgn_id.clone(), subscriber: qid(99), related_queries: vec![] })
        .await
        .unwrap();
    let state = handle.debug_internal_state().await.unwrap();
    assert!(state.subscribed_dgn_ids.contains(&dgn_id));

    registry.unregister(&dgn_id);

    // the next event on the watched property drives one post-action pass
    handle.process_property_event(PropertyEvent::Set { key: "flag".into(), value: PropertyValue::new(vec![1]) }).await.unwrap();

    let state = handle.debug_internal_state().await.unwrap();
    assert!(!state.subscribed_dgn_ids.contains(&dgn_id), "stale DGN subscription should have been dropped");
}

#[tokio::test(flavor = "multi_thread")]
async fn property_8_standing_query_metadata_is_synced_and_answered_on_wake() {
    let persistor = Arc::new(InMemoryPersistor::new());
    let sq_store = Arc::new(InMemoryStandingQueryMetadataStore::new());
    let q = qid(9);
    let sq_id = "has-flag".to_string();

    let metadata = serde_cbor::to_vec(&serde_cbor::Value::Map(
        [
            (serde_cbor::Value::Text("required_properties".into()), serde_cbor::Value::Array(vec![])),
            (serde_cbor::Value::Text("required_edge_labels".into()), serde_cbor::Value::Array(vec![])),
            (serde_cbor::Value::Text("subscribers".into()), serde_cbor::Value::Array(vec![])),
        ]
        .into_iter()
        .collect(),
    ))
    .unwrap();
    sq_store.put_sync(sq_id.clone(), metadata);

    let (registry, peer_link, _unused) = noop_collaborators();
    let handle = node::spawn(
        NodeRef::live("test", q),
        persistor_first_config(),
        persistor,
        registry,
        peer_link,
        Arc::new(CborSnapshotCodec),
        sq_store,
    );

    // Node has no properties/edges at all; a standing query with no requirements should answer
    // true as soon as the wake-time sync step runs, before any event is ever sent.
    let state = handle.debug_internal_state().await.unwrap();
    assert_eq!(
        state.multiple_values_sq_answers,
        vec![(sq_id, q.to_string(), Some(true))],
        "standing query metadata should be synced and answered during the wake sequence"
    );
}
