//! Snapshot binary format (spec §6) and its codec.
//!
//! Encoded with `serde_cbor`, matching the teacher's own choice of CBOR for its event envelopes.
//! The codec is versioned via a leading version byte so it stays forward/backward compatible
//! across minor schema revisions, per spec §6.

use crate::edge_processor::EdgeSet;
use crate::event::{DgnId, EventTime, HalfEdge, PropertyKey, PropertyValue, QuineId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberRecord {
    pub subscribers: Vec<crate::dgn::SubscriberRef>,
    pub last_notification: Option<bool>,
    pub related_queries: Vec<String>,
}

/// The logical schema from spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub at: EventTime,
    pub properties: HashMap<PropertyKey, PropertyValue>,
    pub edges: Vec<HalfEdge>,
    pub subscribers: HashMap<DgnId, SubscriberRecord>,
    pub domain_node_index: HashMap<QuineId, HashMap<DgnId, Option<bool>>>,
}

impl Snapshot {
    pub fn edge_set(&self) -> EdgeSet {
        let mut set = EdgeSet::new();
        for e in &self.edges {
            set.insert(e.clone());
        }
        set
    }
}

const CODEC_VERSION: u8 = 1;

#[derive(Debug, Clone, Display)]
pub enum CodecError {
    #[allow(dead_code)]
    UnsupportedVersion(u8),
    Decode(String),
    Encode(String),
}

use derive_more::Display;
impl std::error::Error for CodecError {}

/// Encodes/decodes `Snapshot` to/from the opaque bytes a `Persistor` stores (spec §6). A trait
/// rather than free functions so alternate wire formats can be swapped in without touching the
/// node actor, matching the codec-as-collaborator shape the rest of the core uses for its other
/// external interfaces (`Persistor`, `DgnRegistryHandle`, `PeerLink`).
pub trait SnapshotCodec: Send + Sync + 'static {
    fn encode(&self, snapshot: &Snapshot) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> Result<Snapshot, CodecError>;
}

/// Default codec: a version byte prefix followed by `serde_cbor`-encoded `Snapshot` bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct CborSnapshotCodec;

impl SnapshotCodec for CborSnapshotCodec {
    fn encode(&self, snapshot: &Snapshot) -> Vec<u8> {
        let mut out = vec![CODEC_VERSION];
        serde_cbor::to_writer(&mut out, snapshot).expect("snapshot encoding is infallible for owned in-memory data");
        out
    }

    fn decode(&self, bytes: &[u8]) -> Result<Snapshot, CodecError> {
        let (version, body) = bytes.split_first().ok_or_else(|| CodecError::Decode("empty snapshot".into()))?;
        if *version != CODEC_VERSION {
            return Err(CodecError::UnsupportedVersion(*version));
        }
        serde_cbor::from_slice(body).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_default_codec() {
        let codec = CborSnapshotCodec;
        let snapshot = Snapshot {
            at: EventTime::new(1000, 3),
            properties: HashMap::from([("k".to_string(), PropertyValue::new(vec![9, 9]))]),
            edges: vec![],
            subscribers: HashMap::new(),
            domain_node_index: HashMap::new(),
        };
        let bytes = codec.encode(&snapshot);
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.at, snapshot.at);
        assert_eq!(decoded.properties, snapshot.properties);
    }

    #[test]
    fn rejects_unknown_version_byte() {
        let codec = CborSnapshotCodec;
        let err = codec.decode(&[255, 0, 0]).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedVersion(255)));
    }
}
