//! Streaming graph interpreter core: the per-node lifecycle and event-processing engine.
//!
//! This crate implements the pieces a host process wires together to run a graph of independent,
//! actor-backed nodes — each node owns its own properties, edges, domain-graph subscription state,
//! and multiple-values standing query bookkeeping, processes events one batch at a time under a
//! single-writer guarantee, and persists through an injected [`persistor::Persistor`]. It does not
//! implement a backend store or a cluster transport; those are external collaborators this crate
//! only defines interfaces for (see `persistor`, `dgn`, `wake`). Standing-query *registration* is
//! likewise external (driven through [`persistor::StandingQueryMetadataStore`]); this crate only
//! evaluates a standing query's local match against its own node state and keeps it in sync across
//! sleep/wake (see `node`'s `multiple_values_sqs` handling).
//!
//! Module map (mirrors the teacher's `swarm::lib.rs` top-of-file module listing):
//! - [`event`] — node identity and the event/property/edge data model (C2).
//! - [`clock`] — the per-node monotonic actor clock (C2).
//! - [`config`] — `EffectOrder`, `RetryConfig`, `NodeConfig`.
//! - [`error`] — the crate's error taxonomy.
//! - [`persistor`] — the abstract journal + snapshot store interface (C1).
//! - [`edge_processor`] — `EdgeSet` and the shared retry backoff helper (C3).
//! - [`index`] — the local event index mapping events to interested subscribers (C5).
//! - [`dgn`] — the domain-graph subscription engine (C6).
//! - [`wake`] — the wake/sleep lifecycle controller (C7).
//! - [`hash`] — `get_node_hash`, a debugging/testing content hash.
//! - [`snapshot`] — the snapshot wire format and its codec.
//! - [`node`] — the node actor itself (C4): `NodeHandle`, `NodeConfig`-driven persist-and-apply.

pub mod clock;
pub mod config;
pub mod dgn;
pub mod edge_processor;
pub mod error;
pub mod event;
pub mod hash;
pub mod index;
pub mod node;
pub mod persistor;
pub mod snapshot;
pub mod wake;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{NodeError, PersistorError};
pub use event::{EventTime, NodeRef, QuineId};
pub use node::{spawn, DebugState, NodeHandle};
