//! Edge effect-checking and the shared infinite-retry backoff helper (spec §4.3, C3).
//!
//! Per spec §9, the choice between `PersistorFirst`/`MemoryFirst` is a tagged variant dispatched
//! by matching on `EffectOrder`, never subtype polymorphism — see `node::NodeActor::apply_and_persist`
//! for the actual persist-and-apply orchestration shared between the edge and property paths
//! (spec §4.4 names this machinery generically; §4.3 restates it specifically for edges). This
//! module carries only what's specific to edges: the no-op effect check, and the retry loop that
//! both edge and property `MemoryFirst` writes (and `MemoryFirst` snapshot writes) share.

use crate::config::RetryConfig;
use crate::error::PersistorError;
use crate::event::{Direction, EdgeEvent, HalfEdge};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Ordered, duplicate-free collection of this node's half-edges (spec §3: "Duplicates are
/// forbidden; insertion order preserved for replay determinism").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeSet {
    order: Vec<HalfEdge>,
}

impl EdgeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, edge: &HalfEdge) -> bool {
        self.order.contains(edge)
    }

    pub fn insert(&mut self, edge: HalfEdge) {
        if !self.contains(&edge) {
            self.order.push(edge);
        }
    }

    pub fn remove(&mut self, edge: &HalfEdge) {
        self.order.retain(|e| e != edge);
    }

    pub fn iter(&self) -> impl Iterator<Item = &HalfEdge> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn by_label<'a>(&'a self, direction: Direction, label: &'a str) -> impl Iterator<Item = &'a HalfEdge> {
        self.order
            .iter()
            .filter(move |e| e.direction == direction && e.label == label)
    }
}

/// No-op check for edge events (spec §4.3): `EdgeAdded` has no effect if already present,
/// `EdgeRemoved` has no effect if absent.
pub fn has_effect(existing: &EdgeSet, event: &EdgeEvent) -> bool {
    match event {
        EdgeEvent::Added(e) => !existing.contains(e),
        EdgeEvent::Removed(e) => existing.contains(e),
    }
}

/// Applies an effective edge event to the in-memory collection. Callers are expected to have
/// already filtered through `has_effect`.
pub fn apply(existing: &mut EdgeSet, event: &EdgeEvent) {
    match event {
        EdgeEvent::Added(e) => existing.insert(e.clone()),
        EdgeEvent::Removed(e) => existing.remove(e),
    }
}

/// Outcome of an infinite retry loop: it either eventually succeeds, or gives up because the
/// backend reported a `Permanent` failure (spec §7: permanent failures are never retried, not
/// even under `MemoryFirst` — the node is marked unhealthy instead of retrying forever against a
/// backend that will never accept the write).
pub enum RetryOutcome {
    Succeeded,
    GaveUpPermanently(PersistorError),
}

/// Jittered exponential backoff, doubling from `retry.base` up to `retry.cap`, ±`retry.jitter`
/// fraction, retried forever on `Transient` failures. Grounded in `swarm::discovery.rs`'s
/// `Dialer` backoff-doubling-with-cap idiom for redialing peers.
pub async fn retry_forever<F, Fut>(retry: RetryConfig, label: &str, mut attempt: F) -> RetryOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), PersistorError>>,
{
    let mut delay = retry.base;
    loop {
        match attempt().await {
            Ok(()) => return RetryOutcome::Succeeded,
            Err(e) if e.is_permanent() => {
                tracing::error!(%label, error = %e, "persistor reported a permanent failure, giving up");
                return RetryOutcome::GaveUpPermanently(e);
            }
            Err(e) => {
                tracing::warn!(%label, error = %e, delay_ms = delay.as_millis() as u64, "retrying after transient persistor failure");
                tokio::time::sleep(jittered(delay, retry.jitter)).await;
                delay = (delay * 2).min(retry.cap);
            }
        }
    }
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let mut rng = rand::thread_rng();
    let factor = 1.0 + rng.gen_range(-jitter..=jitter);
    Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
}
