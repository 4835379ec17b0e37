//! Per-node configuration (ambient stack expansion, SPEC_FULL.md §C.3).
//!
//! Shaped after the teacher's `SwarmConfig`: a plain `Clone + Debug` struct with a `::test()`
//! fixture constructor assembled via struct-update syntax. Loading this from files/env is outside
//! this crate's scope (spec.md §1 lists "configuration loading" as an external-layer concern).

use std::time::Duration;

/// Global policy selecting which `EdgeProcessor`/persist-and-apply ordering a node uses.
///
/// Spec §9: "Polymorphism over `EffectOrder` ... is a tagged variant, not subtype polymorphism."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectOrder {
    /// Durable before visible: persist succeeds before in-memory state changes.
    PersistorFirst,
    /// Visible before durable: in-memory state changes immediately, persistence is fire-and-forget
    /// with infinite retry.
    MemoryFirst,
}

/// Backoff parameters for the infinite-retry loop used by `MemoryFirst` persistence (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    pub base: Duration,
    pub cap: Duration,
    /// Jitter fraction applied symmetrically around the computed delay, e.g. `0.1` for ±10%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1),
            cap: Duration::from_secs(10),
            jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub effect_order: EffectOrder,
    /// Force a snapshot after every effective write (spec §4.4).
    pub snapshot_on_update: bool,
    /// When set, the persistor keeps only the latest snapshot, keyed under `EventTime::MAX`.
    pub snapshot_singleton: bool,
    pub retry: RetryConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            effect_order: EffectOrder::PersistorFirst,
            snapshot_on_update: false,
            snapshot_singleton: true,
            retry: RetryConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Fixture constructor for tests: fast retries, `MemoryFirst` ordering, snapshot on every
    /// update so wake-equivalence tests have deterministic, frequent snapshots to restore from.
    pub fn test() -> Self {
        Self {
            effect_order: EffectOrder::MemoryFirst,
            snapshot_on_update: true,
            retry: RetryConfig {
                base: Duration::from_micros(100),
                cap: Duration::from_millis(50),
                jitter: 0.1,
            },
            ..Default::default()
        }
    }
}
