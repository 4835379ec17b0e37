//! The wake/sleep controller (spec §4.7, C7).
//!
//! Grounded on `util::reentrant_safe_mutex.rs`'s "behaves exactly like a normal lock, but panics
//! instead of deadlocking on misuse" idiom, adapted from a plain mutex to the reader-shared /
//! writer-exclusive shape spec §4.7 calls for (`actor_ref_lock`): many concurrent routers may read
//! the current `WakefulState` to deliver a message, but a sleep/wake transition needs exclusive
//! access while it swaps the state.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The node's lifecycle state (spec §3 "Lifecycle").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakefulState {
    Asleep,
    Waking,
    /// Carries nothing beyond the tag itself — the actor handle used for routing lives
    /// alongside this cell in the shard's own bookkeeping, not inside it (spec only requires the
    /// *state* to be consulted under the lock, per §4.7).
    Awake,
    GoingToSleep,
}

/// Reader-shared / writer-exclusive guard around `WakefulState`, read by the shard router on
/// every delivery attempt and taken exclusively during wake/sleep transitions (spec §4.7, §9
/// "Actor lock (`StampedLock`)"). `parking_lot::RwLock` gives us try-read semantics without
/// reentrancy, which is what spec §9 asks for; we don't need a full stamped-lock (optimistic
/// read) because reads here are cheap enum compares, not the kind of hot path that motivates
/// optimistic locking.
#[derive(Debug)]
pub struct ActorRefLock {
    state: RwLock<WakefulState>,
    cost_to_sleep: AtomicU64,
}

impl Default for ActorRefLock {
    fn default() -> Self {
        Self { state: RwLock::new(WakefulState::Asleep), cost_to_sleep: AtomicU64::new(0) }
    }
}

/// A snapshot read of the wakeful state, without committing to a transition.
pub struct ReadGuard<'a>(parking_lot::RwLockReadGuard<'a, WakefulState>);

impl<'a> std::ops::Deref for ReadGuard<'a> {
    type Target = WakefulState;
    fn deref(&self) -> &WakefulState {
        &self.0
    }
}

impl ActorRefLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-shared access for shard-level routing (spec §4.7 wake sequence step 1's counterpart
    /// on the read side: "route(NodeRef, Message) consults wakeful_state").
    pub fn read(&self) -> ReadGuard<'_> {
        ReadGuard(self.state.read())
    }

    /// Acquires the lock exclusively and runs `transition`, which observes the current state and
    /// returns the next one. Used for every wake/sleep step transition in §4.7.
    pub fn transition(&self, transition: impl FnOnce(&WakefulState) -> WakefulState) {
        let mut guard = self.state.write();
        *guard = transition(&guard);
    }

    pub fn cost_to_sleep(&self) -> u64 {
        self.cost_to_sleep.load(Ordering::Relaxed)
    }

    /// Bumped on each wake (spec §4.7 "Cost-to-sleep"): shards use this to bias eviction away from
    /// nodes that are expensive to bring back up (lower = cheaper to re-wake).
    pub fn record_wake(&self) {
        self.cost_to_sleep.fetch_add(1, Ordering::Relaxed);
    }
}

/// The external shard contract (spec §6 "To shard router"): this crate models only the interface
/// a shard is expected to provide, not the sharding/transport implementation itself.
pub trait ShardRouter: Send + Sync + 'static {
    /// Consults `wakeful_state` for the target node; if `Asleep`, triggers wake and stashes the
    /// message; if `Awake`, delivers under `actor_ref_lock` read-share.
    fn route(&self, lock: &Arc<ActorRefLock>);
}
