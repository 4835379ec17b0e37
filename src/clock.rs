//! The per-node actor clock (spec §4.2).
//!
//! Grounded on the teacher's `lamport: Variable<LamportTimestamp>` / `reserve_lamports` pattern
//! in `swarm::lib.rs`: a single monotonic counter owned by the actor, bumped on demand and never
//! shared across threads (only the owning actor ever ticks its own clock).

use crate::event::EventTime;
use std::time::{SystemTime, UNIX_EPOCH};

/// Issues strictly-increasing `EventTime`s for a single node. Not `Sync`-shared: owned by the
/// node actor that issues events for that node, matching the single-writer requirement in spec
/// §4.4 ("every event issued observes a strictly greater EventTime than all preceding events").
#[derive(Debug, Default)]
pub struct ActorClock {
    last_issued: Option<EventTime>,
}

fn wall_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ActorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a clock after wake, so freshly-issued `EventTime`s continue strictly after the
    /// last one replayed from the journal.
    pub fn restored_at(last: EventTime) -> Self {
        Self { last_issued: Some(last) }
    }

    pub fn peek_event_sequence(&self) -> Option<EventTime> {
        self.last_issued
    }

    /// Returns a strictly-increasing `EventTime`. Wall time regressing (clock skew, NTP step) is
    /// absorbed by bumping off the last issued value instead, per spec §3's monotonicity
    /// invariant.
    pub fn tick_event_sequence(&mut self) -> EventTime {
        let wall = wall_millis_now();
        let candidate = match self.last_issued {
            None => EventTime::new(wall, 0),
            Some(last) if wall > last.wall_millis() => EventTime::new(wall, 0),
            Some(last) => last.next(),
        };
        self.last_issued = Some(candidate);
        candidate
    }

    /// Bumps the clock to match/exceed `at_time_override` before the next tick, per spec §4.2.
    /// Used when a caller supplies an explicit `at_override` to `process_*_event`.
    pub fn observe_override(&mut self, at_time_override: EventTime) {
        match self.last_issued {
            Some(last) if last >= at_time_override => {}
            _ => self.last_issued = Some(at_time_override),
        }
    }

    /// Stamps `count` events at once, each strictly after the previous, honoring an optional
    /// override for the first one.
    pub fn tick_many(&mut self, count: usize, at_override: Option<EventTime>) -> Vec<EventTime> {
        if let Some(at) = at_override {
            // The override names the time for the *first* event; subsequent events in the same
            // batch still need distinct, increasing times.
            self.last_issued = Some(match self.last_issued {
                Some(last) if last >= at => last,
                _ => {
                    // back off by one so the first tick() call below lands exactly on `at`.
                    EventTime::from_u64(at.as_u64().saturating_sub(1))
                }
            });
        }
        (0..count).map(|_| self.tick_monotonic_only()).collect()
    }

    /// Like `tick_event_sequence` but never reads the wall clock — purely increments the
    /// sequence counter. Used internally by `tick_many` once an override has seeded the clock,
    /// so a whole batch gets strictly increasing times even if wall time doesn't advance.
    fn tick_monotonic_only(&mut self) -> EventTime {
        let candidate = match self.last_issued {
            None => EventTime::new(wall_millis_now(), 0),
            Some(last) => last.next(),
        };
        self.last_issued = Some(candidate);
        candidate
    }
}
