//! Crate-wide error taxonomy (spec §7).
//!
//! Mirrors the `derive_more`-based error enum shape used by the teacher's
//! `event_store_ref::Error`: plain data-carrying variants, `Display` derived from a format
//! string per variant, `std::error::Error` derived via `derive_more::Error`.

use derive_more::{Display, Error};

/// Error surfaced by the persistor interface (C1).
#[derive(Debug, Clone, Display, Error)]
pub enum PersistorError {
    /// Backend reported a failure that is expected to clear up on its own (connection hiccup,
    /// overload, ...). `MemoryFirst` retries these forever; `PersistorFirst` surfaces them
    /// immediately (see Open Question 1 in SPEC_FULL.md).
    #[display(fmt = "transient persistor failure: {}", message)]
    Transient { message: String },
    /// Backend reported a failure that will not clear up by retrying (schema mismatch, codec
    /// failure, corrupted record). The node is marked unhealthy and refuses further writes.
    #[display(fmt = "permanent persistor failure: {}", message)]
    Permanent { message: String },
}

impl PersistorError {
    pub fn transient(message: impl Into<String>) -> Self {
        PersistorError::Transient { message: message.into() }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        PersistorError::Permanent { message: message.into() }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, PersistorError::Permanent { .. })
    }
}

/// Error surfaced by node actor operations (C4).
#[derive(Debug, Clone, Display, Error)]
pub enum NodeError {
    /// Caller attempted to mutate a historical (`at_time = Some(_)`) node ref. Never retried.
    #[display(fmt = "illegal update to historical node")]
    IllegalHistoricalUpdate,
    #[display(fmt = "{}", _0)]
    Persistor(PersistorError),
    /// The node has previously hit a `PersistorPermanent` failure and refuses further writes
    /// until operator intervention.
    #[display(fmt = "node is unhealthy and refuses further writes")]
    Unhealthy,
    /// The actor's message channel is gone (actor task ended, e.g. after a panic).
    #[display(fmt = "node actor is no longer running")]
    Gone,
}

impl From<PersistorError> for NodeError {
    fn from(e: PersistorError) -> Self {
        NodeError::Persistor(e)
    }
}

/// An assertion failure that should never be reachable in correct code, e.g. a mutation reaching
/// the apply path for a historical node after `guard_events` should have rejected it. Per spec §7
/// these panic the actor; the shard is expected to restart it in a clean state from the last
/// durable snapshot + journal.
#[derive(Debug, Clone, Display)]
#[display(fmt = "internal invariant violated: {}", message)]
pub struct InternalInvariantViolation {
    pub message: String,
}

impl InternalInvariantViolation {
    pub fn panic(message: impl Into<String>) -> ! {
        let message = message.into();
        tracing::error!(%message, "internal invariant violation, panicking actor");
        panic!("internal invariant violated: {}", message);
    }
}
