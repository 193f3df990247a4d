//! Aggregate roots and the optimistic-concurrency vocabulary.

/// Aggregate root marker + minimal interface.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Revision last acknowledged by storage.
    ///
    /// `0` means the aggregate has never been persisted. In-memory mutations do not
    /// change it; only a successful version-checked write does.
    fn version(&self) -> u64;
}

/// Aggregates persisted through a version-checked write.
pub trait Versioned: AggregateRoot {
    /// Record the revision storage assigned after a successful write.
    fn mark_persisted(&mut self, version: u64);
}

/// Optimistic concurrency expectation for a write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The key must not exist yet (first insert).
    Absent,
    /// Require the stored aggregate to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Expectation derived from an aggregate's in-memory version.
    pub fn of<A: AggregateRoot + ?Sized>(aggregate: &A) -> Self {
        match aggregate.version() {
            0 => ExpectedVersion::Absent,
            v => ExpectedVersion::Exact(v),
        }
    }

    /// Does the stored version (`None` when the key is missing) satisfy this expectation?
    pub fn matches(self, stored: Option<u64>) -> bool {
        match (self, stored) {
            (ExpectedVersion::Absent, None) => true,
            (ExpectedVersion::Exact(v), Some(actual)) => v == actual,
            _ => false,
        }
    }

    /// Version storage assigns once the write is accepted.
    pub fn next(self) -> u64 {
        match self {
            ExpectedVersion::Absent => 1,
            ExpectedVersion::Exact(v) => v + 1,
        }
    }
}

/// Aggregate execution semantics (pure, deterministic).
///
/// - **Decision logic**: `handle(&self, cmd)` returns events.
/// - **State mutation**: `apply(&mut self, event)` evolves state.
///
/// Aggregates must not perform IO or side effects.
pub trait Aggregate: AggregateRoot {
    type Command: Clone + core::fmt::Debug;
    type Event: Clone + core::fmt::Debug;
    type Error: core::fmt::Debug;

    /// Evolve in-memory state from a single event.
    fn apply(&mut self, event: &Self::Event);

    /// Decide which events to emit given the current state and a command.
    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    /// Handle a command and apply the resulting events in order.
    fn execute(&mut self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let events = self.handle(command)?;
        for event in &events {
            self.apply(event);
        }
        Ok(events)
    }
}
