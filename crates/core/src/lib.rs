//! `tally-core`: domain foundation building blocks for the ledger engine.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model, monetary values, and the aggregate /
//! optimistic-concurrency vocabulary shared by every other crate.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod money;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion, Versioned};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, CounterpartyId, TenantId, UserId};
pub use money::{Currency, Money};
