//! Ledger events and the publishing boundary.
//!
//! Aggregates describe what happened as typed [`Event`]s. Services wrap them in an
//! [`EventEnvelope`] once the write that produced them is durable and hand them to an
//! [`EventPublisher`].

pub mod envelope;
pub mod event;
pub mod publisher;

pub use envelope::EventEnvelope;
pub use event::Event;
pub use publisher::{EventPublisher, InMemoryEventPublisher, PublishError, Subscription};
