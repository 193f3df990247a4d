//! Publication of drained aggregate events.
//!
//! Services publish only after the write that produced the events succeeded.

use thiserror::Error;
use tracing::debug;

use tally_events::{EventEnvelope, EventPublisher};
use tally_ledger::LedgerEvent;

pub type LedgerEnvelope = EventEnvelope<LedgerEvent>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("event publication failed: {0}")]
pub struct PublishFailure(pub String);

/// Wrap each event in an envelope and publish it, stopping at the first failure.
pub fn publish_all<P, E, I>(publisher: &P, events: I) -> Result<usize, PublishFailure>
where
    P: EventPublisher<LedgerEnvelope> + ?Sized,
    E: Into<LedgerEvent>,
    I: IntoIterator<Item = E>,
{
    let mut published = 0;
    for event in events {
        let envelope = EventEnvelope::wrap(event.into());
        debug!(
            event_type = envelope.event_type(),
            tenant_id = %envelope.tenant_id(),
            aggregate_id = %envelope.aggregate_id(),
            "publishing ledger event"
        );
        publisher
            .publish(envelope)
            .map_err(|e| PublishFailure(e.to_string()))?;
        published += 1;
    }
    Ok(published)
}
