use chrono::{DateTime, Utc};

use tally_core::{AggregateId, TenantId};

/// A domain event: an immutable, versioned fact about one aggregate.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "ledger.obligation.opened").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32 {
        1
    }

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Tenant that owns the aggregate.
    fn tenant_id(&self) -> TenantId;

    /// Aggregate the event belongs to.
    fn aggregate_id(&self) -> AggregateId;

    /// Aggregate kind (e.g. "ledger.obligation").
    fn aggregate_type(&self) -> &'static str;
}
