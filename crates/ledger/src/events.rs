//! The ledger's outbound event stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{AggregateId, TenantId};
use tally_events::Event;

use crate::balance::BalanceEvent;
use crate::gateway::GatewayEvent;
use crate::instrument::InstrumentEvent;
use crate::obligation::ObligationEvent;
use crate::refund::RefundEvent;

/// Every event the ledger publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    Obligation(ObligationEvent),
    Instrument(InstrumentEvent),
    Balance(BalanceEvent),
    Gateway(GatewayEvent),
    Refund(RefundEvent),
}

impl From<ObligationEvent> for LedgerEvent {
    fn from(value: ObligationEvent) -> Self {
        LedgerEvent::Obligation(value)
    }
}

impl From<InstrumentEvent> for LedgerEvent {
    fn from(value: InstrumentEvent) -> Self {
        LedgerEvent::Instrument(value)
    }
}

impl From<BalanceEvent> for LedgerEvent {
    fn from(value: BalanceEvent) -> Self {
        LedgerEvent::Balance(value)
    }
}

impl From<GatewayEvent> for LedgerEvent {
    fn from(value: GatewayEvent) -> Self {
        LedgerEvent::Gateway(value)
    }
}

impl From<RefundEvent> for LedgerEvent {
    fn from(value: RefundEvent) -> Self {
        LedgerEvent::Refund(value)
    }
}

macro_rules! delegate {
    ($self:ident, $method:ident) => {
        match $self {
            LedgerEvent::Obligation(e) => e.$method(),
            LedgerEvent::Instrument(e) => e.$method(),
            LedgerEvent::Balance(e) => e.$method(),
            LedgerEvent::Gateway(e) => e.$method(),
            LedgerEvent::Refund(e) => e.$method(),
        }
    };
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        delegate!(self, event_type)
    }

    fn version(&self) -> u32 {
        delegate!(self, version)
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        delegate!(self, occurred_at)
    }

    fn tenant_id(&self) -> TenantId {
        delegate!(self, tenant_id)
    }

    fn aggregate_id(&self) -> AggregateId {
        delegate!(self, aggregate_id)
    }

    fn aggregate_type(&self) -> &'static str {
        delegate!(self, aggregate_type)
    }
}
