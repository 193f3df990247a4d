//! Refunds against a settled instrument, as reported by the payment channel.
//!
//! A record is keyed by the channel's refund id. It starts out pending and is
//! completed once the channel reports success; a completed record is final.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, DomainResult, Money, TenantId, Versioned,
};
use tally_events::Event;

use crate::gateway::{ChannelId, RefundStatus};
use crate::instrument::InstrumentId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefundRecordId(pub AggregateId);

impl RefundRecordId {
    pub fn new() -> Self {
        Self(AggregateId::new())
    }
}

impl Default for RefundRecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for RefundRecordId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate root: one channel refund of (part of) an instrument's amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRecord {
    id: RefundRecordId,
    tenant_id: TenantId,
    instrument_id: InstrumentId,
    channel: ChannelId,
    external_refund_id: String,
    external_order_ref: String,
    amount: Money,
    status: RefundStatus,
    recorded_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    version: u64,
    pending_events: Vec<RefundEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRefund {
    pub tenant_id: TenantId,
    pub refund_id: RefundRecordId,
    pub instrument_id: InstrumentId,
    pub channel: ChannelId,
    pub external_refund_id: String,
    pub external_order_ref: String,
    pub amount: Money,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRefund {
    /// Amount the channel actually refunded; may differ from the requested one.
    pub amount: Money,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundCommand {
    Record(RecordRefund),
    Complete(CompleteRefund),
}

/// Event: RefundRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRecorded {
    pub tenant_id: TenantId,
    pub refund_id: RefundRecordId,
    pub instrument_id: InstrumentId,
    pub channel: ChannelId,
    pub external_refund_id: String,
    pub external_order_ref: String,
    pub amount: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RefundCompleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundCompleted {
    pub tenant_id: TenantId,
    pub refund_id: RefundRecordId,
    pub instrument_id: InstrumentId,
    pub external_refund_id: String,
    pub requested: Money,
    pub refunded: Money,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundEvent {
    Recorded(RefundRecorded),
    Completed(RefundCompleted),
}

impl Event for RefundEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RefundEvent::Recorded(_) => "ledger.refund.recorded",
            RefundEvent::Completed(_) => "ledger.refund.completed",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            RefundEvent::Recorded(e) => e.occurred_at,
            RefundEvent::Completed(e) => e.occurred_at,
        }
    }

    fn tenant_id(&self) -> TenantId {
        match self {
            RefundEvent::Recorded(e) => e.tenant_id,
            RefundEvent::Completed(e) => e.tenant_id,
        }
    }

    fn aggregate_id(&self) -> AggregateId {
        match self {
            RefundEvent::Recorded(e) => e.refund_id.0,
            RefundEvent::Completed(e) => e.refund_id.0,
        }
    }

    fn aggregate_type(&self) -> &'static str {
        "ledger.refund"
    }
}

impl RefundRecord {
    /// A new, unpersisted pending record.
    pub fn record(cmd: RecordRefund) -> DomainResult<Self> {
        let mut record = Self {
            id: cmd.refund_id,
            tenant_id: cmd.tenant_id,
            instrument_id: cmd.instrument_id,
            channel: cmd.channel.clone(),
            external_refund_id: cmd.external_refund_id.clone(),
            external_order_ref: cmd.external_order_ref.clone(),
            amount: cmd.amount,
            status: RefundStatus::Pending,
            recorded_at: cmd.occurred_at,
            completed_at: None,
            version: 0,
            pending_events: Vec::new(),
        };
        record.execute_and_record(&RefundCommand::Record(cmd))?;
        Ok(record)
    }

    /// Mark the refund as done by the channel.
    pub fn complete(&mut self, amount: Money, at: DateTime<Utc>) -> DomainResult<()> {
        self.execute_and_record(&RefundCommand::Complete(CompleteRefund {
            amount,
            occurred_at: at,
        }))
    }

    fn execute_and_record(&mut self, cmd: &RefundCommand) -> DomainResult<()> {
        let events = self.execute(cmd)?;
        self.pending_events.extend(events);
        Ok(())
    }

    pub fn take_events(&mut self) -> Vec<RefundEvent> {
        std::mem::take(&mut self.pending_events)
    }

    pub fn id_typed(&self) -> RefundRecordId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn instrument_id(&self) -> InstrumentId {
        self.instrument_id
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn external_refund_id(&self) -> &str {
        &self.external_refund_id
    }

    pub fn external_order_ref(&self) -> &str {
        &self.external_order_ref
    }

    pub fn amount(&self) -> Money {
        self.amount
    }

    pub fn status(&self) -> RefundStatus {
        self.status
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }
}

impl AggregateRoot for RefundRecord {
    type Id = RefundRecordId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Versioned for RefundRecord {
    fn mark_persisted(&mut self, version: u64) {
        self.version = version;
    }
}

impl Aggregate for RefundRecord {
    type Command = RefundCommand;
    type Event = RefundEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            RefundEvent::Recorded(_) => {}
            RefundEvent::Completed(e) => {
                self.status = RefundStatus::Success;
                self.amount = e.refunded;
                self.completed_at = Some(e.occurred_at);
            }
        }
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            RefundCommand::Record(cmd) => {
                if cmd.external_refund_id.trim().is_empty() {
                    return Err(DomainError::validation("refund id is required"));
                }
                if !cmd.amount.is_positive() {
                    return Err(DomainError::validation("refund amount must be positive"));
                }
                Ok(vec![RefundEvent::Recorded(RefundRecorded {
                    tenant_id: cmd.tenant_id,
                    refund_id: cmd.refund_id,
                    instrument_id: cmd.instrument_id,
                    channel: cmd.channel.clone(),
                    external_refund_id: cmd.external_refund_id.clone(),
                    external_order_ref: cmd.external_order_ref.clone(),
                    amount: cmd.amount,
                    occurred_at: cmd.occurred_at,
                })])
            }
            RefundCommand::Complete(cmd) => {
                if self.status != RefundStatus::Pending {
                    return Err(DomainError::invalid_state(format!(
                        "refund {} is {:?}, not pending",
                        self.external_refund_id, self.status
                    )));
                }
                if !cmd.amount.is_positive() {
                    return Err(DomainError::validation("refunded amount must be positive"));
                }
                if cmd.amount.currency() != self.amount.currency() {
                    return Err(DomainError::currency_mismatch(
                        self.amount.currency(),
                        cmd.amount.currency(),
                    ));
                }
                Ok(vec![RefundEvent::Completed(RefundCompleted {
                    tenant_id: self.tenant_id,
                    refund_id: self.id,
                    instrument_id: self.instrument_id,
                    external_refund_id: self.external_refund_id.clone(),
                    requested: self.amount,
                    refunded: cmd.amount,
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::Currency;

    fn cny(minor: i64) -> Money {
        Money::from_minor(minor, Currency::Cny)
    }

    fn pending(minor: i64) -> RefundRecord {
        RefundRecord::record(RecordRefund {
            tenant_id: TenantId::new(),
            refund_id: RefundRecordId::new(),
            instrument_id: InstrumentId::new(),
            channel: ChannelId::new("wechat"),
            external_refund_id: "RF-1".to_string(),
            external_order_ref: "ORDER-1".to_string(),
            amount: cny(minor),
            occurred_at: Utc::now(),
        })
        .unwrap()
    }

    #[test]
    fn recorded_refund_starts_pending() {
        let mut record = pending(1000);
        assert_eq!(record.status(), RefundStatus::Pending);
        assert_eq!(record.version(), 0);
        let events = record.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "ledger.refund.recorded");
        assert_eq!(events[0].aggregate_id(), record.id_typed().0);
    }

    #[test]
    fn completion_takes_the_refunded_amount() {
        let mut record = pending(1000);
        record.take_events();
        let at = Utc::now();
        record.complete(cny(900), at).unwrap();

        assert_eq!(record.status(), RefundStatus::Success);
        assert_eq!(record.amount(), cny(900));
        assert_eq!(record.completed_at(), Some(at));
        match &record.take_events()[..] {
            [RefundEvent::Completed(e)] => {
                assert_eq!(e.requested, cny(1000));
                assert_eq!(e.refunded, cny(900));
            }
            _ => panic!("Expected one Completed event"),
        }
    }

    #[test]
    fn completed_refund_cannot_complete_again() {
        let mut record = pending(1000);
        record.complete(cny(1000), Utc::now()).unwrap();
        record.take_events();

        let err = record.complete(cny(1000), Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
        assert!(record.take_events().is_empty());
    }

    #[test]
    fn blank_refund_id_or_empty_amount_is_rejected() {
        let base = RecordRefund {
            tenant_id: TenantId::new(),
            refund_id: RefundRecordId::new(),
            instrument_id: InstrumentId::new(),
            channel: ChannelId::new("wechat"),
            external_refund_id: " ".to_string(),
            external_order_ref: "ORDER-1".to_string(),
            amount: cny(1000),
            occurred_at: Utc::now(),
        };
        assert!(matches!(RefundRecord::record(base.clone()), Err(DomainError::Validation(_))));

        let zero = RecordRefund {
            external_refund_id: "RF-2".to_string(),
            amount: cny(0),
            ..base
        };
        assert!(matches!(RefundRecord::record(zero), Err(DomainError::Validation(_))));
    }

    #[test]
    fn refund_in_another_currency_is_rejected() {
        let mut record = pending(1000);
        let err = record
            .complete(Money::from_minor(1000, Currency::Usd), Utc::now())
            .unwrap_err();
        assert!(matches!(err, DomainError::CurrencyMismatch { .. }));
    }
}
