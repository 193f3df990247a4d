//! Upstream fulfillment and return events become ledger obligations.
//!
//! Delivery is at-least-once. The (tenant, source type, source id) key makes a
//! repeat delivery a no-op, both through the up-front existence check and through
//! the store's uniqueness rule when two deliveries race.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use tally_core::{CounterpartyId, Currency, DomainError, Money, TenantId};
use tally_events::EventPublisher;
use tally_ledger::{
    LedgerObligation, ObligationId, ObligationKind, OpenObligation, SourceType, net_outstanding,
};

use crate::config::FinanceSettings;
use crate::publishing::{LedgerEnvelope, PublishFailure, publish_all};
use crate::repository::{DocumentNumberGenerator, ObligationRepository, RepositoryError};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamEventKind {
    SalesShipped,
    SalesReturned,
    SalesCancelled,
    PurchaseReceived,
    PurchaseReturned,
    PurchaseCancelled,
}

impl UpstreamEventKind {
    pub fn obligation_kind(self) -> ObligationKind {
        match self {
            UpstreamEventKind::SalesShipped
            | UpstreamEventKind::SalesReturned
            | UpstreamEventKind::SalesCancelled => ObligationKind::Receivable,
            UpstreamEventKind::PurchaseReceived
            | UpstreamEventKind::PurchaseReturned
            | UpstreamEventKind::PurchaseCancelled => ObligationKind::Payable,
        }
    }

    pub fn source_type(self) -> SourceType {
        match self {
            UpstreamEventKind::SalesShipped => SourceType::SalesOrder,
            UpstreamEventKind::SalesReturned => SourceType::SalesReturn,
            UpstreamEventKind::SalesCancelled => SourceType::SalesCancellation,
            UpstreamEventKind::PurchaseReceived => SourceType::PurchaseOrder,
            UpstreamEventKind::PurchaseReturned => SourceType::PurchaseReturn,
            UpstreamEventKind::PurchaseCancelled => SourceType::PurchaseCancellation,
        }
    }

    pub fn is_red_letter(self) -> bool {
        self.source_type().is_red_letter()
    }
}

/// A fulfillment, return or cancellation reported by the sales/purchasing side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamEvent {
    pub kind: UpstreamEventKind,
    pub tenant_id: TenantId,
    pub source_id: Uuid,
    pub source_number: String,
    /// Document a return or cancellation reverses.
    #[serde(default)]
    pub original_number: Option<String>,
    pub counterparty_id: CounterpartyId,
    pub counterparty_name: String,
    pub amount: Money,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionOutcome {
    Created {
        obligation_id: ObligationId,
        number: String,
    },
    /// An obligation for this source already exists.
    AlreadyIngested,
    /// Nothing to book.
    ZeroAmount,
}

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// The obligation was stored; only its events failed to go out.
    #[error(transparent)]
    Publish(#[from] PublishFailure),
}

pub struct EventIngestionGateway<S, P> {
    store: S,
    publisher: P,
    payment_term: Duration,
}

impl<S, P> EventIngestionGateway<S, P>
where
    S: ObligationRepository + DocumentNumberGenerator,
    P: EventPublisher<LedgerEnvelope>,
{
    pub fn new(store: S, publisher: P, settings: &FinanceSettings) -> Self {
        Self {
            store,
            publisher,
            payment_term: settings.payment_term(),
        }
    }

    /// Book one upstream event. Repository failures propagate so the message layer
    /// can redeliver; nothing is retried here.
    #[instrument(
        skip_all,
        fields(
            tenant_id = %event.tenant_id,
            kind = ?event.kind,
            source_number = %event.source_number
        )
    )]
    pub fn ingest(&self, event: &UpstreamEvent) -> Result<IngestionOutcome, IngestionError> {
        let source_type = event.kind.source_type();
        if self
            .store
            .exists_by_source(event.tenant_id, source_type, event.source_id)?
        {
            info!(source_id = %event.source_id, "source already booked; skipping");
            return Ok(IngestionOutcome::AlreadyIngested);
        }
        if event.amount.is_zero() {
            debug!("zero amount; nothing to book");
            return Ok(IngestionOutcome::ZeroAmount);
        }

        let kind = event.kind.obligation_kind();
        let number = self
            .store
            .generate_document_number(event.tenant_id, kind.document_kind())?;
        let mut obligation = LedgerObligation::open(self.open_command(event, kind, number.clone()))?;

        match self.store.insert(&mut obligation) {
            Ok(()) => {}
            Err(RepositoryError::DuplicateSource { .. }) => {
                info!(source_id = %event.source_id, "lost insert race to a duplicate delivery");
                return Ok(IngestionOutcome::AlreadyIngested);
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            number = %number,
            total = %obligation.total(),
            red_letter = obligation.is_red_letter(),
            "obligation booked"
        );
        publish_all(&self.publisher, obligation.take_events())?;

        Ok(IngestionOutcome::Created {
            obligation_id: obligation.id_typed(),
            number,
        })
    }

    /// Net open amount with a counterparty: ordinary obligations minus red-letter ones.
    pub fn net_position(
        &self,
        tenant_id: TenantId,
        counterparty_id: CounterpartyId,
        kind: ObligationKind,
        currency: Currency,
    ) -> Result<Money, IngestionError> {
        let open = self.store.find_outstanding(tenant_id, counterparty_id, kind)?;
        Ok(net_outstanding(kind, currency, &open)?)
    }

    fn open_command(&self, event: &UpstreamEvent, kind: ObligationKind, number: String) -> OpenObligation {
        let red_letter = event.kind.is_red_letter();
        let (total, due_date, remark) = if red_letter {
            let original = event
                .original_number
                .as_deref()
                .unwrap_or(event.source_number.as_str());
            (
                event.amount.abs(),
                event.occurred_at,
                Some(format!("Red-letter entry reversing {original} ({})", event.source_number)),
            )
        } else {
            // Due dates follow business time, not delivery time.
            (event.amount, event.occurred_at + self.payment_term, None)
        };

        OpenObligation {
            tenant_id: event.tenant_id,
            obligation_id: ObligationId::new(),
            kind,
            number,
            counterparty_id: event.counterparty_id,
            counterparty_name: event.counterparty_name.clone(),
            source_type: event.kind.source_type(),
            source_id: event.source_id,
            source_number: event.source_number.clone(),
            total,
            due_date: Some(due_date),
            remark,
            occurred_at: event.occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tally_events::InMemoryEventPublisher;
    use tally_ledger::ObligationStatus;

    use crate::repository::InMemoryLedgerStore;

    type Gateway = EventIngestionGateway<Arc<InMemoryLedgerStore>, Arc<InMemoryEventPublisher<LedgerEnvelope>>>;

    fn cny(minor: i64) -> Money {
        Money::from_minor(minor, Currency::Cny)
    }

    fn setup() -> (Gateway, Arc<InMemoryLedgerStore>, Arc<InMemoryEventPublisher<LedgerEnvelope>>) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let publisher = Arc::new(InMemoryEventPublisher::new());
        let gateway = EventIngestionGateway::new(store.clone(), publisher.clone(), &FinanceSettings::default());
        (gateway, store, publisher)
    }

    fn event(kind: UpstreamEventKind, tenant_id: TenantId, counterparty_id: CounterpartyId, minor: i64) -> UpstreamEvent {
        UpstreamEvent {
            kind,
            tenant_id,
            source_id: Uuid::new_v4(),
            source_number: "SO-20260124-0001".to_string(),
            original_number: None,
            counterparty_id,
            counterparty_name: "Acme Trading".to_string(),
            amount: cny(minor),
            occurred_at: Utc::now(),
        }
    }

    fn created(outcome: IngestionOutcome) -> ObligationId {
        match outcome {
            IngestionOutcome::Created { obligation_id, .. } => obligation_id,
            other => panic!("expected Created, got {other:?}"),
        }
    }

    #[test]
    fn shipment_books_receivable_due_after_term() {
        let (gateway, store, publisher) = setup();
        let ev = event(UpstreamEventKind::SalesShipped, TenantId::new(), CounterpartyId::new(), 20000);

        let id = created(gateway.ingest(&ev).unwrap());
        let obligation = ObligationRepository::find_by_id(&*store, ev.tenant_id, id).unwrap().unwrap();

        assert_eq!(obligation.kind(), ObligationKind::Receivable);
        assert_eq!(obligation.status(), ObligationStatus::Pending);
        assert_eq!(obligation.total(), cny(20000));
        assert_eq!(obligation.due_date(), Some(ev.occurred_at + Duration::days(30)));
        assert!(obligation.number().starts_with("AR-"));
        assert_eq!(publisher.published_count(), 1);
        assert_eq!(publisher.published()[0].event_type(), "ledger.obligation.opened");
    }

    #[test]
    fn late_delivery_keeps_the_business_due_date() {
        let (gateway, store, _) = setup();
        let mut ev = event(UpstreamEventKind::SalesShipped, TenantId::new(), CounterpartyId::new(), 20000);
        ev.occurred_at = Utc::now() - Duration::days(12);

        let id = created(gateway.ingest(&ev).unwrap());
        let obligation = ObligationRepository::find_by_id(&*store, ev.tenant_id, id).unwrap().unwrap();
        assert_eq!(obligation.due_date(), Some(ev.occurred_at + Duration::days(30)));
        assert_eq!(obligation.days_overdue(ev.occurred_at + Duration::days(31)), 1);
    }

    #[test]
    fn redelivery_books_exactly_once() {
        let (gateway, store, publisher) = setup();
        let ev = event(UpstreamEventKind::PurchaseReceived, TenantId::new(), CounterpartyId::new(), 5000);

        created(gateway.ingest(&ev).unwrap());
        assert_eq!(gateway.ingest(&ev).unwrap(), IngestionOutcome::AlreadyIngested);

        let open = store
            .find_outstanding(ev.tenant_id, ev.counterparty_id, ObligationKind::Payable)
            .unwrap();
        assert_eq!(open.len(), 1);
        assert!(open[0].number().starts_with("AP-"));
        assert_eq!(publisher.published_count(), 1);
    }

    #[test]
    fn zero_amount_is_skipped() {
        let (gateway, store, publisher) = setup();
        let ev = event(UpstreamEventKind::SalesShipped, TenantId::new(), CounterpartyId::new(), 0);
        assert_eq!(gateway.ingest(&ev).unwrap(), IngestionOutcome::ZeroAmount);
        assert!(!store.exists_by_source(ev.tenant_id, SourceType::SalesOrder, ev.source_id).unwrap());
        assert_eq!(publisher.published_count(), 0);
    }

    #[test]
    fn return_books_red_letter_due_now() {
        let (gateway, store, _) = setup();
        let mut ev = event(UpstreamEventKind::SalesReturned, TenantId::new(), CounterpartyId::new(), -3000);
        ev.source_number = "SR-1".to_string();
        ev.original_number = Some("SO-1".to_string());

        let id = created(gateway.ingest(&ev).unwrap());
        let obligation = ObligationRepository::find_by_id(&*store, ev.tenant_id, id).unwrap().unwrap();

        assert!(obligation.is_red_letter());
        assert_eq!(obligation.total(), cny(3000));
        assert_eq!(obligation.due_date(), Some(ev.occurred_at));
        assert!(obligation.remark().unwrap().contains("SO-1"));
    }

    #[test]
    fn net_position_subtracts_red_letter_entries() {
        let (gateway, _, _) = setup();
        let tenant = TenantId::new();
        let customer = CounterpartyId::new();

        gateway.ingest(&event(UpstreamEventKind::SalesShipped, tenant, customer, 10000)).unwrap();
        gateway.ingest(&event(UpstreamEventKind::SalesShipped, tenant, customer, 5000)).unwrap();
        gateway.ingest(&event(UpstreamEventKind::SalesCancelled, tenant, customer, 2500)).unwrap();

        let net = gateway
            .net_position(tenant, customer, ObligationKind::Receivable, Currency::Cny)
            .unwrap();
        assert_eq!(net, cny(12500));
    }
}
