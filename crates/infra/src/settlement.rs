//! Settlement application service.
//!
//! Loads aggregates, lets them (or the reconciliation engine) decide, writes the
//! result through a version-checked save and publishes what was recorded.
//!
//! ```text
//! reconcile(tenant, instrument, request)
//!   -> load instrument + outstanding obligations of its counterparty
//!   -> engine plans and applies (in memory, all or nothing)
//!   -> commit instrument + touched obligations (one atomic, version-checked write)
//!   -> publish drained events
//! ```

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, instrument};

use tally_core::{CounterpartyId, DomainError, Money, TenantId, UserId};
use tally_events::EventPublisher;
use tally_ledger::{
    AllocationPlan, InstrumentId, InstrumentKind, LedgerEvent, LedgerObligation, ObligationId,
    PaymentMethod, ReconcileRequest, ReconciliationEngine, ReconciliationOutcome,
    RegisterInstrument, SettlementInstrument,
};

use crate::publishing::{LedgerEnvelope, PublishFailure, publish_all};
use crate::repository::{
    DocumentNumberGenerator, InstrumentRepository, ObligationRepository, ReconciliationStore,
    RepositoryError,
};

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// The write succeeded; only publication failed.
    #[error(transparent)]
    Publish(#[from] PublishFailure),
}

impl SettlementError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SettlementError::Repository(e) if e.is_retryable())
    }
}

/// Input for registering a new instrument. The document number is assigned here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInstrument {
    pub tenant_id: TenantId,
    pub kind: InstrumentKind,
    pub counterparty_id: CounterpartyId,
    pub counterparty_name: String,
    pub amount: Money,
    pub payment_method: PaymentMethod,
    pub payment_reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Storage contracts the settlement flows need.
pub trait SettlementStore:
    InstrumentRepository + ObligationRepository + ReconciliationStore + DocumentNumberGenerator
{
}

impl<T> SettlementStore for T where
    T: InstrumentRepository + ObligationRepository + ReconciliationStore + DocumentNumberGenerator
{
}

pub struct SettlementService<S, P> {
    store: S,
    publisher: P,
    engine: ReconciliationEngine,
}

impl<S, P> SettlementService<S, P>
where
    S: SettlementStore,
    P: EventPublisher<LedgerEnvelope>,
{
    pub fn new(store: S, publisher: P, engine: ReconciliationEngine) -> Self {
        Self {
            store,
            publisher,
            engine,
        }
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn publish<E, I>(&self, events: I) -> Result<usize, PublishFailure>
    where
        E: Into<LedgerEvent>,
        I: IntoIterator<Item = E>,
    {
        publish_all(&self.publisher, events)
    }

    #[instrument(skip_all, fields(tenant_id = %request.tenant_id, kind = ?request.kind))]
    pub fn register_instrument(&self, request: NewInstrument) -> Result<SettlementInstrument, SettlementError> {
        let number = self
            .store
            .generate_document_number(request.tenant_id, request.kind.document_kind())?;
        let mut instrument = SettlementInstrument::register(RegisterInstrument {
            tenant_id: request.tenant_id,
            instrument_id: InstrumentId::new(),
            kind: request.kind,
            number,
            counterparty_id: request.counterparty_id,
            counterparty_name: request.counterparty_name,
            amount: request.amount,
            payment_method: request.payment_method,
            payment_reference: request.payment_reference,
            occurred_at: request.occurred_at,
        })?;

        InstrumentRepository::insert(&self.store, &mut instrument)?;
        info!(number = instrument.number(), amount = %instrument.amount(), "instrument registered");
        self.publish(instrument.take_events())?;
        Ok(instrument)
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id, instrument_id = %id))]
    pub fn confirm_instrument(
        &self,
        tenant_id: TenantId,
        id: InstrumentId,
        confirmed_by: Option<UserId>,
        at: DateTime<Utc>,
    ) -> Result<SettlementInstrument, SettlementError> {
        let mut instrument = self.load_instrument(tenant_id, id)?;
        instrument.confirm(confirmed_by, None, at)?;
        self.save_instrument(&mut instrument)?;
        info!(number = instrument.number(), "instrument confirmed");
        Ok(instrument)
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id, instrument_id = %id))]
    pub fn set_payment_reference(
        &self,
        tenant_id: TenantId,
        id: InstrumentId,
        reference: &str,
        at: DateTime<Utc>,
    ) -> Result<SettlementInstrument, SettlementError> {
        let mut instrument = self.load_instrument(tenant_id, id)?;
        instrument.set_payment_reference(reference, at)?;
        self.save_instrument(&mut instrument)?;
        Ok(instrument)
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id, instrument_id = %id))]
    pub fn cancel_instrument(
        &self,
        tenant_id: TenantId,
        id: InstrumentId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<SettlementInstrument, SettlementError> {
        let mut instrument = self.load_instrument(tenant_id, id)?;
        instrument.cancel(reason, at)?;
        self.save_instrument(&mut instrument)?;
        info!(number = instrument.number(), reason, "instrument cancelled");
        Ok(instrument)
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id, obligation_id = %id))]
    pub fn cancel_obligation(
        &self,
        tenant_id: TenantId,
        id: ObligationId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<LedgerObligation, SettlementError> {
        let mut obligation = ObligationRepository::find_by_id(&self.store, tenant_id, id)?
            .ok_or_else(|| DomainError::not_found(format!("obligation {id}")))?;
        obligation.cancel(reason, at)?;
        ObligationRepository::save_with_version_check(&self.store, &mut obligation)?;
        info!(number = obligation.number(), reason, "obligation cancelled");
        self.publish(obligation.take_events())?;
        Ok(obligation)
    }

    /// Plan a reconciliation without writing anything.
    pub fn preview(
        &self,
        tenant_id: TenantId,
        instrument_id: InstrumentId,
        request: &ReconcileRequest,
    ) -> Result<AllocationPlan, SettlementError> {
        let instrument = self.load_instrument(tenant_id, instrument_id)?;
        let obligations = self.candidates_for(&instrument)?;
        Ok(self.engine.preview(&instrument, &obligations, request)?)
    }

    /// Reconcile an instrument against its counterparty's outstanding obligations.
    ///
    /// A stale instrument or obligation fails the whole call with
    /// [`RepositoryError::StaleVersion`]; nothing is written and nothing retried.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, instrument_id = %instrument_id))]
    pub fn reconcile(
        &self,
        tenant_id: TenantId,
        instrument_id: InstrumentId,
        request: &ReconcileRequest,
    ) -> Result<ReconciliationOutcome, SettlementError> {
        let mut instrument = self.load_instrument(tenant_id, instrument_id)?;
        self.reconcile_loaded(&mut instrument, request)
    }

    /// Reconcile an instrument the caller already holds at its stored revision.
    pub(crate) fn reconcile_loaded(
        &self,
        instrument: &mut SettlementInstrument,
        request: &ReconcileRequest,
    ) -> Result<ReconciliationOutcome, SettlementError> {
        let mut obligations = self.candidates_for(instrument)?;
        let outcome = self.engine.reconcile(instrument, &mut obligations, request)?;

        if outcome.records.is_empty() {
            info!(number = instrument.number(), "no outstanding obligations to reconcile");
            return Ok(outcome);
        }

        let mut touched: Vec<LedgerObligation> = obligations
            .into_iter()
            .filter(|o| outcome.touched.contains(&o.id_typed()))
            .collect();
        self.store.commit_reconciliation(instrument, &mut touched)?;

        info!(
            number = instrument.number(),
            strategy = %outcome.strategy,
            total_reconciled = %outcome.total_reconciled,
            remaining = %outcome.remaining_unallocated,
            fully_reconciled = outcome.fully_reconciled,
            "reconciliation committed"
        );

        let mut events: Vec<LedgerEvent> = instrument.take_events().into_iter().map(Into::into).collect();
        for obligation in &mut touched {
            events.extend(obligation.take_events().into_iter().map(LedgerEvent::from));
        }
        self.publish(events)?;
        Ok(outcome)
    }

    fn load_instrument(
        &self,
        tenant_id: TenantId,
        id: InstrumentId,
    ) -> Result<SettlementInstrument, SettlementError> {
        InstrumentRepository::find_by_id(&self.store, tenant_id, id)?
            .ok_or_else(|| DomainError::not_found(format!("instrument {id}")).into())
    }

    fn candidates_for(&self, instrument: &SettlementInstrument) -> Result<Vec<LedgerObligation>, SettlementError> {
        Ok(self.store.find_outstanding(
            instrument.tenant_id(),
            instrument.counterparty_id(),
            instrument.kind().settles(),
        )?)
    }

    pub(crate) fn save_instrument(&self, instrument: &mut SettlementInstrument) -> Result<(), SettlementError> {
        InstrumentRepository::save_with_version_check(&self.store, instrument)?;
        self.publish(instrument.take_events())?;
        Ok(())
    }
}
