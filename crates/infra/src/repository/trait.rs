use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use tally_core::{CounterpartyId, TenantId};
use tally_ledger::{
    BalanceAccount, ChannelId, DocumentKind, InstrumentId, LedgerObligation, ObligationId,
    ObligationKind, RefundRecord, SettlementInstrument, SourceType,
};

/// Repository operation error.
///
/// These are storage failures, as opposed to the domain errors the aggregates raise.
/// Only [`RepositoryError::StaleVersion`] is worth retrying, and never by the ledger
/// itself: the caller reloads and decides.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("stale {aggregate} {id}: expected version {expected}, found {actual}")]
    StaleVersion {
        aggregate: &'static str,
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("duplicate {0}")]
    Duplicate(String),

    #[error("an obligation already exists for {source_type:?} {source_id}")]
    DuplicateSource { source_type: SourceType, source_id: Uuid },

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl RepositoryError {
    /// Whether reloading and retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepositoryError::StaleVersion { .. })
    }
}

/// Obligation persistence.
///
/// `insert` requires the aggregate to be unpersisted and its source key unused.
/// `save_with_version_check` is a conditional update against the aggregate's
/// in-memory version. Both stamp the stored revision back onto the aggregate.
pub trait ObligationRepository: Send + Sync {
    fn find_by_id(
        &self,
        tenant_id: TenantId,
        id: ObligationId,
    ) -> Result<Option<LedgerObligation>, RepositoryError>;

    /// Non-terminal obligations with an outstanding amount, oldest first.
    fn find_outstanding(
        &self,
        tenant_id: TenantId,
        counterparty_id: CounterpartyId,
        kind: ObligationKind,
    ) -> Result<Vec<LedgerObligation>, RepositoryError>;

    fn exists_by_source(
        &self,
        tenant_id: TenantId,
        source_type: SourceType,
        source_id: Uuid,
    ) -> Result<bool, RepositoryError>;

    fn insert(&self, obligation: &mut LedgerObligation) -> Result<(), RepositoryError>;

    fn save_with_version_check(&self, obligation: &mut LedgerObligation) -> Result<(), RepositoryError>;
}

/// Settlement instrument persistence.
pub trait InstrumentRepository: Send + Sync {
    fn find_by_id(
        &self,
        tenant_id: TenantId,
        id: InstrumentId,
    ) -> Result<Option<SettlementInstrument>, RepositoryError>;

    /// Lookup by payment reference. Callbacks carry no tenant, so this is the one
    /// unscoped read; the tenant comes from the instrument found.
    fn find_by_external_reference(
        &self,
        reference: &str,
    ) -> Result<Option<SettlementInstrument>, RepositoryError>;

    fn insert(&self, instrument: &mut SettlementInstrument) -> Result<(), RepositoryError>;

    fn save_with_version_check(
        &self,
        instrument: &mut SettlementInstrument,
    ) -> Result<(), RepositoryError>;
}

/// Prepaid balance persistence. One account per (tenant, customer).
pub trait BalanceAccountRepository: Send + Sync {
    fn find_by_customer(
        &self,
        tenant_id: TenantId,
        customer_id: CounterpartyId,
    ) -> Result<Option<BalanceAccount>, RepositoryError>;

    fn insert(&self, account: &mut BalanceAccount) -> Result<(), RepositoryError>;

    fn save_with_version_check(&self, account: &mut BalanceAccount) -> Result<(), RepositoryError>;
}

/// Refund record persistence, keyed by the channel's refund id.
pub trait RefundRepository: Send + Sync {
    /// Unscoped like [`InstrumentRepository::find_by_external_reference`]: refund
    /// callbacks carry no tenant either.
    fn find_by_external_refund_id(
        &self,
        channel: &ChannelId,
        external_refund_id: &str,
    ) -> Result<Option<RefundRecord>, RepositoryError>;

    fn insert(&self, record: &mut RefundRecord) -> Result<(), RepositoryError>;

    fn save_with_version_check(&self, record: &mut RefundRecord) -> Result<(), RepositoryError>;
}

/// Per-tenant, per-day document sequences.
pub trait DocumentNumberGenerator: Send + Sync {
    fn generate_document_number(
        &self,
        tenant_id: TenantId,
        kind: DocumentKind,
    ) -> Result<String, RepositoryError>;
}

/// Atomic write of one reconciliation.
///
/// Every aggregate is version-checked before anything is written; one stale
/// aggregate rejects the whole commit.
pub trait ReconciliationStore: Send + Sync {
    fn commit_reconciliation(
        &self,
        instrument: &mut SettlementInstrument,
        obligations: &mut [LedgerObligation],
    ) -> Result<(), RepositoryError>;
}

impl<S> ObligationRepository for Arc<S>
where
    S: ObligationRepository + ?Sized,
{
    fn find_by_id(
        &self,
        tenant_id: TenantId,
        id: ObligationId,
    ) -> Result<Option<LedgerObligation>, RepositoryError> {
        (**self).find_by_id(tenant_id, id)
    }

    fn find_outstanding(
        &self,
        tenant_id: TenantId,
        counterparty_id: CounterpartyId,
        kind: ObligationKind,
    ) -> Result<Vec<LedgerObligation>, RepositoryError> {
        (**self).find_outstanding(tenant_id, counterparty_id, kind)
    }

    fn exists_by_source(
        &self,
        tenant_id: TenantId,
        source_type: SourceType,
        source_id: Uuid,
    ) -> Result<bool, RepositoryError> {
        (**self).exists_by_source(tenant_id, source_type, source_id)
    }

    fn insert(&self, obligation: &mut LedgerObligation) -> Result<(), RepositoryError> {
        (**self).insert(obligation)
    }

    fn save_with_version_check(&self, obligation: &mut LedgerObligation) -> Result<(), RepositoryError> {
        (**self).save_with_version_check(obligation)
    }
}

impl<S> InstrumentRepository for Arc<S>
where
    S: InstrumentRepository + ?Sized,
{
    fn find_by_id(
        &self,
        tenant_id: TenantId,
        id: InstrumentId,
    ) -> Result<Option<SettlementInstrument>, RepositoryError> {
        (**self).find_by_id(tenant_id, id)
    }

    fn find_by_external_reference(
        &self,
        reference: &str,
    ) -> Result<Option<SettlementInstrument>, RepositoryError> {
        (**self).find_by_external_reference(reference)
    }

    fn insert(&self, instrument: &mut SettlementInstrument) -> Result<(), RepositoryError> {
        (**self).insert(instrument)
    }

    fn save_with_version_check(
        &self,
        instrument: &mut SettlementInstrument,
    ) -> Result<(), RepositoryError> {
        (**self).save_with_version_check(instrument)
    }
}

impl<S> BalanceAccountRepository for Arc<S>
where
    S: BalanceAccountRepository + ?Sized,
{
    fn find_by_customer(
        &self,
        tenant_id: TenantId,
        customer_id: CounterpartyId,
    ) -> Result<Option<BalanceAccount>, RepositoryError> {
        (**self).find_by_customer(tenant_id, customer_id)
    }

    fn insert(&self, account: &mut BalanceAccount) -> Result<(), RepositoryError> {
        (**self).insert(account)
    }

    fn save_with_version_check(&self, account: &mut BalanceAccount) -> Result<(), RepositoryError> {
        (**self).save_with_version_check(account)
    }
}

impl<S> RefundRepository for Arc<S>
where
    S: RefundRepository + ?Sized,
{
    fn find_by_external_refund_id(
        &self,
        channel: &ChannelId,
        external_refund_id: &str,
    ) -> Result<Option<RefundRecord>, RepositoryError> {
        (**self).find_by_external_refund_id(channel, external_refund_id)
    }

    fn insert(&self, record: &mut RefundRecord) -> Result<(), RepositoryError> {
        (**self).insert(record)
    }

    fn save_with_version_check(&self, record: &mut RefundRecord) -> Result<(), RepositoryError> {
        (**self).save_with_version_check(record)
    }
}

impl<S> DocumentNumberGenerator for Arc<S>
where
    S: DocumentNumberGenerator + ?Sized,
{
    fn generate_document_number(
        &self,
        tenant_id: TenantId,
        kind: DocumentKind,
    ) -> Result<String, RepositoryError> {
        (**self).generate_document_number(tenant_id, kind)
    }
}

impl<S> ReconciliationStore for Arc<S>
where
    S: ReconciliationStore + ?Sized,
{
    fn commit_reconciliation(
        &self,
        instrument: &mut SettlementInstrument,
        obligations: &mut [LedgerObligation],
    ) -> Result<(), RepositoryError> {
        (**self).commit_reconciliation(instrument, obligations)
    }
}
