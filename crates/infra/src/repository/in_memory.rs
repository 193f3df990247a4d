use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use tally_core::{AggregateRoot, CounterpartyId, ExpectedVersion, TenantId, Versioned};
use tally_ledger::{
    BalanceAccount, ChannelId, DocumentKind, InstrumentId, LedgerObligation, ObligationId,
    ObligationKind, RefundRecord, RefundRecordId, SettlementInstrument, SourceType,
};

use super::r#trait::{
    BalanceAccountRepository, DocumentNumberGenerator, InstrumentRepository, ObligationRepository,
    ReconciliationStore, RefundRepository, RepositoryError,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct SourceKey {
    tenant_id: TenantId,
    source_type: SourceType,
    source_id: Uuid,
}

impl SourceKey {
    fn of(obligation: &LedgerObligation) -> Self {
        Self {
            tenant_id: obligation.tenant_id(),
            source_type: obligation.source_type(),
            source_id: obligation.source_id(),
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    obligations: HashMap<ObligationId, LedgerObligation>,
    obligation_sources: HashMap<SourceKey, ObligationId>,
    instruments: HashMap<InstrumentId, SettlementInstrument>,
    instrument_references: HashMap<String, InstrumentId>,
    balances: HashMap<(TenantId, CounterpartyId), BalanceAccount>,
    refunds: HashMap<RefundRecordId, RefundRecord>,
    refund_references: HashMap<(ChannelId, String), RefundRecordId>,
    sequences: HashMap<(TenantId, DocumentKind, NaiveDate), u32>,
}

/// Aggregates the store can hold a row for.
trait Row: Versioned + Clone {
    const NAME: &'static str;

    fn tenant(&self) -> TenantId;

    /// Rows never carry unpublished events.
    fn clear_pending(&mut self);
}

impl Row for LedgerObligation {
    const NAME: &'static str = "obligation";

    fn tenant(&self) -> TenantId {
        self.tenant_id()
    }

    fn clear_pending(&mut self) {
        self.take_events();
    }
}

impl Row for SettlementInstrument {
    const NAME: &'static str = "instrument";

    fn tenant(&self) -> TenantId {
        self.tenant_id()
    }

    fn clear_pending(&mut self) {
        self.take_events();
    }
}

impl Row for BalanceAccount {
    const NAME: &'static str = "balance account";

    fn tenant(&self) -> TenantId {
        self.tenant_id()
    }

    fn clear_pending(&mut self) {
        self.take_events();
    }
}

impl Row for RefundRecord {
    const NAME: &'static str = "refund";

    fn tenant(&self) -> TenantId {
        self.tenant_id()
    }

    fn clear_pending(&mut self) {
        self.take_events();
    }
}

/// Conditional-update check: the incoming aggregate must have been loaded at the
/// stored revision (or be unpersisted against a missing row).
fn next_version<A>(incoming: &A, stored: Option<&A>) -> Result<u64, RepositoryError>
where
    A: Row,
    A::Id: core::fmt::Display,
{
    if let Some(stored) = stored {
        if stored.tenant() != incoming.tenant() {
            return Err(RepositoryError::TenantIsolation(format!(
                "{} {} belongs to another tenant",
                A::NAME,
                incoming.id()
            )));
        }
    }

    let expected = ExpectedVersion::of(incoming);
    let actual = stored.map(|s| s.version());
    if expected.matches(actual) {
        Ok(expected.next())
    } else {
        Err(RepositoryError::StaleVersion {
            aggregate: A::NAME,
            id: incoming.id().to_string(),
            expected: incoming.version(),
            actual: actual.unwrap_or(0),
        })
    }
}

/// Stamp `version` on the caller's aggregate and return the row to store.
fn persist<A: Row>(aggregate: &mut A, version: u64) -> A {
    aggregate.mark_persisted(version);
    let mut row = aggregate.clone();
    row.clear_pending();
    row
}

fn scoped<A: Row>(row: Option<&A>, tenant_id: TenantId) -> Option<A> {
    row.filter(|r| r.tenant() == tenant_id).cloned()
}

/// In-memory ledger storage.
///
/// One `RwLock` guards every table, so multi-aggregate commits are atomic and
/// readers always see a consistent snapshot. Intended for tests and dev.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    tables: RwLock<Tables>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, RepositoryError> {
        self.tables
            .read()
            .map_err(|_| RepositoryError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, RepositoryError> {
        self.tables
            .write()
            .map_err(|_| RepositoryError::Storage("lock poisoned".to_string()))
    }

    /// Number for the next `kind` document issued by `tenant_id` on `date`.
    pub fn next_document_number(
        &self,
        tenant_id: TenantId,
        kind: DocumentKind,
        date: NaiveDate,
    ) -> Result<String, RepositoryError> {
        let mut tables = self.write()?;
        let sequence = tables.sequences.entry((tenant_id, kind, date)).or_insert(0);
        *sequence += 1;
        Ok(kind.format_number(date, *sequence))
    }
}

fn check_reference(tables: &Tables, instrument: &SettlementInstrument) -> Result<(), RepositoryError> {
    let Some(reference) = instrument.payment_reference() else {
        return Ok(());
    };
    match tables.instrument_references.get(reference) {
        Some(owner) if *owner != instrument.id_typed() => Err(RepositoryError::Duplicate(format!(
            "payment reference {reference}"
        ))),
        _ => Ok(()),
    }
}

fn store_instrument(tables: &mut Tables, row: SettlementInstrument) {
    let id = row.id_typed();
    let previous = tables
        .instruments
        .get(&id)
        .and_then(|i| i.payment_reference().map(str::to_owned));
    if let Some(previous) = previous {
        if Some(previous.as_str()) != row.payment_reference() {
            tables.instrument_references.remove(&previous);
        }
    }
    if let Some(reference) = row.payment_reference() {
        tables.instrument_references.insert(reference.to_owned(), id);
    }
    tables.instruments.insert(id, row);
}

impl ObligationRepository for InMemoryLedgerStore {
    fn find_by_id(
        &self,
        tenant_id: TenantId,
        id: ObligationId,
    ) -> Result<Option<LedgerObligation>, RepositoryError> {
        let tables = self.read()?;
        Ok(scoped(tables.obligations.get(&id), tenant_id))
    }

    fn find_outstanding(
        &self,
        tenant_id: TenantId,
        counterparty_id: CounterpartyId,
        kind: ObligationKind,
    ) -> Result<Vec<LedgerObligation>, RepositoryError> {
        let tables = self.read()?;
        let mut found: Vec<LedgerObligation> = tables
            .obligations
            .values()
            .filter(|o| {
                o.tenant_id() == tenant_id
                    && o.counterparty_id() == counterparty_id
                    && o.kind() == kind
                    && !o.status().is_terminal()
                    && o.outstanding().is_positive()
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.number().cmp(b.number()))
        });
        Ok(found)
    }

    fn exists_by_source(
        &self,
        tenant_id: TenantId,
        source_type: SourceType,
        source_id: Uuid,
    ) -> Result<bool, RepositoryError> {
        let tables = self.read()?;
        Ok(tables.obligation_sources.contains_key(&SourceKey {
            tenant_id,
            source_type,
            source_id,
        }))
    }

    fn insert(&self, obligation: &mut LedgerObligation) -> Result<(), RepositoryError> {
        let mut tables = self.write()?;
        let id = obligation.id_typed();
        let key = SourceKey::of(obligation);

        if tables.obligation_sources.contains_key(&key) {
            return Err(RepositoryError::DuplicateSource {
                source_type: key.source_type,
                source_id: key.source_id,
            });
        }
        if tables.obligations.contains_key(&id) {
            return Err(RepositoryError::Duplicate(format!("obligation {id}")));
        }
        let version = next_version(obligation, None)?;

        let row = persist(obligation, version);
        tables.obligation_sources.insert(key, id);
        tables.obligations.insert(id, row);
        Ok(())
    }

    fn save_with_version_check(&self, obligation: &mut LedgerObligation) -> Result<(), RepositoryError> {
        let mut tables = self.write()?;
        let id = obligation.id_typed();
        let stored = tables
            .obligations
            .get(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("obligation {id}")))?;
        let version = next_version(obligation, Some(stored))?;

        let row = persist(obligation, version);
        tables.obligations.insert(id, row);
        Ok(())
    }
}

impl InstrumentRepository for InMemoryLedgerStore {
    fn find_by_id(
        &self,
        tenant_id: TenantId,
        id: InstrumentId,
    ) -> Result<Option<SettlementInstrument>, RepositoryError> {
        let tables = self.read()?;
        Ok(scoped(tables.instruments.get(&id), tenant_id))
    }

    fn find_by_external_reference(
        &self,
        reference: &str,
    ) -> Result<Option<SettlementInstrument>, RepositoryError> {
        let tables = self.read()?;
        Ok(tables
            .instrument_references
            .get(reference)
            .and_then(|id| tables.instruments.get(id))
            .cloned())
    }

    fn insert(&self, instrument: &mut SettlementInstrument) -> Result<(), RepositoryError> {
        let mut tables = self.write()?;
        let id = instrument.id_typed();
        if tables.instruments.contains_key(&id) {
            return Err(RepositoryError::Duplicate(format!("instrument {id}")));
        }
        check_reference(&tables, instrument)?;
        let version = next_version(instrument, None)?;

        let row = persist(instrument, version);
        store_instrument(&mut tables, row);
        Ok(())
    }

    fn save_with_version_check(
        &self,
        instrument: &mut SettlementInstrument,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.write()?;
        let id = instrument.id_typed();
        let stored = tables
            .instruments
            .get(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("instrument {id}")))?;
        let version = next_version(instrument, Some(stored))?;
        check_reference(&tables, instrument)?;

        let row = persist(instrument, version);
        store_instrument(&mut tables, row);
        Ok(())
    }
}

impl BalanceAccountRepository for InMemoryLedgerStore {
    fn find_by_customer(
        &self,
        tenant_id: TenantId,
        customer_id: CounterpartyId,
    ) -> Result<Option<BalanceAccount>, RepositoryError> {
        let tables = self.read()?;
        Ok(tables.balances.get(&(tenant_id, customer_id)).cloned())
    }

    fn insert(&self, account: &mut BalanceAccount) -> Result<(), RepositoryError> {
        let mut tables = self.write()?;
        let key = (account.tenant_id(), account.customer_id());
        if tables.balances.contains_key(&key) {
            return Err(RepositoryError::Duplicate(format!(
                "balance account for customer {}",
                account.customer_id()
            )));
        }
        let version = next_version(account, None)?;

        let row = persist(account, version);
        tables.balances.insert(key, row);
        Ok(())
    }

    fn save_with_version_check(&self, account: &mut BalanceAccount) -> Result<(), RepositoryError> {
        let mut tables = self.write()?;
        let key = (account.tenant_id(), account.customer_id());
        let stored = tables
            .balances
            .get(&key)
            .filter(|a| a.id_typed() == account.id_typed())
            .ok_or_else(|| RepositoryError::NotFound(format!("balance account {}", account.id_typed())))?;
        let version = next_version(account, Some(stored))?;

        let row = persist(account, version);
        tables.balances.insert(key, row);
        Ok(())
    }
}

fn refund_key(record: &RefundRecord) -> (ChannelId, String) {
    (record.channel().clone(), record.external_refund_id().to_owned())
}

impl RefundRepository for InMemoryLedgerStore {
    fn find_by_external_refund_id(
        &self,
        channel: &ChannelId,
        external_refund_id: &str,
    ) -> Result<Option<RefundRecord>, RepositoryError> {
        let tables = self.read()?;
        Ok(tables
            .refund_references
            .get(&(channel.clone(), external_refund_id.to_owned()))
            .and_then(|id| tables.refunds.get(id))
            .cloned())
    }

    fn insert(&self, record: &mut RefundRecord) -> Result<(), RepositoryError> {
        let mut tables = self.write()?;
        let id = record.id_typed();
        let key = refund_key(record);
        if tables.refunds.contains_key(&id) || tables.refund_references.contains_key(&key) {
            return Err(RepositoryError::Duplicate(format!("refund {} on {}", key.1, key.0)));
        }
        let version = next_version(record, None)?;

        let row = persist(record, version);
        tables.refund_references.insert(key, id);
        tables.refunds.insert(id, row);
        Ok(())
    }

    fn save_with_version_check(&self, record: &mut RefundRecord) -> Result<(), RepositoryError> {
        let mut tables = self.write()?;
        let id = record.id_typed();
        let stored = tables
            .refunds
            .get(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("refund {id}")))?;
        let version = next_version(record, Some(stored))?;

        let row = persist(record, version);
        tables.refunds.insert(id, row);
        Ok(())
    }
}

impl DocumentNumberGenerator for InMemoryLedgerStore {
    fn generate_document_number(
        &self,
        tenant_id: TenantId,
        kind: DocumentKind,
    ) -> Result<String, RepositoryError> {
        self.next_document_number(tenant_id, kind, Utc::now().date_naive())
    }
}

impl ReconciliationStore for InMemoryLedgerStore {
    fn commit_reconciliation(
        &self,
        instrument: &mut SettlementInstrument,
        obligations: &mut [LedgerObligation],
    ) -> Result<(), RepositoryError> {
        let mut tables = self.write()?;

        // Check everything before writing anything.
        let instrument_id = instrument.id_typed();
        let stored = tables
            .instruments
            .get(&instrument_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("instrument {instrument_id}")))?;
        let instrument_version = next_version(instrument, Some(stored))?;

        let mut obligation_versions = Vec::with_capacity(obligations.len());
        for obligation in obligations.iter() {
            if obligation.tenant_id() != instrument.tenant_id() {
                return Err(RepositoryError::TenantIsolation(format!(
                    "obligation {} and instrument {} belong to different tenants",
                    obligation.number(),
                    instrument.number()
                )));
            }
            let id = obligation.id_typed();
            let stored = tables
                .obligations
                .get(&id)
                .ok_or_else(|| RepositoryError::NotFound(format!("obligation {id}")))?;
            obligation_versions.push(next_version(obligation, Some(stored))?);
        }

        for (obligation, version) in obligations.iter_mut().zip(obligation_versions) {
            let row = persist(obligation, version);
            tables.obligations.insert(row.id_typed(), row);
        }
        let row = persist(instrument, instrument_version);
        store_instrument(&mut tables, row);
        Ok(())
    }
}
