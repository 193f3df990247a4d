use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tally_core::{
    Aggregate, AggregateId, AggregateRoot, CounterpartyId, Currency, DomainError, DomainResult,
    Money, TenantId, Versioned,
};
use tally_events::Event;

use crate::allocation::AllocationRecord;
use crate::document::DocumentKind;

const MAX_NUMBER_LEN: usize = 50;

/// Obligation identifier (tenant-scoped via `tenant_id` on the aggregate).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObligationId(pub AggregateId);

impl ObligationId {
    pub fn new() -> Self {
        Self(AggregateId::new())
    }
}

impl Default for ObligationId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ObligationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Direction of the obligation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObligationKind {
    /// Money a customer owes us.
    Receivable,
    /// Money we owe a supplier.
    Payable,
}

impl ObligationKind {
    pub fn document_kind(self) -> DocumentKind {
        match self {
            ObligationKind::Receivable => DocumentKind::Receivable,
            ObligationKind::Payable => DocumentKind::Payable,
        }
    }
}

/// Upstream document an obligation was derived from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    SalesOrder,
    SalesReturn,
    SalesCancellation,
    PurchaseOrder,
    PurchaseReturn,
    PurchaseCancellation,
    Manual,
}

impl SourceType {
    /// Red-letter sources post offsetting entries: positive magnitude, subtracted when netting.
    pub fn is_red_letter(self) -> bool {
        matches!(
            self,
            SourceType::SalesReturn
                | SourceType::SalesCancellation
                | SourceType::PurchaseReturn
                | SourceType::PurchaseCancellation
        )
    }

    /// Whether obligations of `kind` may originate from this source.
    pub fn accepts(self, kind: ObligationKind) -> bool {
        match self {
            SourceType::SalesOrder | SourceType::SalesReturn | SourceType::SalesCancellation => {
                kind == ObligationKind::Receivable
            }
            SourceType::PurchaseOrder
            | SourceType::PurchaseReturn
            | SourceType::PurchaseCancellation => kind == ObligationKind::Payable,
            SourceType::Manual => true,
        }
    }
}

/// Obligation status lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObligationStatus {
    Pending,
    Partial,
    Paid,
    Cancelled,
}

impl ObligationStatus {
    /// Status implied by the settled figures of an open obligation.
    pub fn from_amounts(paid: &Money, outstanding: &Money) -> Self {
        if outstanding.is_zero() {
            ObligationStatus::Paid
        } else if paid.is_zero() {
            ObligationStatus::Pending
        } else {
            ObligationStatus::Partial
        }
    }

    pub fn accepts_allocation(self) -> bool {
        matches!(self, ObligationStatus::Pending | ObligationStatus::Partial)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ObligationStatus::Paid | ObligationStatus::Cancelled)
    }
}

/// Aggregate root: a receivable or payable owed by/to one counterparty.
///
/// Invariants: `total = paid + outstanding` and `paid = Σ allocations.amount`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerObligation {
    id: ObligationId,
    tenant_id: TenantId,
    kind: ObligationKind,
    number: String,
    counterparty_id: CounterpartyId,
    counterparty_name: String,
    source_type: SourceType,
    source_id: Uuid,
    source_number: String,
    total: Money,
    paid: Money,
    outstanding: Money,
    status: ObligationStatus,
    due_date: Option<DateTime<Utc>>,
    allocations: Vec<AllocationRecord>,
    remark: Option<String>,
    created_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    opened: bool,
    version: u64,
    pending_events: Vec<ObligationEvent>,
}

/// Command: OpenObligation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenObligation {
    pub tenant_id: TenantId,
    pub obligation_id: ObligationId,
    pub kind: ObligationKind,
    pub number: String,
    pub counterparty_id: CounterpartyId,
    pub counterparty_name: String,
    pub source_type: SourceType,
    pub source_id: Uuid,
    pub source_number: String,
    pub total: Money,
    pub due_date: Option<DateTime<Utc>>,
    pub remark: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApplyObligationAllocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyObligationAllocation {
    pub tenant_id: TenantId,
    pub record: AllocationRecord,
}

/// Command: CancelObligation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelObligation {
    pub tenant_id: TenantId,
    pub obligation_id: ObligationId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObligationCommand {
    Open(OpenObligation),
    ApplyAllocation(ApplyObligationAllocation),
    Cancel(CancelObligation),
}

/// Event: ObligationOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObligationOpened {
    pub tenant_id: TenantId,
    pub obligation_id: ObligationId,
    pub kind: ObligationKind,
    pub number: String,
    pub counterparty_id: CounterpartyId,
    pub counterparty_name: String,
    pub source_type: SourceType,
    pub source_id: Uuid,
    pub source_number: String,
    pub total: Money,
    pub due_date: Option<DateTime<Utc>>,
    pub remark: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ObligationAllocationApplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObligationAllocationApplied {
    pub tenant_id: TenantId,
    pub obligation_id: ObligationId,
    pub record: AllocationRecord,
    pub paid: Money,
    pub outstanding: Money,
    pub status: ObligationStatus,
}

/// Event: ObligationCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObligationCancelled {
    pub tenant_id: TenantId,
    pub obligation_id: ObligationId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObligationEvent {
    Opened(ObligationOpened),
    AllocationApplied(ObligationAllocationApplied),
    Cancelled(ObligationCancelled),
}

impl Event for ObligationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ObligationEvent::Opened(_) => "ledger.obligation.opened",
            ObligationEvent::AllocationApplied(_) => "ledger.obligation.allocation_applied",
            ObligationEvent::Cancelled(_) => "ledger.obligation.cancelled",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ObligationEvent::Opened(e) => e.occurred_at,
            ObligationEvent::AllocationApplied(e) => e.record.applied_at,
            ObligationEvent::Cancelled(e) => e.occurred_at,
        }
    }

    fn tenant_id(&self) -> TenantId {
        match self {
            ObligationEvent::Opened(e) => e.tenant_id,
            ObligationEvent::AllocationApplied(e) => e.tenant_id,
            ObligationEvent::Cancelled(e) => e.tenant_id,
        }
    }

    fn aggregate_id(&self) -> AggregateId {
        match self {
            ObligationEvent::Opened(e) => e.obligation_id.0,
            ObligationEvent::AllocationApplied(e) => e.obligation_id.0,
            ObligationEvent::Cancelled(e) => e.obligation_id.0,
        }
    }

    fn aggregate_type(&self) -> &'static str {
        "ledger.obligation"
    }
}

impl LedgerObligation {
    /// Open a new obligation. The returned aggregate is unpersisted (version 0).
    pub fn open(cmd: OpenObligation) -> DomainResult<Self> {
        let currency = cmd.total.currency();
        let mut obligation = Self {
            id: cmd.obligation_id,
            tenant_id: cmd.tenant_id,
            kind: cmd.kind,
            number: String::new(),
            counterparty_id: cmd.counterparty_id,
            counterparty_name: String::new(),
            source_type: cmd.source_type,
            source_id: cmd.source_id,
            source_number: String::new(),
            total: Money::zero(currency),
            paid: Money::zero(currency),
            outstanding: Money::zero(currency),
            status: ObligationStatus::Pending,
            due_date: None,
            allocations: Vec::new(),
            remark: None,
            created_at: cmd.occurred_at,
            paid_at: None,
            cancelled_at: None,
            cancel_reason: None,
            opened: false,
            version: 0,
            pending_events: Vec::new(),
        };
        obligation.record(&ObligationCommand::Open(cmd))?;
        Ok(obligation)
    }

    /// Apply one allocation record produced by reconciliation.
    pub fn apply_allocation(&mut self, record: &AllocationRecord) -> DomainResult<()> {
        self.record(&ObligationCommand::ApplyAllocation(ApplyObligationAllocation {
            tenant_id: self.tenant_id,
            record: record.clone(),
        }))
    }

    /// Administrative cancel. Only allowed before anything has been applied.
    pub fn cancel(&mut self, reason: impl Into<String>, at: DateTime<Utc>) -> DomainResult<()> {
        self.record(&ObligationCommand::Cancel(CancelObligation {
            tenant_id: self.tenant_id,
            obligation_id: self.id,
            reason: reason.into(),
            occurred_at: at,
        }))
    }

    fn record(&mut self, cmd: &ObligationCommand) -> DomainResult<()> {
        let events = self.execute(cmd)?;
        self.pending_events.extend(events);
        Ok(())
    }

    /// Events recorded since the last call, oldest first.
    pub fn take_events(&mut self) -> Vec<ObligationEvent> {
        std::mem::take(&mut self.pending_events)
    }

    pub fn id_typed(&self) -> ObligationId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn kind(&self) -> ObligationKind {
        self.kind
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn counterparty_id(&self) -> CounterpartyId {
        self.counterparty_id
    }

    pub fn counterparty_name(&self) -> &str {
        &self.counterparty_name
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn source_id(&self) -> Uuid {
        self.source_id
    }

    pub fn source_number(&self) -> &str {
        &self.source_number
    }

    pub fn currency(&self) -> Currency {
        self.total.currency()
    }

    pub fn total(&self) -> Money {
        self.total
    }

    pub fn paid(&self) -> Money {
        self.paid
    }

    pub fn outstanding(&self) -> Money {
        self.outstanding
    }

    pub fn status(&self) -> ObligationStatus {
        self.status
    }

    pub fn due_date(&self) -> Option<DateTime<Utc>> {
        self.due_date
    }

    pub fn allocations(&self) -> &[AllocationRecord] {
        &self.allocations
    }

    pub fn remark(&self) -> Option<&str> {
        self.remark.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn paid_at(&self) -> Option<DateTime<Utc>> {
        self.paid_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn is_red_letter(&self) -> bool {
        self.source_type.is_red_letter()
    }

    /// Derived at read time; never a stored status.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status != ObligationStatus::Cancelled
            && self.outstanding.is_positive()
            && self.due_date.is_some_and(|due| due < now)
    }

    pub fn days_overdue(&self, now: DateTime<Utc>) -> i64 {
        match self.due_date {
            Some(due) if self.is_overdue(now) => (now - due).num_days(),
            _ => 0,
        }
    }

    /// Share of the total already settled, in percent (0–100).
    pub fn paid_percentage(&self) -> Decimal {
        if self.total.is_zero() {
            return Decimal::ZERO;
        }
        (self.paid.amount() * Decimal::ONE_HUNDRED / self.total.amount()).round_dp(2)
    }

    fn ensure_tenant(&self, tenant_id: TenantId) -> DomainResult<()> {
        if self.tenant_id != tenant_id {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn handle_open(&self, cmd: &OpenObligation) -> DomainResult<Vec<ObligationEvent>> {
        if self.opened {
            return Err(DomainError::invalid_state("obligation already opened"));
        }

        let number = cmd.number.trim();
        if number.is_empty() {
            return Err(DomainError::validation("obligation number cannot be empty"));
        }
        if number.chars().count() > MAX_NUMBER_LEN {
            return Err(DomainError::validation(format!(
                "obligation number cannot exceed {MAX_NUMBER_LEN} characters"
            )));
        }
        if cmd.counterparty_name.trim().is_empty() {
            return Err(DomainError::validation("counterparty name cannot be empty"));
        }
        if cmd.source_number.trim().is_empty() {
            return Err(DomainError::validation("source number cannot be empty"));
        }
        if !cmd.total.is_positive() {
            return Err(DomainError::validation("obligation total must be positive"));
        }
        if !cmd.source_type.accepts(cmd.kind) {
            return Err(DomainError::validation(format!(
                "source type {:?} cannot produce a {:?}",
                cmd.source_type, cmd.kind
            )));
        }

        Ok(vec![ObligationEvent::Opened(ObligationOpened {
            tenant_id: cmd.tenant_id,
            obligation_id: cmd.obligation_id,
            kind: cmd.kind,
            number: number.to_string(),
            counterparty_id: cmd.counterparty_id,
            counterparty_name: cmd.counterparty_name.trim().to_string(),
            source_type: cmd.source_type,
            source_id: cmd.source_id,
            source_number: cmd.source_number.trim().to_string(),
            total: cmd.total,
            due_date: cmd.due_date,
            remark: cmd.remark.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_apply_allocation(
        &self,
        cmd: &ApplyObligationAllocation,
    ) -> DomainResult<Vec<ObligationEvent>> {
        self.ensure_tenant(cmd.tenant_id)?;
        let record = &cmd.record;

        if record.obligation_id != self.id {
            return Err(DomainError::invariant("allocation targets another obligation"));
        }
        if !self.status.accepts_allocation() {
            return Err(DomainError::invalid_state(format!(
                "cannot apply allocation to {:?} obligation {}",
                self.status, self.number
            )));
        }
        if !record.amount.is_positive() {
            return Err(DomainError::validation("allocation amount must be positive"));
        }
        if record.amount.greater_than(&self.outstanding)? {
            return Err(DomainError::validation(format!(
                "allocation {} exceeds outstanding {} on {}",
                record.amount, self.outstanding, self.number
            )));
        }

        let paid = self.paid.checked_add(&record.amount)?;
        let outstanding = self.total.checked_sub(&paid)?;

        Ok(vec![ObligationEvent::AllocationApplied(ObligationAllocationApplied {
            tenant_id: cmd.tenant_id,
            obligation_id: self.id,
            record: record.clone(),
            paid,
            outstanding,
            status: ObligationStatus::from_amounts(&paid, &outstanding),
        })])
    }

    fn handle_cancel(&self, cmd: &CancelObligation) -> DomainResult<Vec<ObligationEvent>> {
        self.ensure_tenant(cmd.tenant_id)?;
        if cmd.obligation_id != self.id {
            return Err(DomainError::invariant("obligation_id mismatch"));
        }
        if self.status.is_terminal() {
            return Err(DomainError::invalid_state(format!(
                "cannot cancel {:?} obligation {}",
                self.status, self.number
            )));
        }
        if !self.paid.is_zero() {
            return Err(DomainError::invalid_state(
                "cannot cancel obligation with applied allocations",
            ));
        }
        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("cancel reason is required"));
        }

        Ok(vec![ObligationEvent::Cancelled(ObligationCancelled {
            tenant_id: cmd.tenant_id,
            obligation_id: self.id,
            reason: cmd.reason.trim().to_string(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

impl AggregateRoot for LedgerObligation {
    type Id = ObligationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Versioned for LedgerObligation {
    fn mark_persisted(&mut self, version: u64) {
        self.version = version;
    }
}

impl Aggregate for LedgerObligation {
    type Command = ObligationCommand;
    type Event = ObligationEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ObligationEvent::Opened(e) => {
                self.id = e.obligation_id;
                self.tenant_id = e.tenant_id;
                self.kind = e.kind;
                self.number = e.number.clone();
                self.counterparty_id = e.counterparty_id;
                self.counterparty_name = e.counterparty_name.clone();
                self.source_type = e.source_type;
                self.source_id = e.source_id;
                self.source_number = e.source_number.clone();
                self.total = e.total;
                self.paid = Money::zero(e.total.currency());
                self.outstanding = e.total;
                self.status = ObligationStatus::Pending;
                self.due_date = e.due_date;
                self.remark = e.remark.clone();
                self.created_at = e.occurred_at;
                self.opened = true;
            }
            ObligationEvent::AllocationApplied(e) => {
                self.allocations.push(e.record.clone());
                self.paid = e.paid;
                self.outstanding = e.outstanding;
                self.status = e.status;
                if e.status == ObligationStatus::Paid {
                    self.paid_at = Some(e.record.applied_at);
                }
            }
            ObligationEvent::Cancelled(e) => {
                self.status = ObligationStatus::Cancelled;
                self.outstanding = Money::zero(self.total.currency());
                self.cancelled_at = Some(e.occurred_at);
                self.cancel_reason = Some(e.reason.clone());
            }
        }
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ObligationCommand::Open(cmd) => self.handle_open(cmd),
            ObligationCommand::ApplyAllocation(cmd) => self.handle_apply_allocation(cmd),
            ObligationCommand::Cancel(cmd) => self.handle_cancel(cmd),
        }
    }
}

/// Net amount still open for `kind`: ordinary entries minus red-letter entries.
///
/// Cancelled obligations carry no outstanding amount and drop out naturally.
pub fn net_outstanding<'a, I>(kind: ObligationKind, currency: Currency, obligations: I) -> DomainResult<Money>
where
    I: IntoIterator<Item = &'a LedgerObligation>,
{
    obligations
        .into_iter()
        .filter(|o| o.kind == kind)
        .try_fold(Money::zero(currency), |net, o| {
            if o.is_red_letter() {
                net.checked_sub(&o.outstanding)
            } else {
                net.checked_add(&o.outstanding)
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::InstrumentId;
    use chrono::Duration;

    fn cny(minor: i64) -> Money {
        Money::from_minor(minor, Currency::Cny)
    }

    fn open_cmd(tenant_id: TenantId, total: Money) -> OpenObligation {
        OpenObligation {
            tenant_id,
            obligation_id: ObligationId::new(),
            kind: ObligationKind::Receivable,
            number: "AR-20260124-00001".to_string(),
            counterparty_id: CounterpartyId::new(),
            counterparty_name: "Acme Trading".to_string(),
            source_type: SourceType::SalesOrder,
            source_id: Uuid::now_v7(),
            source_number: "SO-20260120-00007".to_string(),
            total,
            due_date: Some(Utc::now() + Duration::days(30)),
            remark: None,
            occurred_at: Utc::now(),
        }
    }

    fn allocation(obligation: &LedgerObligation, amount: Money) -> AllocationRecord {
        AllocationRecord::new(
            InstrumentId::new(),
            obligation.id_typed(),
            amount,
            Utc::now(),
            "test allocation",
        )
    }

    #[test]
    fn open_emits_event_and_starts_pending() {
        let tenant_id = TenantId::new();
        let mut obligation = LedgerObligation::open(open_cmd(tenant_id, cny(20000))).unwrap();

        assert_eq!(obligation.status(), ObligationStatus::Pending);
        assert_eq!(obligation.outstanding(), cny(20000));
        assert_eq!(obligation.paid(), cny(0));
        assert_eq!(obligation.version(), 0);

        let events = obligation.take_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ObligationEvent::Opened(e) => {
                assert_eq!(e.tenant_id, tenant_id);
                assert_eq!(e.total, cny(20000));
            }
            _ => panic!("Expected Opened event"),
        }
        assert!(obligation.take_events().is_empty());
    }

    #[test]
    fn open_rejects_non_positive_total() {
        let err = LedgerObligation::open(open_cmd(TenantId::new(), cny(0))).unwrap_err();
        match err {
            DomainError::Validation(msg) if msg.contains("must be positive") => {}
            _ => panic!("Expected Validation for zero total"),
        }
    }

    #[test]
    fn open_rejects_source_of_the_other_direction() {
        let mut cmd = open_cmd(TenantId::new(), cny(100));
        cmd.source_type = SourceType::PurchaseOrder;
        assert!(matches!(
            LedgerObligation::open(cmd),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn open_rejects_overlong_number() {
        let mut cmd = open_cmd(TenantId::new(), cny(100));
        cmd.number = "X".repeat(51);
        assert!(matches!(
            LedgerObligation::open(cmd),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn partial_then_full_settlement() {
        let mut obligation = LedgerObligation::open(open_cmd(TenantId::new(), cny(15000))).unwrap();

        obligation.apply_allocation(&allocation(&obligation, cny(10000))).unwrap();
        assert_eq!(obligation.status(), ObligationStatus::Partial);
        assert_eq!(obligation.outstanding(), cny(5000));
        assert!(obligation.paid_at().is_none());

        obligation.apply_allocation(&allocation(&obligation, cny(5000))).unwrap();
        assert_eq!(obligation.status(), ObligationStatus::Paid);
        assert_eq!(obligation.outstanding(), cny(0));
        assert!(obligation.paid_at().is_some());
        assert_eq!(obligation.allocations().len(), 2);
        assert_eq!(obligation.paid_percentage(), Decimal::ONE_HUNDRED);
    }

    #[test]
    fn cannot_over_allocate() {
        let mut obligation = LedgerObligation::open(open_cmd(TenantId::new(), cny(1000))).unwrap();
        let err = obligation
            .apply_allocation(&allocation(&obligation, cny(1001)))
            .unwrap_err();
        match err {
            DomainError::Validation(msg) if msg.contains("exceeds outstanding") => {}
            _ => panic!("Expected Validation for over-allocation"),
        }
        assert_eq!(obligation.outstanding(), cny(1000));
        assert!(obligation.allocations().is_empty());
    }

    #[test]
    fn allocation_in_other_currency_is_rejected() {
        let mut obligation = LedgerObligation::open(open_cmd(TenantId::new(), cny(1000))).unwrap();
        let usd = Money::from_minor(100, Currency::Usd);
        assert!(matches!(
            obligation.apply_allocation(&allocation(&obligation, usd)),
            Err(DomainError::CurrencyMismatch { .. })
        ));
    }

    #[test]
    fn cancel_requires_reason_and_no_allocations() {
        let mut obligation = LedgerObligation::open(open_cmd(TenantId::new(), cny(1000))).unwrap();
        assert!(matches!(
            obligation.cancel("  ", Utc::now()),
            Err(DomainError::Validation(_))
        ));

        obligation.apply_allocation(&allocation(&obligation, cny(100))).unwrap();
        match obligation.cancel("customer dispute", Utc::now()).unwrap_err() {
            DomainError::InvalidState(msg) if msg.contains("applied allocations") => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn cancelled_obligation_rejects_allocations() {
        let mut obligation = LedgerObligation::open(open_cmd(TenantId::new(), cny(1000))).unwrap();
        obligation.cancel("duplicate entry", Utc::now()).unwrap();
        assert_eq!(obligation.status(), ObligationStatus::Cancelled);
        assert_eq!(obligation.outstanding(), cny(0));
        assert!(matches!(
            obligation.apply_allocation(&allocation(&obligation, cny(100))),
            Err(DomainError::InvalidState(_))
        ));
    }

    #[test]
    fn overdue_is_derived_from_due_date_and_outstanding() {
        let mut cmd = open_cmd(TenantId::new(), cny(1000));
        cmd.due_date = Some(Utc::now() - Duration::days(3));
        let mut obligation = LedgerObligation::open(cmd).unwrap();

        let now = Utc::now();
        assert!(obligation.is_overdue(now));
        assert_eq!(obligation.days_overdue(now), 3);

        obligation.apply_allocation(&allocation(&obligation, cny(1000))).unwrap();
        assert!(!obligation.is_overdue(now));
        assert_eq!(obligation.days_overdue(now), 0);
    }

    #[test]
    fn net_outstanding_subtracts_red_letter_entries() {
        let tenant_id = TenantId::new();
        let sale = LedgerObligation::open(open_cmd(tenant_id, cny(50000))).unwrap();
        let mut ret = open_cmd(tenant_id, cny(12000));
        ret.source_type = SourceType::SalesReturn;
        let ret = LedgerObligation::open(ret).unwrap();

        let net = net_outstanding(ObligationKind::Receivable, Currency::Cny, [&sale, &ret]).unwrap();
        assert_eq!(net, cny(38000));
        let payables = net_outstanding(ObligationKind::Payable, Currency::Cny, [&sale, &ret]).unwrap();
        assert_eq!(payables, cny(0));
    }
}
