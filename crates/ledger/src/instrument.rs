use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{
    Aggregate, AggregateId, AggregateRoot, CounterpartyId, Currency, DomainError, DomainResult,
    Money, TenantId, UserId, Versioned,
};
use tally_events::Event;

use crate::allocation::AllocationRecord;
use crate::document::DocumentKind;
use crate::obligation::ObligationKind;

const MAX_NUMBER_LEN: usize = 50;
const MAX_REFERENCE_LEN: usize = 100;

/// Settlement instrument identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentId(pub AggregateId);

impl InstrumentId {
    pub fn new() -> Self {
        Self(AggregateId::new())
    }
}

impl Default for InstrumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    /// Funds received from a customer (receipt voucher).
    Receipt,
    /// Funds paid to a supplier (payment voucher).
    Payment,
}

impl InstrumentKind {
    /// Obligation kind this instrument settles.
    pub fn settles(self) -> ObligationKind {
        match self {
            InstrumentKind::Receipt => ObligationKind::Receivable,
            InstrumentKind::Payment => ObligationKind::Payable,
        }
    }

    pub fn document_kind(self) -> DocumentKind {
        match self {
            InstrumentKind::Receipt => DocumentKind::ReceiptVoucher,
            InstrumentKind::Payment => DocumentKind::PaymentVoucher,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    BankTransfer,
    Wechat,
    Alipay,
    Check,
    Balance,
    Other,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentStatus {
    Draft,
    Confirmed,
    Cancelled,
}

/// Aggregate root: a receipt or payment voucher applied against obligations.
///
/// Invariant: `amount = allocated + unallocated`; allocations exist only once confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementInstrument {
    id: InstrumentId,
    tenant_id: TenantId,
    kind: InstrumentKind,
    number: String,
    counterparty_id: CounterpartyId,
    counterparty_name: String,
    amount: Money,
    allocated: Money,
    unallocated: Money,
    payment_method: PaymentMethod,
    payment_reference: Option<String>,
    external_transaction_id: Option<String>,
    status: InstrumentStatus,
    allocations: Vec<AllocationRecord>,
    created_at: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
    confirmed_by: Option<UserId>,
    cancelled_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    registered: bool,
    version: u64,
    pending_events: Vec<InstrumentEvent>,
}

/// Command: RegisterInstrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterInstrument {
    pub tenant_id: TenantId,
    pub instrument_id: InstrumentId,
    pub kind: InstrumentKind,
    pub number: String,
    pub counterparty_id: CounterpartyId,
    pub counterparty_name: String,
    pub amount: Money,
    pub payment_method: PaymentMethod,
    /// External order reference a payment channel will echo back in its callback.
    pub payment_reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmInstrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmInstrument {
    pub tenant_id: TenantId,
    pub confirmed_by: Option<UserId>,
    pub external_transaction_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetPaymentReference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPaymentReference {
    pub tenant_id: TenantId,
    pub reference: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApplyInstrumentAllocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyInstrumentAllocation {
    pub tenant_id: TenantId,
    pub record: AllocationRecord,
}

/// Command: CancelInstrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelInstrument {
    pub tenant_id: TenantId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentCommand {
    Register(RegisterInstrument),
    Confirm(ConfirmInstrument),
    SetPaymentReference(SetPaymentReference),
    ApplyAllocation(ApplyInstrumentAllocation),
    Cancel(CancelInstrument),
}

/// Event: InstrumentRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentRegistered {
    pub tenant_id: TenantId,
    pub instrument_id: InstrumentId,
    pub kind: InstrumentKind,
    pub number: String,
    pub counterparty_id: CounterpartyId,
    pub counterparty_name: String,
    pub amount: Money,
    pub payment_method: PaymentMethod,
    pub payment_reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InstrumentConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentConfirmed {
    pub tenant_id: TenantId,
    pub instrument_id: InstrumentId,
    pub amount: Money,
    pub confirmed_by: Option<UserId>,
    pub external_transaction_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentReferenceSet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReferenceSet {
    pub tenant_id: TenantId,
    pub instrument_id: InstrumentId,
    pub reference: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InstrumentAllocationApplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentAllocationApplied {
    pub tenant_id: TenantId,
    pub instrument_id: InstrumentId,
    pub record: AllocationRecord,
    pub allocated: Money,
    pub unallocated: Money,
}

/// Event: InstrumentCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentCancelled {
    pub tenant_id: TenantId,
    pub instrument_id: InstrumentId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentEvent {
    Registered(InstrumentRegistered),
    Confirmed(InstrumentConfirmed),
    PaymentReferenceSet(PaymentReferenceSet),
    AllocationApplied(InstrumentAllocationApplied),
    Cancelled(InstrumentCancelled),
}

impl Event for InstrumentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InstrumentEvent::Registered(_) => "ledger.instrument.registered",
            InstrumentEvent::Confirmed(_) => "ledger.instrument.confirmed",
            InstrumentEvent::PaymentReferenceSet(_) => "ledger.instrument.payment_reference_set",
            InstrumentEvent::AllocationApplied(_) => "ledger.instrument.allocation_applied",
            InstrumentEvent::Cancelled(_) => "ledger.instrument.cancelled",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InstrumentEvent::Registered(e) => e.occurred_at,
            InstrumentEvent::Confirmed(e) => e.occurred_at,
            InstrumentEvent::PaymentReferenceSet(e) => e.occurred_at,
            InstrumentEvent::AllocationApplied(e) => e.record.applied_at,
            InstrumentEvent::Cancelled(e) => e.occurred_at,
        }
    }

    fn tenant_id(&self) -> TenantId {
        match self {
            InstrumentEvent::Registered(e) => e.tenant_id,
            InstrumentEvent::Confirmed(e) => e.tenant_id,
            InstrumentEvent::PaymentReferenceSet(e) => e.tenant_id,
            InstrumentEvent::AllocationApplied(e) => e.tenant_id,
            InstrumentEvent::Cancelled(e) => e.tenant_id,
        }
    }

    fn aggregate_id(&self) -> AggregateId {
        match self {
            InstrumentEvent::Registered(e) => e.instrument_id.0,
            InstrumentEvent::Confirmed(e) => e.instrument_id.0,
            InstrumentEvent::PaymentReferenceSet(e) => e.instrument_id.0,
            InstrumentEvent::AllocationApplied(e) => e.instrument_id.0,
            InstrumentEvent::Cancelled(e) => e.instrument_id.0,
        }
    }

    fn aggregate_type(&self) -> &'static str {
        "ledger.instrument"
    }
}

impl SettlementInstrument {
    /// Register a new instrument in `Draft`. The returned aggregate is unpersisted.
    pub fn register(cmd: RegisterInstrument) -> DomainResult<Self> {
        let currency = cmd.amount.currency();
        let mut instrument = Self {
            id: cmd.instrument_id,
            tenant_id: cmd.tenant_id,
            kind: cmd.kind,
            number: String::new(),
            counterparty_id: cmd.counterparty_id,
            counterparty_name: String::new(),
            amount: Money::zero(currency),
            allocated: Money::zero(currency),
            unallocated: Money::zero(currency),
            payment_method: cmd.payment_method,
            payment_reference: None,
            external_transaction_id: None,
            status: InstrumentStatus::Draft,
            allocations: Vec::new(),
            created_at: cmd.occurred_at,
            confirmed_at: None,
            confirmed_by: None,
            cancelled_at: None,
            cancel_reason: None,
            registered: false,
            version: 0,
            pending_events: Vec::new(),
        };
        instrument.record(&InstrumentCommand::Register(cmd))?;
        Ok(instrument)
    }

    pub fn confirm(
        &mut self,
        confirmed_by: Option<UserId>,
        external_transaction_id: Option<String>,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.record(&InstrumentCommand::Confirm(ConfirmInstrument {
            tenant_id: self.tenant_id,
            confirmed_by,
            external_transaction_id,
            occurred_at: at,
        }))
    }

    pub fn set_payment_reference(
        &mut self,
        reference: impl Into<String>,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.record(&InstrumentCommand::SetPaymentReference(SetPaymentReference {
            tenant_id: self.tenant_id,
            reference: reference.into(),
            occurred_at: at,
        }))
    }

    pub fn apply_allocation(&mut self, record: &AllocationRecord) -> DomainResult<()> {
        self.record(&InstrumentCommand::ApplyAllocation(ApplyInstrumentAllocation {
            tenant_id: self.tenant_id,
            record: record.clone(),
        }))
    }

    pub fn cancel(&mut self, reason: impl Into<String>, at: DateTime<Utc>) -> DomainResult<()> {
        self.record(&InstrumentCommand::Cancel(CancelInstrument {
            tenant_id: self.tenant_id,
            reason: reason.into(),
            occurred_at: at,
        }))
    }

    fn record(&mut self, cmd: &InstrumentCommand) -> DomainResult<()> {
        let events = self.execute(cmd)?;
        self.pending_events.extend(events);
        Ok(())
    }

    /// Events recorded since the last call, oldest first.
    pub fn take_events(&mut self) -> Vec<InstrumentEvent> {
        std::mem::take(&mut self.pending_events)
    }

    pub fn id_typed(&self) -> InstrumentId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn kind(&self) -> InstrumentKind {
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

    pub fn currency(&self) -> Currency {
        self.amount.currency()
    }

    pub fn amount(&self) -> Money {
        self.amount
    }

    pub fn allocated(&self) -> Money {
        self.allocated
    }

    pub fn unallocated(&self) -> Money {
        self.unallocated
    }

    pub fn payment_method(&self) -> PaymentMethod {
        self.payment_method
    }

    pub fn payment_reference(&self) -> Option<&str> {
        self.payment_reference.as_deref()
    }

    pub fn external_transaction_id(&self) -> Option<&str> {
        self.external_transaction_id.as_deref()
    }

    pub fn status(&self) -> InstrumentStatus {
        self.status
    }

    pub fn allocations(&self) -> &[AllocationRecord] {
        &self.allocations
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn confirmed_at(&self) -> Option<DateTime<Utc>> {
        self.confirmed_at
    }

    pub fn confirmed_by(&self) -> Option<UserId> {
        self.confirmed_by
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == InstrumentStatus::Confirmed
    }

    pub fn is_fully_allocated(&self) -> bool {
        self.unallocated.is_zero()
    }

    /// Confirmed with money left to apply.
    pub fn can_allocate(&self) -> bool {
        self.is_confirmed() && self.unallocated.is_positive()
    }

    fn ensure_tenant(&self, tenant_id: TenantId) -> DomainResult<()> {
        if self.tenant_id != tenant_id {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn handle_register(&self, cmd: &RegisterInstrument) -> DomainResult<Vec<InstrumentEvent>> {
        if self.registered {
            return Err(DomainError::invalid_state("instrument already registered"));
        }

        let number = cmd.number.trim();
        if number.is_empty() {
            return Err(DomainError::validation("instrument number cannot be empty"));
        }
        if number.chars().count() > MAX_NUMBER_LEN {
            return Err(DomainError::validation(format!(
                "instrument number cannot exceed {MAX_NUMBER_LEN} characters"
            )));
        }
        if cmd.counterparty_name.trim().is_empty() {
            return Err(DomainError::validation("counterparty name cannot be empty"));
        }
        if !cmd.amount.is_positive() {
            return Err(DomainError::validation("instrument amount must be positive"));
        }
        let payment_reference = match cmd.payment_reference.as_deref().map(str::trim) {
            Some(reference) if !reference.is_empty() => {
                validate_reference(reference)?;
                Some(reference.to_string())
            }
            _ => None,
        };

        Ok(vec![InstrumentEvent::Registered(InstrumentRegistered {
            tenant_id: cmd.tenant_id,
            instrument_id: cmd.instrument_id,
            kind: cmd.kind,
            number: number.to_string(),
            counterparty_id: cmd.counterparty_id,
            counterparty_name: cmd.counterparty_name.trim().to_string(),
            amount: cmd.amount,
            payment_method: cmd.payment_method,
            payment_reference,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm(&self, cmd: &ConfirmInstrument) -> DomainResult<Vec<InstrumentEvent>> {
        self.ensure_tenant(cmd.tenant_id)?;
        if self.status != InstrumentStatus::Draft {
            return Err(DomainError::invalid_state(format!(
                "only draft instruments can be confirmed ({} is {:?})",
                self.number, self.status
            )));
        }

        Ok(vec![InstrumentEvent::Confirmed(InstrumentConfirmed {
            tenant_id: cmd.tenant_id,
            instrument_id: self.id,
            amount: self.amount,
            confirmed_by: cmd.confirmed_by,
            external_transaction_id: cmd.external_transaction_id.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_reference(
        &self,
        cmd: &SetPaymentReference,
    ) -> DomainResult<Vec<InstrumentEvent>> {
        self.ensure_tenant(cmd.tenant_id)?;
        if self.status == InstrumentStatus::Cancelled {
            return Err(DomainError::invalid_state(
                "cannot set payment reference on a cancelled instrument",
            ));
        }
        let reference = cmd.reference.trim();
        if reference.is_empty() {
            return Err(DomainError::validation("payment reference cannot be empty"));
        }
        validate_reference(reference)?;

        Ok(vec![InstrumentEvent::PaymentReferenceSet(PaymentReferenceSet {
            tenant_id: cmd.tenant_id,
            instrument_id: self.id,
            reference: reference.to_string(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_apply_allocation(
        &self,
        cmd: &ApplyInstrumentAllocation,
    ) -> DomainResult<Vec<InstrumentEvent>> {
        self.ensure_tenant(cmd.tenant_id)?;
        let record = &cmd.record;

        if record.instrument_id != self.id {
            return Err(DomainError::invariant("allocation belongs to another instrument"));
        }
        if self.status != InstrumentStatus::Confirmed {
            return Err(DomainError::invalid_state(format!(
                "allocations require a confirmed instrument ({} is {:?})",
                self.number, self.status
            )));
        }
        if !record.amount.is_positive() {
            return Err(DomainError::validation("allocation amount must be positive"));
        }
        if record.amount.greater_than(&self.unallocated)? {
            return Err(DomainError::validation(format!(
                "allocation {} exceeds unallocated {} on {}",
                record.amount, self.unallocated, self.number
            )));
        }

        let allocated = self.allocated.checked_add(&record.amount)?;
        let unallocated = self.amount.checked_sub(&allocated)?;

        Ok(vec![InstrumentEvent::AllocationApplied(InstrumentAllocationApplied {
            tenant_id: cmd.tenant_id,
            instrument_id: self.id,
            record: record.clone(),
            allocated,
            unallocated,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelInstrument) -> DomainResult<Vec<InstrumentEvent>> {
        self.ensure_tenant(cmd.tenant_id)?;
        if self.status == InstrumentStatus::Cancelled {
            return Err(DomainError::invalid_state("instrument is already cancelled"));
        }
        if !self.allocated.is_zero() {
            return Err(DomainError::invalid_state(
                "cannot cancel instrument with applied allocations",
            ));
        }
        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("cancel reason is required"));
        }

        Ok(vec![InstrumentEvent::Cancelled(InstrumentCancelled {
            tenant_id: cmd.tenant_id,
            instrument_id: self.id,
            reason: cmd.reason.trim().to_string(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

fn validate_reference(reference: &str) -> DomainResult<()> {
    if reference.chars().count() > MAX_REFERENCE_LEN {
        return Err(DomainError::validation(format!(
            "payment reference cannot exceed {MAX_REFERENCE_LEN} characters"
        )));
    }
    Ok(())
}

impl AggregateRoot for SettlementInstrument {
    type Id = InstrumentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Versioned for SettlementInstrument {
    fn mark_persisted(&mut self, version: u64) {
        self.version = version;
    }
}

impl Aggregate for SettlementInstrument {
    type Command = InstrumentCommand;
    type Event = InstrumentEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InstrumentEvent::Registered(e) => {
                self.id = e.instrument_id;
                self.tenant_id = e.tenant_id;
                self.kind = e.kind;
                self.number = e.number.clone();
                self.counterparty_id = e.counterparty_id;
                self.counterparty_name = e.counterparty_name.clone();
                self.amount = e.amount;
                self.allocated = Money::zero(e.amount.currency());
                self.unallocated = e.amount;
                self.payment_method = e.payment_method;
                self.payment_reference = e.payment_reference.clone();
                self.status = InstrumentStatus::Draft;
                self.created_at = e.occurred_at;
                self.registered = true;
            }
            InstrumentEvent::Confirmed(e) => {
                self.status = InstrumentStatus::Confirmed;
                self.confirmed_at = Some(e.occurred_at);
                self.confirmed_by = e.confirmed_by;
                if e.external_transaction_id.is_some() {
                    self.external_transaction_id = e.external_transaction_id.clone();
                }
            }
            InstrumentEvent::PaymentReferenceSet(e) => {
                self.payment_reference = Some(e.reference.clone());
            }
            InstrumentEvent::AllocationApplied(e) => {
                self.allocations.push(e.record.clone());
                self.allocated = e.allocated;
                self.unallocated = e.unallocated;
            }
            InstrumentEvent::Cancelled(e) => {
                self.status = InstrumentStatus::Cancelled;
                self.cancelled_at = Some(e.occurred_at);
                self.cancel_reason = Some(e.reason.clone());
            }
        }
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InstrumentCommand::Register(cmd) => self.handle_register(cmd),
            InstrumentCommand::Confirm(cmd) => self.handle_confirm(cmd),
            InstrumentCommand::SetPaymentReference(cmd) => self.handle_set_reference(cmd),
            InstrumentCommand::ApplyAllocation(cmd) => self.handle_apply_allocation(cmd),
            InstrumentCommand::Cancel(cmd) => self.handle_cancel(cmd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obligation::ObligationId;

    fn cny(minor: i64) -> Money {
        Money::from_minor(minor, Currency::Cny)
    }

    fn register_cmd(amount: Money) -> RegisterInstrument {
        RegisterInstrument {
            tenant_id: TenantId::new(),
            instrument_id: InstrumentId::new(),
            kind: InstrumentKind::Receipt,
            number: "RV-20260124-00001".to_string(),
            counterparty_id: CounterpartyId::new(),
            counterparty_name: "Acme Trading".to_string(),
            amount,
            payment_method: PaymentMethod::BankTransfer,
            payment_reference: Some("ORDER-778".to_string()),
            occurred_at: Utc::now(),
        }
    }

    fn record_for(instrument: &SettlementInstrument, amount: Money) -> AllocationRecord {
        AllocationRecord::new(
            instrument.id_typed(),
            ObligationId::new(),
            amount,
            Utc::now(),
            "test allocation",
        )
    }

    #[test]
    fn registers_as_draft_with_everything_unallocated() {
        let mut instrument = SettlementInstrument::register(register_cmd(cny(30000))).unwrap();
        assert_eq!(instrument.status(), InstrumentStatus::Draft);
        assert_eq!(instrument.unallocated(), cny(30000));
        assert_eq!(instrument.allocated(), cny(0));
        assert_eq!(instrument.payment_reference(), Some("ORDER-778"));
        assert_eq!(instrument.take_events().len(), 1);
    }

    #[test]
    fn draft_instrument_cannot_take_allocations() {
        let mut instrument = SettlementInstrument::register(register_cmd(cny(30000))).unwrap();
        let err = instrument
            .apply_allocation(&record_for(&instrument, cny(100)))
            .unwrap_err();
        match err {
            DomainError::InvalidState(msg) if msg.contains("confirmed instrument") => {}
            _ => panic!("Expected InvalidState for draft allocation"),
        }
    }

    #[test]
    fn confirm_only_from_draft() {
        let mut instrument = SettlementInstrument::register(register_cmd(cny(30000))).unwrap();
        instrument
            .confirm(Some(UserId::new()), Some("TX-1".to_string()), Utc::now())
            .unwrap();
        assert!(instrument.is_confirmed());
        assert_eq!(instrument.external_transaction_id(), Some("TX-1"));
        assert!(matches!(
            instrument.confirm(None, None, Utc::now()),
            Err(DomainError::InvalidState(_))
        ));
    }

    #[test]
    fn allocation_keeps_amount_invariant() {
        let mut instrument = SettlementInstrument::register(register_cmd(cny(30000))).unwrap();
        instrument.confirm(None, None, Utc::now()).unwrap();

        instrument.apply_allocation(&record_for(&instrument, cny(20000))).unwrap();
        assert_eq!(instrument.allocated(), cny(20000));
        assert_eq!(instrument.unallocated(), cny(10000));
        assert!(!instrument.is_fully_allocated());

        let err = instrument
            .apply_allocation(&record_for(&instrument, cny(10001)))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("exceeds unallocated")));

        instrument.apply_allocation(&record_for(&instrument, cny(10000))).unwrap();
        assert!(instrument.is_fully_allocated());
        assert!(!instrument.can_allocate());
        assert_eq!(
            instrument.allocated().checked_add(&instrument.unallocated()).unwrap(),
            instrument.amount()
        );
    }

    #[test]
    fn cancel_only_while_nothing_allocated() {
        let mut instrument = SettlementInstrument::register(register_cmd(cny(30000))).unwrap();
        instrument.confirm(None, None, Utc::now()).unwrap();
        instrument.apply_allocation(&record_for(&instrument, cny(100))).unwrap();
        assert!(matches!(
            instrument.cancel("entered twice", Utc::now()),
            Err(DomainError::InvalidState(_))
        ));

        let mut fresh = SettlementInstrument::register(register_cmd(cny(500))).unwrap();
        fresh.cancel("entered twice", Utc::now()).unwrap();
        assert_eq!(fresh.status(), InstrumentStatus::Cancelled);
        assert!(matches!(
            fresh.set_payment_reference("ORDER-9", Utc::now()),
            Err(DomainError::InvalidState(_))
        ));
    }

    #[test]
    fn payment_reference_length_is_bounded() {
        let mut cmd = register_cmd(cny(100));
        cmd.payment_reference = Some("R".repeat(101));
        assert!(matches!(
            SettlementInstrument::register(cmd),
            Err(DomainError::Validation(_))
        ));
    }
}
