//! Prepaid customer balance.
//!
//! A debit checks sufficiency against the in-memory balance; the version-checked
//! save that follows is what makes the check hold under concurrency.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{
    Aggregate, AggregateId, AggregateRoot, CounterpartyId, Currency, DomainError, DomainResult,
    Money, TenantId, Versioned,
};
use tally_events::Event;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BalanceAccountId(pub AggregateId);

impl BalanceAccountId {
    pub fn new() -> Self {
        Self(AggregateId::new())
    }
}

impl Default for BalanceAccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for BalanceAccountId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate root: one customer's prepaid balance. Invariant: `balance >= 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceAccount {
    id: BalanceAccountId,
    tenant_id: TenantId,
    customer_id: CounterpartyId,
    balance: Money,
    version: u64,
    pending_events: Vec<BalanceEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceMovement {
    pub tenant_id: TenantId,
    pub account_id: BalanceAccountId,
    pub customer_id: CounterpartyId,
    pub amount: Money,
    pub reference: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceCommand {
    Credit(BalanceMovement),
    Debit(BalanceMovement),
}

/// Event: balance changed by `amount`, from `balance_before` to `balance_after`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChanged {
    pub tenant_id: TenantId,
    pub account_id: BalanceAccountId,
    pub customer_id: CounterpartyId,
    pub amount: Money,
    pub balance_before: Money,
    pub balance_after: Money,
    pub reference: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceEvent {
    Credited(BalanceChanged),
    Debited(BalanceChanged),
}

impl BalanceEvent {
    pub fn change(&self) -> &BalanceChanged {
        match self {
            BalanceEvent::Credited(e) | BalanceEvent::Debited(e) => e,
        }
    }
}

impl Event for BalanceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BalanceEvent::Credited(_) => "ledger.balance.credited",
            BalanceEvent::Debited(_) => "ledger.balance.debited",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.change().occurred_at
    }

    fn tenant_id(&self) -> TenantId {
        self.change().tenant_id
    }

    fn aggregate_id(&self) -> AggregateId {
        self.change().account_id.0
    }

    fn aggregate_type(&self) -> &'static str {
        "ledger.balance_account"
    }
}

impl BalanceAccount {
    /// A fresh, unpersisted account with a zero balance.
    pub fn open(tenant_id: TenantId, customer_id: CounterpartyId, currency: Currency) -> Self {
        Self {
            id: BalanceAccountId::new(),
            tenant_id,
            customer_id,
            balance: Money::zero(currency),
            version: 0,
            pending_events: Vec::new(),
        }
    }

    pub fn credit(&mut self, amount: Money, reference: impl Into<String>, at: DateTime<Utc>) -> DomainResult<()> {
        let cmd = BalanceCommand::Credit(self.movement(amount, reference.into(), at));
        self.record(&cmd)
    }

    pub fn debit(&mut self, amount: Money, reference: impl Into<String>, at: DateTime<Utc>) -> DomainResult<()> {
        let cmd = BalanceCommand::Debit(self.movement(amount, reference.into(), at));
        self.record(&cmd)
    }

    /// Whether a debit of `amount` would be covered.
    pub fn has_sufficient(&self, amount: &Money) -> DomainResult<bool> {
        Ok(!self.balance.less_than(amount)?)
    }

    fn movement(&self, amount: Money, reference: String, at: DateTime<Utc>) -> BalanceMovement {
        BalanceMovement {
            tenant_id: self.tenant_id,
            account_id: self.id,
            customer_id: self.customer_id,
            amount,
            reference,
            occurred_at: at,
        }
    }

    fn record(&mut self, cmd: &BalanceCommand) -> DomainResult<()> {
        let events = self.execute(cmd)?;
        self.pending_events.extend(events);
        Ok(())
    }

    pub fn take_events(&mut self) -> Vec<BalanceEvent> {
        std::mem::take(&mut self.pending_events)
    }

    pub fn id_typed(&self) -> BalanceAccountId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn customer_id(&self) -> CounterpartyId {
        self.customer_id
    }

    pub fn balance(&self) -> Money {
        self.balance
    }

    fn checked_movement(&self, m: &BalanceMovement) -> DomainResult<()> {
        if m.tenant_id != self.tenant_id || m.account_id != self.id {
            return Err(DomainError::invariant("balance movement targets another account"));
        }
        if !m.amount.is_positive() {
            return Err(DomainError::validation("amount must be positive"));
        }
        Ok(())
    }

    fn changed(&self, m: &BalanceMovement, after: Money) -> BalanceChanged {
        BalanceChanged {
            tenant_id: m.tenant_id,
            account_id: m.account_id,
            customer_id: m.customer_id,
            amount: m.amount,
            balance_before: self.balance,
            balance_after: after,
            reference: m.reference.clone(),
            occurred_at: m.occurred_at,
        }
    }
}

impl AggregateRoot for BalanceAccount {
    type Id = BalanceAccountId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Versioned for BalanceAccount {
    fn mark_persisted(&mut self, version: u64) {
        self.version = version;
    }
}

impl Aggregate for BalanceAccount {
    type Command = BalanceCommand;
    type Event = BalanceEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        self.balance = event.change().balance_after;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            BalanceCommand::Credit(m) => {
                self.checked_movement(m)?;
                let after = self.balance.checked_add(&m.amount)?;
                Ok(vec![BalanceEvent::Credited(self.changed(m, after))])
            }
            BalanceCommand::Debit(m) => {
                self.checked_movement(m)?;
                if !self.has_sufficient(&m.amount)? {
                    return Err(DomainError::InsufficientBalance {
                        available: self.balance.to_string(),
                        required: m.amount.to_string(),
                    });
                }
                let after = self.balance.checked_sub(&m.amount)?;
                Ok(vec![BalanceEvent::Debited(self.changed(m, after))])
            }
        }
    }
}
