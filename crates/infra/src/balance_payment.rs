//! Paying directly out of a customer's prepaid balance.
//!
//! Each call is one load → decide → version-checked save. A concurrent writer
//! makes the save fail with `StaleVersion`; nothing here retries, so two racing
//! debits cannot both spend the same balance. The one exception is opening an
//! account: a first credit that finds the account already opened credits it.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, instrument, warn};

use tally_core::{CounterpartyId, DomainError, Money, TenantId};
use tally_events::EventPublisher;
use tally_ledger::BalanceAccount;

use crate::publishing::{LedgerEnvelope, PublishFailure, publish_all};
use crate::repository::{BalanceAccountRepository, RepositoryError};

#[derive(Debug, Error)]
pub enum BalancePaymentError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// The balance changed; only its event failed to go out.
    #[error(transparent)]
    Publish(#[from] PublishFailure),
}

impl BalancePaymentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BalancePaymentError::Repository(e) if e.is_retryable())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceMovementResult {
    pub balance_before: Money,
    pub balance_after: Money,
}

pub struct BalancePaymentService<S, P> {
    store: S,
    publisher: P,
}

impl<S, P> BalancePaymentService<S, P>
where
    S: BalanceAccountRepository,
    P: EventPublisher<LedgerEnvelope>,
{
    pub fn new(store: S, publisher: P) -> Self {
        Self { store, publisher }
    }

    pub fn balance_of(
        &self,
        tenant_id: TenantId,
        customer_id: CounterpartyId,
    ) -> Result<Option<Money>, BalancePaymentError> {
        Ok(self
            .store
            .find_by_customer(tenant_id, customer_id)?
            .map(|account| account.balance()))
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id, customer_id = %customer_id, amount = %amount))]
    pub fn pay_with_balance(
        &self,
        tenant_id: TenantId,
        customer_id: CounterpartyId,
        amount: Money,
        reference: &str,
        at: DateTime<Utc>,
    ) -> Result<BalanceMovementResult, BalancePaymentError> {
        if !amount.is_positive() {
            return Err(DomainError::validation("payment amount must be positive").into());
        }
        let mut account = self
            .store
            .find_by_customer(tenant_id, customer_id)?
            .ok_or_else(|| DomainError::not_found(format!("balance account for customer {customer_id}")))?;

        let balance_before = account.balance();
        if let Err(e) = account.debit(amount, reference, at) {
            if matches!(e, DomainError::InsufficientBalance { .. }) {
                warn!(available = %balance_before, "insufficient balance");
            }
            return Err(e.into());
        }
        self.store.save_with_version_check(&mut account)?;

        info!(
            reference,
            balance_before = %balance_before,
            balance_after = %account.balance(),
            "balance debited"
        );
        self.finish(&mut account, balance_before)
    }

    /// Top up a customer's balance, opening the account on first use.
    ///
    /// Losing a race to open the account is not an error: the credit is applied
    /// to the account the other caller stored.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, customer_id = %customer_id, amount = %amount))]
    pub fn credit(
        &self,
        tenant_id: TenantId,
        customer_id: CounterpartyId,
        amount: Money,
        reference: &str,
        at: DateTime<Utc>,
    ) -> Result<BalanceMovementResult, BalancePaymentError> {
        let (mut account, balance_before, opened) = match self.store.find_by_customer(tenant_id, customer_id)? {
            Some(mut account) => {
                let balance_before = account.balance();
                account.credit(amount, reference, at)?;
                self.store.save_with_version_check(&mut account)?;
                (account, balance_before, false)
            }
            None => {
                let mut account = BalanceAccount::open(tenant_id, customer_id, amount.currency());
                let balance_before = account.balance();
                account.credit(amount, reference, at)?;
                match self.store.insert(&mut account) {
                    Ok(()) => (account, balance_before, true),
                    Err(RepositoryError::Duplicate(_)) => {
                        warn!("balance account opened concurrently, crediting the stored one");
                        let mut account = self
                            .store
                            .find_by_customer(tenant_id, customer_id)?
                            .ok_or_else(|| {
                                RepositoryError::NotFound(format!("balance account for customer {customer_id}"))
                            })?;
                        let balance_before = account.balance();
                        account.credit(amount, reference, at)?;
                        self.store.save_with_version_check(&mut account)?;
                        (account, balance_before, false)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        info!(
            reference,
            opened,
            balance_after = %account.balance(),
            "balance credited"
        );
        self.finish(&mut account, balance_before)
    }

    fn finish(
        &self,
        account: &mut BalanceAccount,
        balance_before: Money,
    ) -> Result<BalanceMovementResult, BalancePaymentError> {
        publish_all(&self.publisher, account.take_events())?;
        Ok(BalanceMovementResult {
            balance_before,
            balance_after: account.balance(),
        })
    }
}
