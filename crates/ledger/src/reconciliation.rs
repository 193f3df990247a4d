//! Reconciliation: apply a settlement instrument against open obligations.
//!
//! The engine plans with a strategy, then applies every proposal to staged copies
//! of the aggregates. Only when all of them succeed are the caller's aggregates
//! replaced, so a failure leaves both sides exactly as they were. Persisting the
//! result is the caller's job.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{DomainError, DomainResult, Money, TenantId};

use crate::allocation::AllocationRecord;
use crate::instrument::SettlementInstrument;
use crate::obligation::{LedgerObligation, ObligationId, ObligationStatus};
use crate::strategy::{self, AllocationCandidate, AllocationDirective, AllocationPlan, StrategyKind};

/// What the caller wants reconciled, and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileRequest {
    /// Explicit strategy; `None` falls back to the tenant default, then FIFO.
    pub strategy: Option<StrategyKind>,
    pub directives: Vec<AllocationDirective>,
    pub occurred_at: DateTime<Utc>,
}

impl ReconcileRequest {
    /// Let the engine pick the strategy.
    pub fn auto(occurred_at: DateTime<Utc>) -> Self {
        Self {
            strategy: None,
            directives: Vec::new(),
            occurred_at,
        }
    }

    pub fn fifo(occurred_at: DateTime<Utc>) -> Self {
        Self {
            strategy: Some(StrategyKind::Fifo),
            ..Self::auto(occurred_at)
        }
    }

    pub fn manual(directives: Vec<AllocationDirective>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            strategy: Some(StrategyKind::Manual),
            directives,
            occurred_at,
        }
    }
}

/// Summary of one applied reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationOutcome {
    pub strategy: StrategyKind,
    pub records: Vec<AllocationRecord>,
    /// Obligations that received at least one allocation, in application order.
    pub touched: Vec<ObligationId>,
    pub total_reconciled: Money,
    pub remaining_unallocated: Money,
    pub fully_reconciled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationEngine {
    tenant_defaults: HashMap<TenantId, StrategyKind>,
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant_default(mut self, tenant_id: TenantId, strategy: StrategyKind) -> Self {
        self.tenant_defaults.insert(tenant_id, strategy);
        self
    }

    pub fn with_tenant_defaults(
        mut self,
        defaults: impl IntoIterator<Item = (TenantId, StrategyKind)>,
    ) -> Self {
        self.tenant_defaults.extend(defaults);
        self
    }

    /// Explicit override, then tenant default, then FIFO.
    pub fn select_strategy(&self, tenant_id: TenantId, explicit: Option<StrategyKind>) -> StrategyKind {
        explicit
            .or_else(|| self.tenant_defaults.get(&tenant_id).copied())
            .unwrap_or(StrategyKind::Fifo)
    }

    /// Compute the allocation plan without touching either side.
    pub fn preview(
        &self,
        instrument: &SettlementInstrument,
        obligations: &[LedgerObligation],
        request: &ReconcileRequest,
    ) -> DomainResult<AllocationPlan> {
        if !instrument.is_confirmed() {
            return Err(DomainError::invalid_state(format!(
                "instrument {} must be confirmed before reconciliation",
                instrument.number()
            )));
        }
        if !instrument.unallocated().is_positive() {
            return Err(DomainError::validation(format!(
                "instrument {} has no unallocated amount",
                instrument.number()
            )));
        }

        let candidates = eligible_candidates(instrument, obligations)?;
        let kind = self.select_strategy(instrument.tenant_id(), request.strategy);
        strategy::allocate(kind, &instrument.unallocated(), &candidates, &request.directives)
    }

    /// Plan and apply allocations to both sides, all or nothing.
    pub fn reconcile(
        &self,
        instrument: &mut SettlementInstrument,
        obligations: &mut [LedgerObligation],
        request: &ReconcileRequest,
    ) -> DomainResult<ReconciliationOutcome> {
        let plan = self.preview(instrument, obligations, request)?;
        let remark = format!(
            "Auto-reconciled via {} strategy ({})",
            plan.strategy,
            instrument.number()
        );

        let positions: HashMap<ObligationId, usize> = obligations
            .iter()
            .enumerate()
            .map(|(i, o)| (o.id_typed(), i))
            .collect();

        let mut staged_instrument = instrument.clone();
        let mut staged: Vec<(usize, LedgerObligation)> = Vec::with_capacity(plan.proposals.len());
        // obligation position -> index into `staged`
        let mut slots: HashMap<usize, usize> = HashMap::with_capacity(plan.proposals.len());
        let mut records = Vec::with_capacity(plan.proposals.len());

        for proposal in &plan.proposals {
            let position = *positions.get(&proposal.obligation_id).ok_or_else(|| {
                DomainError::invariant(format!(
                    "proposal targets unknown obligation {}",
                    proposal.obligation_id
                ))
            })?;

            let record = AllocationRecord::new(
                staged_instrument.id_typed(),
                proposal.obligation_id,
                proposal.amount,
                request.occurred_at,
                remark.clone(),
            );

            let slot = *slots.entry(position).or_insert_with(|| {
                staged.push((position, obligations[position].clone()));
                staged.len() - 1
            });
            staged[slot].1.apply_allocation(&record)?;
            staged_instrument.apply_allocation(&record)?;
            records.push(record);
        }

        let touched = staged.iter().map(|(_, o)| o.id_typed()).collect();
        for (position, obligation) in staged {
            obligations[position] = obligation;
        }
        *instrument = staged_instrument;

        Ok(ReconciliationOutcome {
            strategy: plan.strategy,
            records,
            touched,
            total_reconciled: plan.total_allocated,
            remaining_unallocated: instrument.unallocated(),
            fully_reconciled: instrument.is_fully_allocated(),
        })
    }
}

/// Obligations this instrument may settle, as strategy candidates.
///
/// Obligations of another counterparty or direction, red-letter entries, and
/// cancelled obligations are filtered out. Another tenant or another currency is
/// an error rather than a filter.
fn eligible_candidates(
    instrument: &SettlementInstrument,
    obligations: &[LedgerObligation],
) -> DomainResult<Vec<AllocationCandidate>> {
    let mut candidates = Vec::with_capacity(obligations.len());
    for obligation in obligations {
        if obligation.tenant_id() != instrument.tenant_id() {
            return Err(DomainError::invariant(format!(
                "obligation {} belongs to another tenant",
                obligation.number()
            )));
        }
        if obligation.counterparty_id() != instrument.counterparty_id()
            || obligation.kind() != instrument.kind().settles()
            || obligation.is_red_letter()
            || obligation.status() == ObligationStatus::Cancelled
        {
            continue;
        }
        if obligation.currency() != instrument.currency() {
            return Err(DomainError::currency_mismatch(
                instrument.currency(),
                obligation.currency(),
            ));
        }
        candidates.push(AllocationCandidate::from(obligation));
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{InstrumentId, InstrumentKind, PaymentMethod, RegisterInstrument};
    use crate::obligation::{ObligationKind, OpenObligation, SourceType};
    use chrono::Duration;
    use proptest::prelude::*;
    use tally_core::{CounterpartyId, Currency};
    use uuid::Uuid;

    fn cny(minor: i64) -> Money {
        Money::from_minor(minor, Currency::Cny)
    }

    struct Fixture {
        tenant_id: TenantId,
        customer: CounterpartyId,
        now: DateTime<Utc>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tenant_id: TenantId::new(),
                customer: CounterpartyId::new(),
                now: Utc::now(),
            }
        }

        fn receivable(&self, minor: i64, due_in_days: Option<i64>) -> LedgerObligation {
            self.obligation(minor, due_in_days, SourceType::SalesOrder, self.customer)
        }

        fn obligation(
            &self,
            minor: i64,
            due_in_days: Option<i64>,
            source_type: SourceType,
            counterparty_id: CounterpartyId,
        ) -> LedgerObligation {
            LedgerObligation::open(OpenObligation {
                tenant_id: self.tenant_id,
                obligation_id: ObligationId::new(),
                kind: ObligationKind::Receivable,
                number: format!("AR-{minor}"),
                counterparty_id,
                counterparty_name: "Acme Trading".to_string(),
                source_type,
                source_id: Uuid::now_v7(),
                source_number: "SO-1".to_string(),
                total: cny(minor),
                due_date: due_in_days.map(|d| self.now + Duration::days(d)),
                remark: None,
                occurred_at: self.now,
            })
            .unwrap()
        }

        fn receipt(&self, minor: i64) -> SettlementInstrument {
            let mut instrument = SettlementInstrument::register(RegisterInstrument {
                tenant_id: self.tenant_id,
                instrument_id: InstrumentId::new(),
                kind: InstrumentKind::Receipt,
                number: "RV-20260124-00001".to_string(),
                counterparty_id: self.customer,
                counterparty_name: "Acme Trading".to_string(),
                amount: cny(minor),
                payment_method: PaymentMethod::BankTransfer,
                payment_reference: None,
                occurred_at: self.now,
            })
            .unwrap();
            instrument.confirm(None, None, self.now).unwrap();
            instrument
        }
    }

    #[test]
    fn fifo_scenario_settles_first_and_partially_fills_second() {
        let fx = Fixture::new();
        let mut instrument = fx.receipt(30000);
        let mut obligations = vec![fx.receivable(20000, Some(5)), fx.receivable(15000, Some(10))];

        let outcome = ReconciliationEngine::new()
            .reconcile(&mut instrument, &mut obligations, &ReconcileRequest::fifo(fx.now))
            .unwrap();

        assert_eq!(obligations[0].status(), ObligationStatus::Paid);
        assert_eq!(obligations[0].outstanding(), cny(0));
        assert_eq!(obligations[1].status(), ObligationStatus::Partial);
        assert_eq!(obligations[1].paid(), cny(10000));
        assert_eq!(obligations[1].outstanding(), cny(5000));
        assert!(instrument.is_fully_allocated());
        assert_eq!(instrument.allocated(), cny(30000));
        assert!(outcome.fully_reconciled);
        assert_eq!(outcome.total_reconciled, cny(30000));
        assert_eq!(outcome.remaining_unallocated, cny(0));
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.touched, vec![obligations[0].id_typed(), obligations[1].id_typed()]);

        // Each record sits on both sides.
        assert_eq!(instrument.allocations(), outcome.records.as_slice());
        assert_eq!(obligations[0].allocations(), &outcome.records[..1]);
        assert!(outcome.records[0].remark.contains("FIFO"));
    }

    #[test]
    fn wide_batch_writes_back_to_the_right_positions() {
        let fx = Fixture::new();
        let mut instrument = fx.receipt(15000);
        // Latest due first, so allocation order is the reverse of slice order.
        let mut obligations: Vec<_> = (0..200).rev().map(|d| fx.receivable(100, Some(d + 1))).collect();

        let outcome = ReconciliationEngine::new()
            .reconcile(&mut instrument, &mut obligations, &ReconcileRequest::fifo(fx.now))
            .unwrap();

        assert_eq!(outcome.touched.len(), 150);
        let expected: Vec<_> = obligations.iter().rev().take(150).map(|o| o.id_typed()).collect();
        assert_eq!(outcome.touched, expected);
        assert!(obligations[50..].iter().all(|o| o.status() == ObligationStatus::Paid));
        assert!(obligations[..50].iter().all(|o| o.status() == ObligationStatus::Pending));
        assert!(instrument.is_fully_allocated());
    }

    #[test]
    fn strategy_selection_order() {
        let tenant = TenantId::new();
        let engine = ReconciliationEngine::new().with_tenant_default(tenant, StrategyKind::Manual);
        assert_eq!(engine.select_strategy(tenant, None), StrategyKind::Manual);
        assert_eq!(engine.select_strategy(tenant, Some(StrategyKind::Fifo)), StrategyKind::Fifo);
        assert_eq!(engine.select_strategy(TenantId::new(), None), StrategyKind::Fifo);
    }

    #[test]
    fn tenant_default_manual_without_directives_fails() {
        let fx = Fixture::new();
        let engine = ReconciliationEngine::new().with_tenant_default(fx.tenant_id, StrategyKind::Manual);
        let mut instrument = fx.receipt(1000);
        let mut obligations = vec![fx.receivable(1000, None)];
        assert!(matches!(
            engine.reconcile(&mut instrument, &mut obligations, &ReconcileRequest::auto(fx.now)),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn rejected_manual_plan_leaves_both_sides_untouched() {
        let fx = Fixture::new();
        let mut instrument = fx.receipt(10000);
        let mut obligations = vec![fx.receivable(8000, Some(1)), fx.receivable(8000, Some(2))];
        let before_instrument = instrument.clone();
        let before_obligations = obligations.clone();

        let request = ReconcileRequest::manual(
            vec![
                AllocationDirective { obligation_id: obligations[0].id_typed(), amount: cny(8000) },
                AllocationDirective { obligation_id: obligations[1].id_typed(), amount: cny(2001) },
            ],
            fx.now,
        );
        let err = ReconciliationEngine::new()
            .reconcile(&mut instrument, &mut obligations, &request)
            .unwrap_err();

        assert!(matches!(err, DomainError::InvalidDirective { index: 1, .. }));
        assert_eq!(instrument, before_instrument);
        assert_eq!(obligations, before_obligations);
    }

    #[test]
    fn draft_instrument_is_rejected() {
        let fx = Fixture::new();
        let mut instrument = SettlementInstrument::register(RegisterInstrument {
            tenant_id: fx.tenant_id,
            instrument_id: InstrumentId::new(),
            kind: InstrumentKind::Receipt,
            number: "RV-1".to_string(),
            counterparty_id: fx.customer,
            counterparty_name: "Acme".to_string(),
            amount: cny(100),
            payment_method: PaymentMethod::Cash,
            payment_reference: None,
            occurred_at: fx.now,
        })
        .unwrap();
        let mut obligations = vec![fx.receivable(100, None)];
        assert!(matches!(
            ReconciliationEngine::new().reconcile(&mut instrument, &mut obligations, &ReconcileRequest::fifo(fx.now)),
            Err(DomainError::InvalidState(_))
        ));
    }

    #[test]
    fn ineligible_obligations_are_filtered() {
        let fx = Fixture::new();
        let mut instrument = fx.receipt(10000);
        let mut cancelled = fx.receivable(1000, Some(1));
        cancelled.cancel("void", fx.now).unwrap();
        let mut obligations = vec![
            fx.obligation(1000, Some(1), SourceType::SalesOrder, CounterpartyId::new()),
            fx.obligation(1000, Some(1), SourceType::SalesReturn, fx.customer),
            cancelled,
            fx.receivable(4000, Some(3)),
        ];

        let outcome = ReconciliationEngine::new()
            .reconcile(&mut instrument, &mut obligations, &ReconcileRequest::fifo(fx.now))
            .unwrap();
        assert_eq!(outcome.touched, vec![obligations[3].id_typed()]);
        assert_eq!(outcome.remaining_unallocated, cny(6000));
        assert!(!outcome.fully_reconciled);
    }

    #[test]
    fn other_currency_candidate_is_a_mismatch() {
        let fx = Fixture::new();
        let mut instrument = fx.receipt(10000);
        let usd = LedgerObligation::open(OpenObligation {
            tenant_id: fx.tenant_id,
            obligation_id: ObligationId::new(),
            kind: ObligationKind::Receivable,
            number: "AR-USD".to_string(),
            counterparty_id: fx.customer,
            counterparty_name: "Acme".to_string(),
            source_type: SourceType::SalesOrder,
            source_id: Uuid::now_v7(),
            source_number: "SO-2".to_string(),
            total: Money::from_minor(500, Currency::Usd),
            due_date: None,
            remark: None,
            occurred_at: fx.now,
        })
        .unwrap();
        let mut obligations = vec![usd];
        assert!(matches!(
            ReconciliationEngine::new().reconcile(&mut instrument, &mut obligations, &ReconcileRequest::fifo(fx.now)),
            Err(DomainError::CurrencyMismatch { .. })
        ));
    }

    #[test]
    fn other_tenant_candidate_is_an_invariant_violation() {
        let fx = Fixture::new();
        let other = Fixture::new();
        let mut instrument = fx.receipt(10000);
        let mut obligations = vec![other.receivable(100, None)];
        assert!(matches!(
            ReconciliationEngine::new().reconcile(&mut instrument, &mut obligations, &ReconcileRequest::fifo(fx.now)),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn preview_does_not_mutate() {
        let fx = Fixture::new();
        let instrument = fx.receipt(5000);
        let obligations = vec![fx.receivable(20000, Some(5))];
        let plan = ReconciliationEngine::new()
            .preview(&instrument, &obligations, &ReconcileRequest::fifo(fx.now))
            .unwrap();
        assert_eq!(plan.total_allocated, cny(5000));
        assert_eq!(instrument.unallocated(), cny(5000));
        assert_eq!(obligations[0].outstanding(), cny(20000));
    }

    #[test]
    fn no_candidates_reconciles_nothing() {
        let fx = Fixture::new();
        let mut instrument = fx.receipt(5000);
        let outcome = ReconciliationEngine::new()
            .reconcile(&mut instrument, &mut [], &ReconcileRequest::fifo(fx.now))
            .unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.remaining_unallocated, cny(5000));
        assert!(!outcome.fully_reconciled);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        #[test]
        fn sums_hold_on_both_sides_after_reconcile(
            amount in 1i64..2_000_000,
            specs in prop::collection::vec((1i64..500_000, prop::option::of(0i64..60)), 0..10),
        ) {
            let fx = Fixture::new();
            let mut instrument = fx.receipt(amount);
            let mut obligations: Vec<_> = specs.iter().map(|(m, d)| fx.receivable(*m, *d)).collect();

            ReconciliationEngine::new()
                .reconcile(&mut instrument, &mut obligations, &ReconcileRequest::fifo(fx.now))
                .unwrap();

            prop_assert_eq!(instrument.allocated().checked_add(&instrument.unallocated()).unwrap(), instrument.amount());
            let applied = Money::sum(Currency::Cny, instrument.allocations().iter().map(|r| &r.amount)).unwrap();
            prop_assert_eq!(applied, instrument.allocated());
            for o in &obligations {
                prop_assert_eq!(o.paid().checked_add(&o.outstanding()).unwrap(), o.total());
                let paid = Money::sum(Currency::Cny, o.allocations().iter().map(|r| &r.amount)).unwrap();
                prop_assert_eq!(paid, o.paid());
            }
        }
    }
}
