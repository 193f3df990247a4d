//! Allocation strategies.
//!
//! A strategy is a pure function from (unallocated amount, candidates, directives)
//! to an [`AllocationPlan`]. [`StrategyKind`] selects one; there is no trait object
//! and no strategy state.

pub mod fifo;
pub mod manual;

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{DomainError, DomainResult, Money};

use crate::obligation::{LedgerObligation, ObligationId};

/// Signature shared by every allocation strategy.
pub type Allocator =
    fn(&Money, &[AllocationCandidate], &[AllocationDirective]) -> DomainResult<AllocationPlan>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Oldest due date first.
    #[default]
    Fifo,
    /// Caller-supplied amounts per obligation.
    Manual,
}

impl StrategyKind {
    pub fn allocator(self) -> Allocator {
        match self {
            StrategyKind::Fifo => fifo::allocate,
            StrategyKind::Manual => manual::allocate,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StrategyKind::Fifo => "FIFO",
            StrategyKind::Manual => "MANUAL",
        }
    }
}

impl core::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StrategyKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(StrategyKind::Fifo),
            "manual" => Ok(StrategyKind::Manual),
            other => Err(DomainError::validation(format!(
                "unknown allocation strategy: {other}"
            ))),
        }
    }
}

/// Run the strategy selected by `kind`.
pub fn allocate(
    kind: StrategyKind,
    unallocated: &Money,
    candidates: &[AllocationCandidate],
    directives: &[AllocationDirective],
) -> DomainResult<AllocationPlan> {
    (kind.allocator())(unallocated, candidates, directives)
}

/// The slice of an obligation a strategy needs to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationCandidate {
    pub obligation_id: ObligationId,
    pub number: String,
    pub outstanding: Money,
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&LedgerObligation> for AllocationCandidate {
    fn from(obligation: &LedgerObligation) -> Self {
        Self {
            obligation_id: obligation.id_typed(),
            number: obligation.number().to_string(),
            outstanding: obligation.outstanding(),
            due_date: obligation.due_date(),
            created_at: obligation.created_at(),
        }
    }
}

/// Manual instruction: apply `amount` to `obligation_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationDirective {
    pub obligation_id: ObligationId,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationProposal {
    pub obligation_id: ObligationId,
    pub number: String,
    pub amount: Money,
}

/// Ordered proposals plus the totals they imply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub strategy: StrategyKind,
    pub proposals: Vec<AllocationProposal>,
    pub total_allocated: Money,
    pub remaining: Money,
    pub fully_reconciled: bool,
    pub fully_settled: Vec<ObligationId>,
    pub partially_settled: Vec<ObligationId>,
}

impl AllocationPlan {
    /// A plan that allocates nothing out of `unallocated`.
    pub fn empty(strategy: StrategyKind, unallocated: Money) -> Self {
        Self {
            strategy,
            proposals: Vec::new(),
            total_allocated: Money::zero(unallocated.currency()),
            remaining: unallocated,
            fully_reconciled: unallocated.is_zero(),
            fully_settled: Vec::new(),
            partially_settled: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }

    /// Append a proposal against `candidate`, keeping totals in step.
    fn push(&mut self, candidate: &AllocationCandidate, amount: Money) -> DomainResult<()> {
        self.total_allocated = self.total_allocated.checked_add(&amount)?;
        self.remaining = self.remaining.checked_sub(&amount)?;
        self.fully_reconciled = self.remaining.is_zero();

        if amount == candidate.outstanding {
            self.fully_settled.push(candidate.obligation_id);
        } else {
            self.partially_settled.push(candidate.obligation_id);
        }
        self.proposals.push(AllocationProposal {
            obligation_id: candidate.obligation_id,
            number: candidate.number.clone(),
            amount,
        });
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn dispatch_selects_the_named_strategy() {
        let c = candidate(10000, Some(5));
        let fifo = allocate(StrategyKind::Fifo, &cny(4000), std::slice::from_ref(&c), &[]).unwrap();
        assert_eq!(fifo.strategy, StrategyKind::Fifo);
        assert_eq!(fifo.total_allocated, cny(4000));

        let directive = AllocationDirective {
            obligation_id: c.obligation_id,
            amount: cny(1500),
        };
        let manual = allocate(StrategyKind::Manual, &cny(4000), &[c], &[directive]).unwrap();
        assert_eq!(manual.strategy, StrategyKind::Manual);
        assert_eq!(manual.total_allocated, cny(1500));
        assert_eq!(manual.remaining, cny(2500));
    }

    #[test]
    fn strategy_names_round_trip_through_parse() {
        assert_eq!("FIFO".parse::<StrategyKind>().unwrap(), StrategyKind::Fifo);
        assert_eq!(" manual ".parse::<StrategyKind>().unwrap(), StrategyKind::Manual);
        assert!("lifo".parse::<StrategyKind>().is_err());
    }
}
