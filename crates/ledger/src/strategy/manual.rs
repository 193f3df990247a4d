//! Directive-driven allocation.
//!
//! Every directive is validated before anything is proposed; the first violation
//! fails the whole call and names the directive by position.

use std::collections::{HashMap, HashSet};

use tally_core::{DomainError, DomainResult, Money};

use super::{AllocationCandidate, AllocationDirective, AllocationPlan, StrategyKind};

pub fn allocate(
    unallocated: &Money,
    candidates: &[AllocationCandidate],
    directives: &[AllocationDirective],
) -> DomainResult<AllocationPlan> {
    if unallocated.is_negative() {
        return Err(DomainError::validation("unallocated amount cannot be negative"));
    }
    if candidates.is_empty() {
        return Ok(AllocationPlan::empty(StrategyKind::Manual, *unallocated));
    }
    if directives.is_empty() {
        return Err(DomainError::validation(
            "manual allocation requires at least one directive",
        ));
    }

    let by_id: HashMap<_, _> = candidates.iter().map(|c| (c.obligation_id, c)).collect();
    let mut seen = HashSet::with_capacity(directives.len());
    let mut total = Money::zero(unallocated.currency());
    let mut targets = Vec::with_capacity(directives.len());

    for (index, directive) in directives.iter().enumerate() {
        let candidate = by_id.get(&directive.obligation_id).ok_or_else(|| {
            DomainError::directive(
                index,
                format!("obligation {} is not an open candidate", directive.obligation_id),
            )
        })?;
        if !seen.insert(directive.obligation_id) {
            return Err(DomainError::directive(
                index,
                format!("obligation {} appears more than once", candidate.number),
            ));
        }
        if !candidate.outstanding.is_positive() {
            return Err(DomainError::directive(
                index,
                format!("obligation {} is already fully settled", candidate.number),
            ));
        }
        if !directive.amount.is_positive() {
            return Err(DomainError::directive(index, "amount must be positive"));
        }
        let exceeds = directive
            .amount
            .greater_than(&candidate.outstanding)
            .map_err(|e| DomainError::directive(index, e.to_string()))?;
        if exceeds {
            return Err(DomainError::directive(
                index,
                format!(
                    "amount {} exceeds outstanding {} on {}",
                    directive.amount, candidate.outstanding, candidate.number
                ),
            ));
        }

        total = total
            .checked_add(&directive.amount)
            .map_err(|e| DomainError::directive(index, e.to_string()))?;
        if total.greater_than(unallocated)? {
            return Err(DomainError::directive(
                index,
                format!("directive total {total} exceeds unallocated {unallocated}"),
            ));
        }

        targets.push((*candidate, directive.amount));
    }

    let mut plan = AllocationPlan::empty(StrategyKind::Manual, *unallocated);
    for (candidate, amount) in targets {
        plan.push(candidate, amount)?;
    }
    Ok(plan)
}
