//! Age-ordered allocation: earliest due date first, undated obligations last.

use core::cmp::Ordering;

use tally_core::{DomainError, DomainResult, Money};

use super::{AllocationCandidate, AllocationDirective, AllocationPlan, StrategyKind};

/// Order by due date (ascending, undated last), then creation time.
///
/// Used with a stable sort, so full ties keep the caller's order.
fn fifo_order(a: &AllocationCandidate, b: &AllocationCandidate) -> Ordering {
    let by_due = match (a.due_date, b.due_date) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_due.then_with(|| a.created_at.cmp(&b.created_at))
}

/// Greedily assign `min(remaining, outstanding)` down the FIFO order.
///
/// Directives are ignored.
pub fn allocate(
    unallocated: &Money,
    candidates: &[AllocationCandidate],
    _directives: &[AllocationDirective],
) -> DomainResult<AllocationPlan> {
    if unallocated.is_negative() {
        return Err(DomainError::validation("unallocated amount cannot be negative"));
    }

    let mut plan = AllocationPlan::empty(StrategyKind::Fifo, *unallocated);
    if candidates.is_empty() {
        return Ok(plan);
    }

    let mut ordered: Vec<&AllocationCandidate> = candidates.iter().collect();
    ordered.sort_by(|a, b| fifo_order(a, b));

    for candidate in ordered {
        if !plan.remaining.is_positive() {
            break;
        }
        if !candidate.outstanding.is_positive() {
            continue;
        }
        let amount = plan.remaining.min(&candidate.outstanding)?;
        plan.push(candidate, amount)?;
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn settles_earliest_due_first_and_partially_fills_the_next() {
        let later = candidate(15000, Some(10));
        let sooner = candidate(20000, Some(5));
        let plan = allocate(&cny(30000), &[later.clone(), sooner.clone()], &[]).unwrap();

        assert_eq!(plan.proposals.len(), 2);
        assert_eq!(plan.proposals[0].obligation_id, sooner.obligation_id);
        assert_eq!(plan.proposals[0].amount, cny(20000));
        assert_eq!(plan.proposals[1].obligation_id, later.obligation_id);
        assert_eq!(plan.proposals[1].amount, cny(10000));
        assert_eq!(plan.fully_settled, vec![sooner.obligation_id]);
        assert_eq!(plan.partially_settled, vec![later.obligation_id]);
        assert_eq!(plan.remaining, cny(0));
        assert!(plan.fully_reconciled);
    }

    #[test]
    fn undated_obligations_come_last() {
        let undated = candidate(5000, None);
        let dated = candidate(5000, Some(60));
        let plan = allocate(&cny(5000), &[undated.clone(), dated.clone()], &[]).unwrap();
        assert_eq!(plan.proposals.len(), 1);
        assert_eq!(plan.proposals[0].obligation_id, dated.obligation_id);
    }

    #[test]
    fn leftover_when_candidates_run_out() {
        let plan = allocate(&cny(50000), &[candidate(12000, Some(1))], &[]).unwrap();
        assert_eq!(plan.total_allocated, cny(12000));
        assert_eq!(plan.remaining, cny(38000));
        assert!(!plan.fully_reconciled);
    }

    #[test]
    fn no_candidates_is_an_empty_plan() {
        let plan = allocate(&cny(100), &[], &[]).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.remaining, cny(100));
    }

    #[test]
    fn skips_settled_candidates() {
        let settled = candidate(0, Some(1));
        let open = candidate(700, Some(2));
        let plan = allocate(&cny(1000), &[settled, open.clone()], &[]).unwrap();
        assert_eq!(plan.proposals.len(), 1);
        assert_eq!(plan.proposals[0].obligation_id, open.obligation_id);
    }

    #[test]
    fn rejects_negative_unallocated() {
        assert!(allocate(&cny(-1), &[candidate(100, None)], &[]).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        #[test]
        fn never_skips_an_earlier_due_obligation(
            unallocated in 0i64..5_000_000,
            specs in prop::collection::vec((1i64..1_000_000, prop::option::of(-30i64..90)), 0..12),
        ) {
            let candidates: Vec<_> = specs.iter().map(|(amt, due)| candidate(*amt, *due)).collect();
            let plan = allocate(&cny(unallocated), &candidates, &[]).unwrap();

            // Totals reconcile against the input.
            prop_assert_eq!(plan.total_allocated.checked_add(&plan.remaining).unwrap(), cny(unallocated));

            // Every proposal except the last settles its candidate in full.
            for p in plan.proposals.iter().rev().skip(1) {
                let c = candidates.iter().find(|c| c.obligation_id == p.obligation_id).unwrap();
                prop_assert_eq!(p.amount, c.outstanding);
            }

            // Proposals follow non-decreasing due dates, undated last.
            let dues: Vec<_> = plan.proposals.iter()
                .map(|p| candidates.iter().find(|c| c.obligation_id == p.obligation_id).unwrap().due_date)
                .collect();
            for pair in dues.windows(2) {
                match (pair[0], pair[1]) {
                    (Some(a), Some(b)) => prop_assert!(a <= b),
                    (None, Some(_)) => prop_assert!(false, "undated before dated"),
                    _ => {}
                }
            }

            // If money is left, nothing was left open.
            if plan.remaining.is_positive() {
                prop_assert_eq!(plan.total_allocated, Money::sum(tally_core::Currency::Cny, candidates.iter().map(|c| &c.outstanding)).unwrap());
            }
        }
    }
}
