//! Shared, monotonically decreasing token budget.
//!
//! A [`Budget`] is a single atomic counter shared across a delegation tree:
//! the parent agent and every child created through delegation charge the
//! same counter, so the sum of tokens consumed by the subtree can never
//! exceed the initial allowance. Charges are all-or-nothing — a charge that
//! would overdraw fails with [`AgentError::BudgetExceeded`] and leaves the
//! counter untouched.
//!
//! Iteration budgets use the same mechanism with a unit of "iterations"
//! instead of tokens; see [`Budget::charge`].
//!
//! # Example
//!
//! ```rust
//! use agentmesh::budget::Budget;
//!
//! let budget = Budget::new(1_000);
//! assert!(budget.charge(400).is_ok());
//! assert_eq!(budget.remaining(), 600);
//! assert!(budget.charge(601).is_err());   // would overdraw — rejected
//! assert_eq!(budget.remaining(), 600);    // untouched on failure
//! ```

use crate::agentmesh::error::AgentError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A shared monotone non-increasing resource counter.
///
/// Cloning a `Budget` clones the handle, not the allowance: all clones
/// decrement the same counter. This is how delegation shares a budget with
/// child agents.
#[derive(Debug, Clone)]
pub struct Budget {
    initial: u64,
    remaining: Arc<AtomicU64>,
}

impl Budget {
    /// Create a budget with the given initial allowance.
    pub fn new(initial: u64) -> Self {
        Self {
            initial,
            remaining: Arc::new(AtomicU64::new(initial)),
        }
    }

    /// An effectively unlimited budget.
    pub fn unlimited() -> Self {
        Self::new(u64::MAX)
    }

    /// The initial allowance this budget started with.
    pub fn initial(&self) -> u64 {
        self.initial
    }

    /// Tokens still available.
    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Tokens consumed so far.
    pub fn spent(&self) -> u64 {
        self.initial.saturating_sub(self.remaining())
    }

    /// Whether the budget has been fully consumed.
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Atomically deduct `amount` from the budget.
    ///
    /// All-or-nothing: fails with [`AgentError::BudgetExceeded`] when the
    /// remaining allowance is insufficient, leaving the counter unchanged.
    /// Uses a compare-exchange loop so concurrent charges from sibling
    /// agents never overdraw.
    pub fn charge(&self, amount: u64) -> Result<(), AgentError> {
        let mut current = self.remaining.load(Ordering::Acquire);
        loop {
            if current < amount {
                return Err(AgentError::BudgetExceeded {
                    requested: amount,
                    remaining: current,
                });
            }
            match self.remaining.compare_exchange_weak(
                current,
                current - amount,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_and_remaining() {
        let budget = Budget::new(100);
        budget.charge(30).unwrap();
        budget.charge(70).unwrap();
        assert!(budget.is_exhausted());
        assert_eq!(budget.spent(), 100);
    }

    #[test]
    fn test_overdraw_rejected() {
        let budget = Budget::new(10);
        let err = budget.charge(11).unwrap_err();
        assert_eq!(
            err,
            AgentError::BudgetExceeded {
                requested: 11,
                remaining: 10
            }
        );
        assert_eq!(budget.remaining(), 10);
    }

    #[test]
    fn test_clones_share_allowance() {
        let budget = Budget::new(50);
        let child = budget.clone();
        child.charge(50).unwrap();
        assert!(budget.is_exhausted());
    }

    #[tokio::test]
    async fn test_concurrent_charges_never_overdraw() {
        let budget = Budget::new(1_000);
        let mut handles = Vec::new();
        for _ in 0..10 {
            let b = budget.clone();
            handles.push(tokio::spawn(async move {
                let mut granted = 0u64;
                for _ in 0..200 {
                    if b.charge(1).is_ok() {
                        granted += 1;
                    }
                }
                granted
            }));
        }
        let mut total = 0u64;
        for h in handles {
            total += h.await.unwrap();
        }
        assert_eq!(total, 1_000);
        assert!(budget.is_exhausted());
    }
}
