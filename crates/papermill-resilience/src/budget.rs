//! Run-wide cost ceiling

use crate::error::ResilienceError;
use std::sync::atomic::{AtomicU64, Ordering};

const MICROS_PER_USD: f64 = 1_000_000.0;

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_micros(usd: f64) -> u64 {
    if usd.is_finite() && usd > 0.0 {
        (usd * MICROS_PER_USD).round() as u64
    } else {
        0
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_usd(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_USD
}

/// Spend tracker shared by every analysis call of a run.
///
/// Amounts are kept as integer micro-dollars so concurrent recording never
/// loses updates.
#[derive(Debug)]
pub struct CostBudget {
    limit_micros: u64,
    spent_micros: AtomicU64,
}

impl CostBudget {
    /// Budget with a USD ceiling
    #[must_use]
    pub fn new(limit_usd: f64) -> Self {
        Self {
            limit_micros: to_micros(limit_usd),
            spent_micros: AtomicU64::new(0),
        }
    }

    /// Configured limit
    #[must_use]
    pub fn limit_usd(&self) -> f64 {
        to_usd(self.limit_micros)
    }

    /// Spent so far
    #[must_use]
    pub fn spent_usd(&self) -> f64 {
        to_usd(self.spent_micros.load(Ordering::Acquire))
    }

    /// Remaining headroom, zero once exhausted
    #[must_use]
    pub fn remaining_usd(&self) -> f64 {
        to_usd(
            self.limit_micros
                .saturating_sub(self.spent_micros.load(Ordering::Acquire)),
        )
    }

    /// True once spend has reached the limit
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.spent_micros.load(Ordering::Acquire) >= self.limit_micros
    }

    /// Gate a call.
    ///
    /// # Errors
    /// `BudgetExhausted` once spend has reached the limit.
    pub fn check(&self) -> Result<(), ResilienceError> {
        if self.is_exhausted() {
            return Err(ResilienceError::BudgetExhausted {
                spent_usd: self.spent_usd(),
                limit_usd: self.limit_usd(),
            });
        }
        Ok(())
    }

    /// Add the cost of a finished call
    pub fn record(&self, cost_usd: f64) {
        let micros = to_micros(cost_usd);
        if micros > 0 {
            self.spent_micros.fetch_add(micros, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_when_spend_reaches_limit() {
        let budget = CostBudget::new(0.10);
        budget.record(0.04);
        assert!(budget.check().is_ok());
        budget.record(0.06);
        assert!(budget.is_exhausted());
        let err = budget.check().unwrap_err();
        assert!(err.is_budget_exhausted());
        assert!((budget.remaining_usd()).abs() < f64::EPSILON);
    }

    #[test]
    fn negative_and_nan_costs_are_ignored() {
        let budget = CostBudget::new(1.0);
        budget.record(-5.0);
        budget.record(f64::NAN);
        assert!((budget.spent_usd()).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_budget_is_exhausted_immediately() {
        assert!(CostBudget::new(0.0).check().is_err());
    }
}
