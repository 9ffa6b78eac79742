//! Reserve fund balance and guarantee coverage
//!
//! The reserve fund backs the minimum yield promised by guaranteed products.
//! Its balance is a signed fold over an append-only ledger, and a new
//! guaranteed subscription is only acceptable while
//! `balance / (existing + additional liability)` stays at or above the
//! product's coverage minimum.

/// Which way a ledger entry moves the reserve balance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Adds to the balance (deposits, top-ups)
    Credit,
    /// Subtracts from the balance (withdrawals, guarantee payouts)
    Debit,
}

/// Fold ledger movements into the current reserve balance.
pub fn reserve_balance<I>(entries: I) -> f64
where
    I: IntoIterator<Item = (Direction, f64)>,
{
    entries
        .into_iter()
        .fold(0.0, |acc, (direction, amount)| match direction {
            Direction::Credit => acc + amount,
            Direction::Debit => acc - amount,
        })
}

/// Liability a guaranteed subscription places on the reserve at minimum yield.
///
/// A term without a minimum yield carries no liability.
#[inline]
pub fn guarantee_liability(principal: f64, min_yield_rate: Option<f64>) -> f64 {
    principal * min_yield_rate.unwrap_or(0.0)
}

/// Coverage ratio of the reserve against current plus additional liability.
///
/// Zero (or negative) total liability yields `f64::INFINITY`: there is
/// nothing to cover, so any minimum passes.
#[inline]
pub fn coverage_ratio(balance: f64, existing_liability: f64, additional_liability: f64) -> f64 {
    let total = existing_liability + additional_liability;
    if total <= 0.0 {
        return f64::INFINITY;
    }
    balance / total
}

/// Coverage figures computed for one prospective subscription
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coverage {
    /// Reserve balance at check time
    pub balance: f64,
    /// Liability of subscriptions already holding a guarantee
    pub existing_liability: f64,
    /// Liability the new subscription would add
    pub additional_liability: f64,
    /// existing + additional
    pub projected_liability: f64,
    /// balance / projected (infinite when nothing is owed)
    pub coverage_ratio: f64,
}

impl Coverage {
    /// Whether the ratio meets the required minimum.
    pub fn passes(&self, required_ratio: f64) -> bool {
        self.coverage_ratio >= required_ratio
    }

    /// How much reserve would have to be added to meet `required_ratio`.
    pub fn shortfall(&self, required_ratio: f64) -> f64 {
        if self.passes(required_ratio) {
            return 0.0;
        }
        (self.projected_liability * required_ratio - self.balance).max(0.0)
    }
}

/// Project reserve coverage after adding a subscription of `principal` at
/// `min_yield_rate`.
pub fn project_coverage(
    balance: f64,
    existing_liability: f64,
    principal: f64,
    min_yield_rate: Option<f64>,
) -> Coverage {
    let additional_liability = guarantee_liability(principal, min_yield_rate);
    Coverage {
        balance,
        existing_liability,
        additional_liability,
        projected_liability: existing_liability + additional_liability,
        coverage_ratio: coverage_ratio(balance, existing_liability, additional_liability),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_balance_signed_sum() {
        let entries = vec![
            (Direction::Credit, 100_000.0),
            (Direction::Credit, 5_000.0),
            (Direction::Debit, 20_000.0),
        ];
        assert_eq!(reserve_balance(entries), 85_000.0);
    }

    #[test]
    fn test_reserve_balance_empty() {
        assert_eq!(reserve_balance(Vec::new()), 0.0);
    }

    #[test]
    fn test_liability_without_min_yield() {
        assert_eq!(guarantee_liability(10_000.0, None), 0.0);
        assert_eq!(guarantee_liability(10_000.0, Some(0.05)), 500.0);
    }

    #[test]
    fn test_zero_liability_always_passes() {
        let coverage = project_coverage(0.0, 0.0, 5_000.0, None);
        assert!(coverage.coverage_ratio.is_infinite());
        assert!(coverage.passes(1_000.0));
        assert_eq!(coverage.shortfall(1_000.0), 0.0);
    }

    #[test]
    fn test_reference_scenario() {
        // 100k reserve, 80k existing liability, 5k principal at 5%
        let coverage = project_coverage(100_000.0, 80_000.0, 5_000.0, Some(0.05));

        assert_eq!(coverage.additional_liability, 250.0);
        assert_eq!(coverage.projected_liability, 80_250.0);
        assert!((coverage.coverage_ratio - 1.2461).abs() < 1e-4);

        assert!(coverage.passes(1.2));
        assert!(!coverage.passes(1.3));

        // 80_250 * 1.3 = 104_325 -> 4_325 short
        assert!((coverage.shortfall(1.3) - 4_325.0).abs() < 1e-6);
    }
}
