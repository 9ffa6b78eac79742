//! Settlement payout for a managed subscription
//!
//! # Formula
//! ```text
//! gross_pnl            = final_equity - principal
//! hwm                  = max(high_water_mark, principal)
//! hwm_eligible_profit  = max(0, final_equity - hwm)
//! performance_fee      = hwm_eligible_profit * performance_fee_rate
//! pre_guarantee_payout = principal + gross_pnl - performance_fee
//! guaranteed_payout    = principal * (1 + min_yield_rate)        (guaranteed only)
//! reserve_topup        = max(0, guaranteed_payout - pre_guarantee_payout)
//! final_payout         = pre_guarantee_payout + reserve_topup
//! ```
//!
//! The reserve top-up is what the reserve fund pays out to bring the
//! subscriber up to the guaranteed floor.

use crate::round8;

/// Inputs for a settlement calculation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettlementInput {
    pub principal: f64,
    pub final_equity: f64,
    pub high_water_mark: f64,
    pub performance_fee_rate: f64,
    /// Apply the guarantee floor (guaranteed product that reached maturity)
    pub guarantee_eligible: bool,
    pub min_yield_rate: Option<f64>,
}

/// Full payout breakdown
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettlementOutcome {
    pub principal: f64,
    pub final_equity: f64,
    pub gross_pnl: f64,
    pub high_water_mark: f64,
    pub hwm_eligible_profit: f64,
    pub performance_fee_rate: f64,
    pub performance_fee: f64,
    pub pre_guarantee_payout: f64,
    pub guaranteed_payout: Option<f64>,
    pub reserve_topup: f64,
    pub final_payout: f64,
}

/// Error types for settlement calculation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementError {
    /// An input was NaN or infinite
    NonFinite,
    /// Principal must be strictly positive
    NonPositivePrincipal,
    /// Fee rate outside [0, 1]
    FeeRateOutOfRange,
}

/// Compute the payout breakdown for a subscription exit.
pub fn calculate_settlement(input: SettlementInput) -> Result<SettlementOutcome, SettlementError> {
    let finite = [
        input.principal,
        input.final_equity,
        input.high_water_mark,
        input.performance_fee_rate,
        input.min_yield_rate.unwrap_or(0.0),
    ]
    .iter()
    .all(|v| v.is_finite());
    if !finite {
        return Err(SettlementError::NonFinite);
    }
    if input.principal <= 0.0 {
        return Err(SettlementError::NonPositivePrincipal);
    }
    if !(0.0..=1.0).contains(&input.performance_fee_rate) {
        return Err(SettlementError::FeeRateOutOfRange);
    }

    let principal = input.principal;
    let final_equity = input.final_equity;
    let high_water_mark = input.high_water_mark.max(principal);

    let gross_pnl = final_equity - principal;
    let hwm_eligible_profit = (final_equity - high_water_mark).max(0.0);
    let performance_fee = hwm_eligible_profit * input.performance_fee_rate;
    let pre_guarantee_payout = principal + gross_pnl - performance_fee;

    let (guaranteed_payout, reserve_topup) = if input.guarantee_eligible {
        let floor = principal * (1.0 + input.min_yield_rate.unwrap_or(0.0));
        (Some(round8(floor)), (floor - pre_guarantee_payout).max(0.0))
    } else {
        (None, 0.0)
    };

    Ok(SettlementOutcome {
        principal,
        final_equity: round8(final_equity),
        gross_pnl: round8(gross_pnl),
        high_water_mark: round8(high_water_mark),
        hwm_eligible_profit: round8(hwm_eligible_profit),
        performance_fee_rate: input.performance_fee_rate,
        performance_fee: round8(performance_fee),
        pre_guarantee_payout: round8(pre_guarantee_payout),
        guaranteed_payout,
        reserve_topup: round8(reserve_topup),
        final_payout: round8(pre_guarantee_payout + reserve_topup),
    })
}

/// Profit fee that the commission ledger is expected to post for a settlement.
///
/// Losses and break-even exits owe nothing.
#[inline]
pub fn expected_profit_fee(gross_pnl: f64, profit_fee_rate: f64) -> f64 {
    if gross_pnl <= 0.0 {
        return 0.0;
    }
    round8(gross_pnl * profit_fee_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(final_equity: f64, hwm: f64) -> SettlementInput {
        SettlementInput {
            principal: 10_000.0,
            final_equity,
            high_water_mark: hwm,
            performance_fee_rate: 0.2,
            guarantee_eligible: false,
            min_yield_rate: None,
        }
    }

    #[test]
    fn test_profit_above_hwm_pays_fee() {
        let out = calculate_settlement(input(12_000.0, 11_000.0)).unwrap();
        assert_eq!(out.gross_pnl, 2_000.0);
        assert_eq!(out.hwm_eligible_profit, 1_000.0);
        assert_eq!(out.performance_fee, 200.0);
        assert_eq!(out.final_payout, 11_800.0);
        assert_eq!(out.reserve_topup, 0.0);
        assert_eq!(out.guaranteed_payout, None);
    }

    #[test]
    fn test_profit_below_hwm_pays_no_fee() {
        let out = calculate_settlement(input(10_500.0, 11_000.0)).unwrap();
        assert_eq!(out.performance_fee, 0.0);
        assert_eq!(out.final_payout, 10_500.0);
    }

    #[test]
    fn test_hwm_never_below_principal() {
        // A stale HWM below principal is lifted to principal
        let out = calculate_settlement(input(10_400.0, 9_000.0)).unwrap();
        assert_eq!(out.high_water_mark, 10_000.0);
        assert_eq!(out.hwm_eligible_profit, 400.0);
    }

    #[test]
    fn test_guarantee_floor_topup() {
        let mut i = input(9_000.0, 10_000.0);
        i.guarantee_eligible = true;
        i.min_yield_rate = Some(0.05);

        let out = calculate_settlement(i).unwrap();
        assert_eq!(out.guaranteed_payout, Some(10_500.0));
        assert_eq!(out.pre_guarantee_payout, 9_000.0);
        assert_eq!(out.reserve_topup, 1_500.0);
        assert_eq!(out.final_payout, 10_500.0);
    }

    #[test]
    fn test_guarantee_not_needed_when_above_floor() {
        let mut i = input(11_000.0, 11_000.0);
        i.guarantee_eligible = true;
        i.min_yield_rate = Some(0.05);

        let out = calculate_settlement(i).unwrap();
        assert_eq!(out.reserve_topup, 0.0);
        assert_eq!(out.final_payout, 11_000.0);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let mut i = input(f64::NAN, 10_000.0);
        assert_eq!(calculate_settlement(i), Err(SettlementError::NonFinite));

        i = input(10_000.0, 10_000.0);
        i.principal = 0.0;
        assert_eq!(calculate_settlement(i), Err(SettlementError::NonPositivePrincipal));

        i = input(10_000.0, 10_000.0);
        i.performance_fee_rate = 1.5;
        assert_eq!(calculate_settlement(i), Err(SettlementError::FeeRateOutOfRange));
    }

    #[test]
    fn test_expected_profit_fee() {
        assert_eq!(expected_profit_fee(1_000.0, 0.2), 200.0);
        assert_eq!(expected_profit_fee(0.0, 0.2), 0.0);
        assert_eq!(expected_profit_fee(-50.0, 0.2), 0.0);
    }
}
