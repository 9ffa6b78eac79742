//! Property tests for the wealth model

use proptest::prelude::*;
use wealth_model::*;

proptest! {
    /// HWM never decreases and drawdown stays in [0, 1] across any equity path
    #[test]
    fn prop_hwm_monotone_drawdown_bounded(
        principal in 500.0f64..1_000_000.0,
        path in prop::collection::vec(-2.0f64..3.0, 1..40),
    ) {
        let mut state = NavState::initial(principal);
        for factor in path {
            let equity = principal * factor;
            let step = nav_step(state, equity).unwrap();

            prop_assert!(step.high_water_mark >= state.high_water_mark);
            prop_assert!(step.drawdown >= 0.0 && step.drawdown <= 1.0);

            state = NavState {
                principal,
                last_equity: step.equity,
                high_water_mark: step.high_water_mark,
            };
        }
    }

    /// Guaranteed settlements never pay below the floor
    #[test]
    fn prop_guarantee_floor_holds(
        principal in 500.0f64..1_000_000.0,
        equity_factor in 0.0f64..2.0,
        hwm_factor in 0.5f64..2.5,
        min_yield in 0.0f64..0.2,
    ) {
        let out = calculate_settlement(SettlementInput {
            principal,
            final_equity: principal * equity_factor,
            high_water_mark: principal * hwm_factor,
            performance_fee_rate: 0.2,
            guarantee_eligible: true,
            min_yield_rate: Some(min_yield),
        }).unwrap();

        let floor = principal * (1.0 + min_yield);
        prop_assert!(out.final_payout >= floor - 1e-6);
        prop_assert!(out.reserve_topup >= 0.0);
        prop_assert!(out.performance_fee >= 0.0);
    }

    /// Performance fee is only charged on profit above the high-water mark
    #[test]
    fn prop_fee_only_above_hwm(
        principal in 500.0f64..1_000_000.0,
        equity_factor in 0.0f64..2.0,
        hwm_factor in 1.0f64..2.5,
    ) {
        let out = calculate_settlement(SettlementInput {
            principal,
            final_equity: principal * equity_factor,
            high_water_mark: principal * hwm_factor,
            performance_fee_rate: 0.2,
            guarantee_eligible: false,
            min_yield_rate: None,
        }).unwrap();

        if equity_factor <= hwm_factor {
            prop_assert_eq!(out.performance_fee, 0.0);
        }
        prop_assert_eq!(out.reserve_topup, 0.0);
    }

    /// Accepting coverage is monotone in the reserve balance
    #[test]
    fn prop_more_reserve_never_hurts(
        balance in 0.0f64..1_000_000.0,
        extra in 0.0f64..1_000_000.0,
        existing in 0.0f64..500_000.0,
        principal in 500.0f64..100_000.0,
        min_yield in 0.0f64..0.2,
        required in 0.5f64..3.0,
    ) {
        let low = project_coverage(balance, existing, principal, Some(min_yield));
        let high = project_coverage(balance + extra, existing, principal, Some(min_yield));
        if low.passes(required) {
            prop_assert!(high.passes(required));
        }
    }

    /// Backoff delay is bounded and non-decreasing in the attempt count
    #[test]
    fn prop_backoff_bounded(
        base in 1u64..600,
        max in 600u64..7_200,
        attempt in 0u32..64,
    ) {
        let policy = RetryPolicy { base_delay_secs: base, max_delay_secs: max, max_attempts: 20 };
        let d = policy.delay_secs(attempt);
        prop_assert!(d <= max);
        prop_assert!(d >= base.min(max));
        prop_assert!(policy.delay_secs(attempt + 1) >= d);
    }
}
