//! NAV, high-water mark and drawdown tracking
//!
//! Each sampling tick marks the subscription's equity to market and derives
//! one snapshot row from the previous state:
//!
//! ```text
//! period_return     = equity / last_equity - 1
//! cumulative_return = equity / principal - 1
//! high_water_mark   = max(high_water_mark, equity)
//! drawdown          = clamp((high_water_mark - equity) / high_water_mark, 0, 1)
//! nav               = equity / principal
//! ```

use crate::round8;

/// Running NAV state carried on a subscription
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavState {
    pub principal: f64,
    pub last_equity: f64,
    pub high_water_mark: f64,
}

/// One NAV step result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavStep {
    pub nav: f64,
    pub equity: f64,
    pub period_return: f64,
    pub cumulative_return: f64,
    pub high_water_mark: f64,
    pub drawdown: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavError {
    NonFinite,
    NonPositivePrincipal,
}

impl NavState {
    /// State at subscription start: equity and HWM equal principal.
    pub fn initial(principal: f64) -> Self {
        Self {
            principal,
            last_equity: principal,
            high_water_mark: principal,
        }
    }
}

/// Advance NAV state with a freshly marked equity.
pub fn nav_step(state: NavState, mark_equity: f64) -> Result<NavStep, NavError> {
    if !mark_equity.is_finite() || !state.last_equity.is_finite() || !state.high_water_mark.is_finite() {
        return Err(NavError::NonFinite);
    }
    if state.principal <= 0.0 || !state.principal.is_finite() {
        return Err(NavError::NonPositivePrincipal);
    }

    let period_return = if state.last_equity > 0.0 {
        mark_equity / state.last_equity - 1.0
    } else {
        0.0
    };
    let high_water_mark = state.high_water_mark.max(mark_equity);
    let drawdown = if high_water_mark > 0.0 {
        ((high_water_mark - mark_equity) / high_water_mark).clamp(0.0, 1.0)
    } else {
        0.0
    };

    Ok(NavStep {
        nav: round8(mark_equity / state.principal),
        equity: round8(mark_equity),
        period_return: round8(period_return),
        cumulative_return: round8(mark_equity / state.principal - 1.0),
        high_water_mark,
        drawdown: round8(drawdown),
    })
}

/// Mark-to-market equity of a subscription.
///
/// `positions` yields `(shares, avg_entry_price, mark_price)`.
pub fn mark_equity<I>(principal: f64, realized_pnl: f64, positions: I) -> f64
where
    I: IntoIterator<Item = (f64, f64, f64)>,
{
    let unrealized: f64 = positions
        .into_iter()
        .map(|(shares, avg_entry, mark)| shares * (mark - avg_entry))
        .sum();
    principal + realized_pnl + unrealized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let s = NavState::initial(1_000.0);
        let step = nav_step(s, 1_000.0).unwrap();
        assert_eq!(step.nav, 1.0);
        assert_eq!(step.period_return, 0.0);
        assert_eq!(step.cumulative_return, 0.0);
        assert_eq!(step.drawdown, 0.0);
    }

    #[test]
    fn test_gain_raises_hwm() {
        let s = NavState::initial(1_000.0);
        let step = nav_step(s, 1_100.0).unwrap();
        assert_eq!(step.high_water_mark, 1_100.0);
        assert_eq!(step.nav, 1.1);
        assert_eq!(step.drawdown, 0.0);
        assert!((step.period_return - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_drawdown_from_hwm() {
        let s = NavState {
            principal: 1_000.0,
            last_equity: 1_200.0,
            high_water_mark: 1_200.0,
        };
        let step = nav_step(s, 900.0).unwrap();
        assert_eq!(step.high_water_mark, 1_200.0);
        assert_eq!(step.drawdown, 0.25);
        assert!((step.cumulative_return + 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_total_loss_clamps_drawdown() {
        let s = NavState::initial(1_000.0);
        let step = nav_step(s, -50.0).unwrap();
        assert_eq!(step.drawdown, 1.0);
    }

    #[test]
    fn test_rejects_non_finite() {
        let s = NavState::initial(1_000.0);
        assert_eq!(nav_step(s, f64::NAN), Err(NavError::NonFinite));
        assert_eq!(nav_step(NavState::initial(0.0), 10.0), Err(NavError::NonPositivePrincipal));
    }

    #[test]
    fn test_mark_equity() {
        // 100 shares bought at 0.40, now 0.55; 10 realized
        let eq = mark_equity(1_000.0, 10.0, vec![(100.0, 0.40, 0.55)]);
        assert!((eq - 1_025.0).abs() < 1e-9);
        assert_eq!(mark_equity(1_000.0, 0.0, Vec::new()), 1_000.0);
    }
}
