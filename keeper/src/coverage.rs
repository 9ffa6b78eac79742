//! Guarantee coverage guard
//!
//! Gates new guaranteed subscriptions on the reserve balance. Liability is
//! scoped to the product: only subscriptions of the same product in a
//! liability-bearing state count towards `existing_liability`.

use log::warn;
use serde::Serialize;
use std::sync::Arc;
use wealth_model::{project_coverage, round8};

use crate::config::Catalog;
use crate::error::{KeeperError, Result};
use crate::reserve::ledger_balance;
use crate::store::{MemoryStore, Tables};
use crate::types::ManagedProduct;

/// Coverage figures as reported to operators and rejected subscribers.
///
/// An infinite ratio (no liability) serializes as `null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageReport {
    pub product_id: String,
    pub balance: f64,
    pub existing_liability: f64,
    pub additional_liability: f64,
    pub projected_liability: f64,
    pub coverage_ratio: f64,
}

/// Sum of guarantee liability of the product's live subscriptions
pub fn existing_liability(tables: &Tables, product_id: &str) -> f64 {
    tables
        .subscriptions
        .values()
        .filter(|s| s.product_id == product_id)
        .map(|s| s.liability())
        .sum()
}

/// Compute coverage for adding `principal` at `min_yield_rate` to `product_id`.
pub fn coverage_in(
    tables: &Tables,
    product_id: &str,
    principal: f64,
    min_yield_rate: Option<f64>,
) -> CoverageReport {
    let c = project_coverage(
        ledger_balance(tables),
        existing_liability(tables, product_id),
        principal,
        min_yield_rate,
    );
    CoverageReport {
        product_id: product_id.to_string(),
        balance: round8(c.balance),
        existing_liability: round8(c.existing_liability),
        additional_liability: round8(c.additional_liability),
        projected_liability: round8(c.projected_liability),
        coverage_ratio: c.coverage_ratio,
    }
}

/// Coverage check that fails with `ReserveCoverage` below the product minimum.
///
/// Must run inside the same transaction as the subscription insert.
pub fn enforce_coverage(
    tables: &Tables,
    product: &ManagedProduct,
    principal: f64,
    min_yield_rate: Option<f64>,
) -> Result<CoverageReport> {
    let report = coverage_in(tables, &product.id, principal, min_yield_rate);
    if report.coverage_ratio < product.reserve_coverage_min {
        warn!(
            "[CoverageGuard] product {} rejected: ratio {:.4} < {:.4}",
            product.id, report.coverage_ratio, product.reserve_coverage_min
        );
        return Err(KeeperError::ReserveCoverage {
            coverage: report,
            required_ratio: product.reserve_coverage_min,
        });
    }
    Ok(report)
}

pub struct GuaranteeCoverageGuard {
    store: Arc<MemoryStore>,
}

impl GuaranteeCoverageGuard {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// Read-only projection; does not reserve anything.
    pub fn check_coverage(
        &self,
        product_id: &str,
        principal: f64,
        min_yield_rate: Option<f64>,
    ) -> CoverageReport {
        self.store
            .read(|t| coverage_in(t, product_id, principal, min_yield_rate))
    }

    /// Current coverage of every guaranteed product in the catalog
    pub fn product_coverage(&self, catalog: &Catalog) -> Vec<CoverageReport> {
        self.store.read(|t| {
            catalog
                .guaranteed()
                .map(|p| coverage_in(t, &p.id, 0.0, None))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reserve::push_entry;
    use crate::types::*;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn product(min: f64) -> ManagedProduct {
        ManagedProduct {
            id: "guarded".into(),
            slug: "guarded".into(),
            name: "Guarded".into(),
            is_guaranteed: true,
            is_active: true,
            reserve_coverage_min: min,
            performance_fee_rate: 0.2,
            terms: vec![],
        }
    }

    fn subscription(product_id: &str, principal: f64, min_yield: f64, status: SubscriptionStatus) -> ManagedSubscription {
        let now = Utc::now();
        ManagedSubscription {
            id: Uuid::new_v4(),
            wallet_address: "0xabc".into(),
            product_id: product_id.into(),
            term_id: "t".into(),
            principal,
            status,
            high_water_mark: principal,
            current_equity: principal,
            realized_pnl: 0.0,
            guaranteed_min_yield: Some(min_yield),
            performance_fee_rate: 0.2,
            start_at: now,
            end_at: now + Duration::days(30),
            matured_at: None,
            liquidation_started_at: None,
            is_trial: false,
            trial_ends_at: None,
            copy_config_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn seeded_tables() -> Tables {
        let mut t = Tables::default();
        push_entry(&mut t, ReserveEntryType::Deposit, 100_000.0, None, None, Utc::now()).unwrap();
        // 1.6M principal at 5% = 80k liability
        let s = subscription("guarded", 1_600_000.0, 0.05, SubscriptionStatus::Running);
        t.subscriptions.insert(s.id, s);
        t
    }

    #[test]
    fn test_reference_scenario_accept_and_reject() {
        let t = seeded_tables();

        let ok = enforce_coverage(&t, &product(1.2), 5_000.0, Some(0.05)).unwrap();
        assert_eq!(ok.existing_liability, 80_000.0);
        assert_eq!(ok.projected_liability, 80_250.0);
        assert!((ok.coverage_ratio - 1.2461).abs() < 1e-4);

        match enforce_coverage(&t, &product(1.3), 5_000.0, Some(0.05)) {
            Err(KeeperError::ReserveCoverage { coverage, required_ratio }) => {
                assert_eq!(required_ratio, 1.3);
                assert_eq!(coverage.projected_liability, 80_250.0);
            }
            other => panic!("expected coverage error, got {:?}", other),
        }
    }

    #[test]
    fn test_liability_ignores_other_products_and_closed_states() {
        let mut t = seeded_tables();
        let other = subscription("other", 1_000_000.0, 0.1, SubscriptionStatus::Running);
        let settled = subscription("guarded", 1_000_000.0, 0.1, SubscriptionStatus::Settled);
        let cancelled = subscription("guarded", 1_000_000.0, 0.1, SubscriptionStatus::Cancelled);
        for s in [other, settled, cancelled] {
            t.subscriptions.insert(s.id, s);
        }
        assert_eq!(existing_liability(&t, "guarded"), 80_000.0);
    }

    #[test]
    fn test_zero_liability_is_infinite_and_passes() {
        let t = Tables::default();
        let report = enforce_coverage(&t, &product(5.0), 1_000.0, None).unwrap();
        assert!(report.coverage_ratio.is_infinite());

        let json = serde_json::to_value(&report).unwrap();
        assert!(json["coverageRatio"].is_null());
    }
}
