//! Operator health snapshot
//!
//! Composes reserve coverage, liquidation queue state, settlement parity and
//! allocation mapping into one report, and relays operator task actions to
//! the queue. Holds no state of its own.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::allocation::{AllocationMappingMonitor, AllocationReport};
use crate::config::Catalog;
use crate::coverage::{CoverageReport, GuaranteeCoverageGuard};
use crate::error::{KeeperError, Result};
use crate::liquidation::{ActionResult, LiquidationTaskQueue, OperatorAction};
use crate::parity::{ParityReport, SettlementParityAuditor};
use crate::reserve::{ReserveLedger, ReserveSummary};
use crate::stale::flag_stale;
use crate::types::{LiquidationTask, TaskStatus};

pub const MAX_BACKLOG_REPORTED: usize = 20;

/// Raw query parameters; `None` takes the default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthQuery {
    pub window_days: Option<i64>,
    pub liquidation_limit: Option<usize>,
    pub parity_limit: Option<usize>,
    pub stale_mapping_minutes: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthParams {
    pub window_days: i64,
    pub liquidation_limit: usize,
    pub parity_limit: usize,
    pub stale_mapping_minutes: i64,
}

impl Default for HealthParams {
    fn default() -> Self {
        Self {
            window_days: 7,
            liquidation_limit: 200,
            parity_limit: 500,
            stale_mapping_minutes: 30,
        }
    }
}

fn bounded<T>(name: &str, value: Option<T>, default: T, min: T, max: T) -> Result<T>
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(v) if v >= min && v <= max => Ok(v),
        Some(_) => Err(KeeperError::validation(format!(
            "{} must be between {} and {}",
            name, min, max
        ))),
    }
}

impl HealthQuery {
    pub fn resolve(&self) -> Result<HealthParams> {
        let d = HealthParams::default();
        Ok(HealthParams {
            window_days: bounded("windowDays", self.window_days, d.window_days, 1, 90)?,
            liquidation_limit: bounded("liquidationLimit", self.liquidation_limit, d.liquidation_limit, 1, 500)?,
            parity_limit: bounded("parityLimit", self.parity_limit, d.parity_limit, 1, 1_000)?,
            stale_mapping_minutes: bounded(
                "staleMappingMinutes",
                self.stale_mapping_minutes,
                d.stale_mapping_minutes,
                1,
                1_440,
            )?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductCoverage {
    #[serde(flatten)]
    pub report: CoverageReport,
    pub required_ratio: f64,
    /// Existing liability alone already breaches the product minimum
    pub below_minimum: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacklogTask {
    pub task_id: Uuid,
    pub subscription_id: Uuid,
    pub token_id: String,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub error_code: Option<String>,
    pub waiting_minutes: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidationHealth {
    pub by_status: BTreeMap<TaskStatus, usize>,
    pub open_count: usize,
    pub scanned: usize,
    pub due_count: usize,
    pub blocked_count: usize,
    pub backlog_count: usize,
    pub backlog: Vec<BacklogTask>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub generated_at: DateTime<Utc>,
    pub params: HealthParams,
    pub healthy: bool,
    pub reserve: ReserveSummary,
    pub coverage: Vec<ProductCoverage>,
    pub liquidation: LiquidationHealth,
    pub parity: ParityReport,
    pub allocation: AllocationReport,
}

pub struct OpsHealthReporter {
    catalog: Catalog,
    ledger: Arc<ReserveLedger>,
    guard: Arc<GuaranteeCoverageGuard>,
    queue: Arc<LiquidationTaskQueue>,
    auditor: Arc<SettlementParityAuditor>,
    monitor: Arc<AllocationMappingMonitor>,
}

impl OpsHealthReporter {
    pub fn new(
        catalog: Catalog,
        ledger: Arc<ReserveLedger>,
        guard: Arc<GuaranteeCoverageGuard>,
        queue: Arc<LiquidationTaskQueue>,
        auditor: Arc<SettlementParityAuditor>,
        monitor: Arc<AllocationMappingMonitor>,
    ) -> Self {
        Self {
            catalog,
            ledger,
            guard,
            queue,
            auditor,
            monitor,
        }
    }

    pub async fn snapshot(&self, params: HealthParams, now: DateTime<Utc>) -> HealthSnapshot {
        let coverage: Vec<ProductCoverage> = self
            .guard
            .product_coverage(&self.catalog)
            .into_iter()
            .map(|report| {
                let required_ratio = self
                    .catalog
                    .find(&report.product_id)
                    .map_or(1.0, |p| p.reserve_coverage_min);
                ProductCoverage {
                    below_minimum: report.coverage_ratio < required_ratio,
                    report,
                    required_ratio,
                }
            })
            .collect();

        let liquidation = self.liquidation_health(params.liquidation_limit, now);
        let parity = self.auditor.audit(params.window_days, params.parity_limit, now).await;
        let allocation = self.monitor.scan(params.stale_mapping_minutes, now);

        let healthy = coverage.iter().all(|c| !c.below_minimum)
            && liquidation.blocked_count == 0
            && parity.is_clean()
            && allocation.stale_unmapped_count == 0;

        HealthSnapshot {
            generated_at: now,
            params,
            healthy,
            reserve: self.ledger.summary(),
            coverage,
            liquidation,
            parity,
            allocation,
        }
    }

    fn liquidation_health(&self, limit: usize, now: DateTime<Utc>) -> LiquidationHealth {
        let by_status = self.queue.status_counts();
        let open_count: usize = by_status
            .iter()
            .filter(|(s, _)| !s.is_terminal())
            .map(|(_, n)| n)
            .sum();
        let open = self.queue.open_tasks(limit);
        let scanned = open.len();
        let due_count = self.queue.due_count(now);
        let blocked_count = by_status.get(&TaskStatus::Blocked).copied().unwrap_or(0);
        // Blocked tasks are never due, so the two sets are disjoint
        let backlog_count = blocked_count + due_count;

        // Blocked tasks wait since their last change, due tasks since they came due
        let stuck = open
            .into_iter()
            .filter(|t| t.status == TaskStatus::Blocked || t.is_due(now));
        let (backlog, _) = flag_stale(
            stuck,
            |t: &LiquidationTask| match t.status {
                TaskStatus::Blocked => t.updated_at,
                _ => t.next_retry_at.unwrap_or(t.created_at),
            },
            Duration::zero(),
            now,
            MAX_BACKLOG_REPORTED,
        );

        LiquidationHealth {
            by_status,
            open_count,
            scanned,
            due_count,
            blocked_count,
            backlog_count,
            backlog: backlog
                .into_iter()
                .map(|s| BacklogTask {
                    task_id: s.item.id,
                    subscription_id: s.item.subscription_id,
                    token_id: s.item.token_id,
                    status: s.item.status,
                    attempt_count: s.item.attempt_count,
                    error_code: s.item.error_code,
                    waiting_minutes: s.age.num_minutes(),
                })
                .collect(),
        }
    }

    /// Relay an operator action to the liquidation queue.
    pub fn apply_action(
        &self,
        action: &OperatorAction,
        task_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<ActionResult> {
        self.queue.apply_action(action, task_ids, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::MemoryFeeLedger;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use wealth_model::RetryPolicy;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()
    }

    fn reporter(store: Arc<MemoryStore>) -> OpsHealthReporter {
        OpsHealthReporter::new(
            Catalog::default(),
            Arc::new(ReserveLedger::new(store.clone())),
            Arc::new(GuaranteeCoverageGuard::new(store.clone())),
            Arc::new(LiquidationTaskQueue::new(store.clone(), RetryPolicy::default(), 120)),
            Arc::new(SettlementParityAuditor::new(store.clone(), Arc::new(MemoryFeeLedger::new()), 1e-4)),
            Arc::new(AllocationMappingMonitor::new(store)),
        )
    }

    fn task(status: TaskStatus, age_minutes: i64) -> LiquidationTask {
        let at = now() - Duration::minutes(age_minutes);
        LiquidationTask {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            wallet_address: "0xabc".into(),
            token_id: "yes".into(),
            requested_shares: 10.0,
            avg_entry_price: 0.5,
            indicative_price: Some(0.5),
            notional_usd: Some(5.0),
            indicative_price_is_fallback: false,
            status,
            attempt_count: 1,
            last_attempt_at: None,
            next_retry_at: None,
            error_code: None,
            error_message: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn test_backlog_counts_whole_queue_beyond_scan_limit() {
        let store = Arc::new(MemoryStore::new());
        store
            .transact(|t| {
                for i in 0..5 {
                    let blocked = task(TaskStatus::Blocked, 60 + i);
                    t.liquidation_tasks.insert(blocked.id, blocked);
                }
                for i in 0..3 {
                    let pending = task(TaskStatus::Pending, 10 + i);
                    t.liquidation_tasks.insert(pending.id, pending);
                }
                let done = task(TaskStatus::Completed, 5);
                t.liquidation_tasks.insert(done.id, done);
                Ok(())
            })
            .unwrap();

        let params = HealthParams {
            liquidation_limit: 2,
            ..HealthParams::default()
        };
        let snapshot = reporter(store).snapshot(params, now()).await;
        let l = &snapshot.liquidation;
        assert_eq!(l.scanned, 2);
        assert_eq!(l.open_count, 8);
        assert_eq!(l.blocked_count, 5);
        assert_eq!(l.due_count, 3);
        assert_eq!(l.backlog_count, 8);
        assert!(!snapshot.healthy);
    }

    #[test]
    fn test_query_defaults_and_bounds() {
        assert_eq!(HealthQuery::default().resolve().unwrap(), HealthParams::default());

        let q = HealthQuery {
            window_days: Some(90),
            liquidation_limit: Some(1),
            parity_limit: Some(1_000),
            stale_mapping_minutes: Some(1_440),
        };
        let p = q.resolve().unwrap();
        assert_eq!(p.window_days, 90);
        assert_eq!(p.stale_mapping_minutes, 1_440);

        for bad in [
            HealthQuery { window_days: Some(0), ..Default::default() },
            HealthQuery { window_days: Some(91), ..Default::default() },
            HealthQuery { liquidation_limit: Some(501), ..Default::default() },
            HealthQuery { parity_limit: Some(0), ..Default::default() },
            HealthQuery { stale_mapping_minutes: Some(1_441), ..Default::default() },
        ] {
            assert!(matches!(bad.resolve(), Err(KeeperError::Validation(_))));
        }
    }
}
