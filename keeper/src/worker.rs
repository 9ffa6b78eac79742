//! Liquidation worker
//!
//! Claims due tasks, sells the remaining shares at the current best bid
//! through a [`LiquidationExecutor`], and reports each outcome back to the
//! queue. Runs are serialized per worker: a tick that fires while a cycle is
//! still running is skipped.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ExecutionError, KeeperError};
use crate::external::{LiquidationExecutor, SellOrder};
use crate::liquidation::{AttemptOutcome, LiquidationTaskQueue};
use crate::price::{best_bid_within, PriceSource};
use crate::store::MemoryStore;
use crate::types::{LiquidationTask, TaskStatus, OPEN_SHARES_EPSILON};

pub const SUBSCRIPTION_NOT_FOUND: &str = "SUBSCRIPTION_NOT_FOUND";
pub const SUBSCRIPTION_NOT_LIQUIDATING: &str = "SUBSCRIPTION_NOT_LIQUIDATING";
pub const MISSING_COPY_CONFIG: &str = "MISSING_COPY_CONFIG";
pub const NO_BID_LIQUIDITY: &str = "NO_BID_LIQUIDITY";
pub const NOTIONAL_BELOW_MIN_ORDER: &str = "NOTIONAL_BELOW_MIN_ORDER";
pub const UNHANDLED_EXECUTION_ERROR: &str = "UNHANDLED_EXECUTION_ERROR";

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub min_notional_usd: f64,
    pub price_timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub skipped: bool,
    pub claimed: usize,
    pub completed: usize,
    pub retrying: usize,
    pub blocked: usize,
    pub failed: usize,
}

impl CycleReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    fn count(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Retrying | TaskStatus::Pending => self.retrying += 1,
            TaskStatus::Blocked => self.blocked += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }
}

/// Clears the running flag when a cycle ends, is dropped or panics
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct LiquidationWorker {
    store: Arc<MemoryStore>,
    queue: Arc<LiquidationTaskQueue>,
    executor: Arc<dyn LiquidationExecutor>,
    prices: Arc<dyn PriceSource>,
    settings: WorkerSettings,
    running: AtomicBool,
}

impl LiquidationWorker {
    pub fn new(
        store: Arc<MemoryStore>,
        queue: Arc<LiquidationTaskQueue>,
        executor: Arc<dyn LiquidationExecutor>,
        prices: Arc<dyn PriceSource>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            queue,
            executor,
            prices,
            settings,
            running: AtomicBool::new(false),
        }
    }

    /// Process one batch of due tasks.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("[LiquidationWorker] previous cycle still running, skipping");
            return CycleReport::skipped();
        }
        let _guard = CycleGuard(&self.running);
        self.process_batch(now).await
    }

    async fn process_batch(&self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();
        let claimed = match self.queue.claim_due(now, self.settings.batch_size) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("[LiquidationWorker] claim failed: {}", e);
                return report;
            }
        };
        report.claimed = claimed.len();
        if claimed.is_empty() {
            return report;
        }

        let statuses: Vec<Option<TaskStatus>> = stream::iter(claimed)
            .map(|task| self.process_task(task, now))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;
        for status in statuses.into_iter().flatten() {
            report.count(status);
        }

        info!(
            "[LiquidationWorker] cycle: {} claimed, {} completed, {} retrying, {} blocked, {} failed",
            report.claimed, report.completed, report.retrying, report.blocked, report.failed
        );
        report
    }

    async fn process_task(&self, task: LiquidationTask, now: DateTime<Utc>) -> Option<TaskStatus> {
        let (outcome, sold) = match self.attempt(&task).await {
            Ok(result) => result,
            Err(e) => (
                AttemptOutcome::Failed(ExecutionError::transient(UNHANDLED_EXECUTION_ERROR, e.to_string())),
                None,
            ),
        };
        match self.queue.record_attempt(task.id, outcome, sold, now) {
            Ok(updated) => Some(updated.status),
            Err(e) => {
                warn!("[LiquidationWorker] could not record attempt for {}: {}", task.id, e);
                None
            }
        }
    }

    /// Run one sell attempt; returns the outcome and the `(shares, price)`
    /// actually sold.
    async fn attempt(
        &self,
        task: &LiquidationTask,
    ) -> Result<(AttemptOutcome, Option<(f64, f64)>), KeeperError> {
        let context = self.store.read(|t| {
            t.subscriptions.get(&task.subscription_id).map(|sub| {
                let held = t
                    .positions
                    .iter()
                    .find(|p| p.subscription_id == sub.id && p.token_id == task.token_id)
                    .map_or(0.0, |p| p.shares);
                (sub.liquidation_started_at.is_some(), sub.copy_config_id.clone(), held)
            })
        });
        let Some((liquidating, copy_config_id, held)) = context else {
            return Ok((
                AttemptOutcome::Abandoned {
                    code: SUBSCRIPTION_NOT_FOUND.to_string(),
                    message: format!("subscription {} no longer exists", task.subscription_id),
                },
                None,
            ));
        };
        if !liquidating {
            return Ok((
                terminal(SUBSCRIPTION_NOT_LIQUIDATING, "subscription is not in liquidation"),
                None,
            ));
        }
        let Some(copy_config_id) = copy_config_id else {
            return Ok((
                terminal(MISSING_COPY_CONFIG, "subscription has no execution account"),
                None,
            ));
        };

        let shares = held.min(task.requested_shares);
        if shares <= OPEN_SHARES_EPSILON {
            return Ok((AttemptOutcome::Completed, None));
        }

        let bid = match best_bid_within(self.prices.as_ref(), &task.token_id, self.settings.price_timeout).await {
            Ok(Some(bid)) if bid > 0.0 => bid,
            Ok(_) => {
                return Ok((transient(NO_BID_LIQUIDITY, "no bid liquidity for token"), None));
            }
            Err(e) => {
                return Ok((transient(NO_BID_LIQUIDITY, e.to_string()), None));
            }
        };

        let notional = shares * bid;
        if notional < self.settings.min_notional_usd {
            return Ok((
                terminal(
                    NOTIONAL_BELOW_MIN_ORDER,
                    format!(
                        "notional {:.4} below minimum order {:.2}",
                        notional, self.settings.min_notional_usd
                    ),
                ),
                None,
            ));
        }

        let order = SellOrder {
            task_id: task.id,
            subscription_id: task.subscription_id,
            wallet_address: task.wallet_address.clone(),
            copy_config_id,
            token_id: task.token_id.clone(),
            shares,
            limit_price: bid,
        };
        let fill = match self.executor.sell(&order).await {
            Ok(fill) => fill,
            Err(e) => return Ok((AttemptOutcome::Failed(e), None)),
        };

        let filled = fill.filled_shares.clamp(0.0, shares);
        let sold = (filled > 0.0).then_some((filled, fill.avg_price));
        let remaining = shares - filled;
        if remaining <= OPEN_SHARES_EPSILON {
            Ok((AttemptOutcome::Completed, sold))
        } else {
            Ok((AttemptOutcome::Partial { remaining_shares: remaining }, sold))
        }
    }
}

fn transient(code: &str, message: impl Into<String>) -> AttemptOutcome {
    AttemptOutcome::Failed(ExecutionError::transient(code, message))
}

fn terminal(code: &str, message: impl Into<String>) -> AttemptOutcome {
    AttemptOutcome::Failed(ExecutionError::terminal(code, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{Fill, PaperExecutor};
    use crate::liquidation::{enqueue_in, PricedPosition};
    use crate::price::StaticPriceSource;
    use crate::types::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::collections::HashMap;
    use uuid::Uuid;
    use wealth_model::RetryPolicy;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()
    }

    /// Store with one liquidating subscription holding `shares` of "yes"
    /// and a queued task for it.
    fn seeded(shares: f64, copy_config: Option<&str>) -> (Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let sub_id = store
            .transact(|t| {
                let sub = ManagedSubscription {
                    id: Uuid::new_v4(),
                    wallet_address: "0xabc".into(),
                    product_id: "p".into(),
                    term_id: "t".into(),
                    principal: 1_000.0,
                    status: SubscriptionStatus::Matured,
                    high_water_mark: 1_000.0,
                    current_equity: 1_000.0,
                    realized_pnl: 0.0,
                    guaranteed_min_yield: None,
                    performance_fee_rate: 0.2,
                    start_at: t0(),
                    end_at: t0(),
                    matured_at: Some(t0()),
                    liquidation_started_at: Some(t0()),
                    is_trial: false,
                    trial_ends_at: None,
                    copy_config_id: copy_config.map(str::to_string),
                    created_at: t0(),
                    updated_at: t0(),
                };
                let id = sub.id;
                t.subscriptions.insert(id, sub);
                t.positions.push(SubscriptionPosition {
                    subscription_id: id,
                    token_id: "yes".into(),
                    shares,
                    avg_entry_price: 0.5,
                });
                enqueue_in(
                    t,
                    id,
                    &[PricedPosition {
                        token_id: "yes".into(),
                        shares,
                        avg_entry_price: 0.5,
                        indicative_price: 0.6,
                        is_fallback: false,
                    }],
                    t0(),
                )?;
                Ok(id)
            })
            .unwrap();
        (store, sub_id)
    }

    fn worker(
        store: Arc<MemoryStore>,
        executor: Arc<dyn LiquidationExecutor>,
        bid: Option<f64>,
        max_attempts: u32,
    ) -> LiquidationWorker {
        let policy = RetryPolicy {
            max_attempts,
            ..RetryPolicy::default()
        };
        let queue = Arc::new(LiquidationTaskQueue::new(store.clone(), policy, 120));
        let marks: HashMap<String, f64> = bid.map(|b| ("yes".to_string(), b)).into_iter().collect();
        LiquidationWorker::new(
            store,
            queue,
            executor,
            Arc::new(StaticPriceSource::new(marks)),
            WorkerSettings {
                batch_size: 10,
                concurrency: 4,
                min_notional_usd: 1.0,
                price_timeout: Duration::from_millis(200),
            },
        )
    }

    fn only_task(store: &MemoryStore) -> LiquidationTask {
        store.read(|t| t.liquidation_tasks.values().next().cloned()).unwrap()
    }

    /// Fills a fixed fraction of every order
    struct HalfFill;

    #[async_trait]
    impl LiquidationExecutor for HalfFill {
        async fn sell(&self, order: &SellOrder) -> Result<Fill, ExecutionError> {
            Ok(Fill {
                filled_shares: order.shares / 2.0,
                avg_price: order.limit_price,
            })
        }
    }

    #[tokio::test]
    async fn test_full_fill_completes_and_realizes() {
        let (store, sub_id) = seeded(100.0, Some("copy-1"));
        let w = worker(store.clone(), Arc::new(PaperExecutor), Some(0.7), 20);

        let report = w.run_cycle(t0()).await;
        assert_eq!(report.claimed, 1);
        assert_eq!(report.completed, 1);

        assert_eq!(only_task(&store).status, TaskStatus::Completed);
        let realized = store.read(|t| t.subscriptions[&sub_id].realized_pnl);
        assert_eq!(realized, 20.0);
        assert!(store.read(|t| t.open_positions(sub_id).next().is_none()));
    }

    #[tokio::test]
    async fn test_partial_fill_requeues_remaining() {
        let (store, _) = seeded(100.0, Some("copy-1"));
        let w = worker(store.clone(), Arc::new(HalfFill), Some(0.7), 20);

        w.run_cycle(t0()).await;
        let task = only_task(&store);
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.requested_shares, 50.0);
        assert_eq!(task.next_retry_at, Some(t0() + ChronoDuration::seconds(120)));
    }

    #[tokio::test]
    async fn test_no_bid_backs_off_then_blocks() {
        let (store, _) = seeded(100.0, Some("copy-1"));
        let w = worker(store.clone(), Arc::new(PaperExecutor), None, 3);

        let mut now = t0();
        for _ in 0..3 {
            w.run_cycle(now).await;
            let task = only_task(&store);
            assert_eq!(task.error_code.as_deref(), Some(NO_BID_LIQUIDITY));
            now = task.next_retry_at.unwrap_or(now);
        }
        let task = only_task(&store);
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.attempt_count, 3);
        assert!(task.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_missing_copy_config_blocks() {
        let (store, _) = seeded(100.0, None);
        let w = worker(store.clone(), Arc::new(PaperExecutor), Some(0.7), 20);

        let report = w.run_cycle(t0()).await;
        assert_eq!(report.blocked, 1);
        assert_eq!(only_task(&store).error_code.as_deref(), Some(MISSING_COPY_CONFIG));
    }

    #[tokio::test]
    async fn test_dust_notional_blocks() {
        let (store, _) = seeded(1.0, Some("copy-1"));
        let w = worker(store.clone(), Arc::new(PaperExecutor), Some(0.5), 20);

        w.run_cycle(t0()).await;
        let task = only_task(&store);
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.error_code.as_deref(), Some(NOTIONAL_BELOW_MIN_ORDER));
    }

    #[tokio::test]
    async fn test_vanished_subscription_fails_task() {
        let (store, sub_id) = seeded(100.0, Some("copy-1"));
        store
            .transact(|t| {
                t.subscriptions.remove(&sub_id);
                Ok(())
            })
            .unwrap();
        let w = worker(store.clone(), Arc::new(PaperExecutor), Some(0.7), 20);

        let report = w.run_cycle(t0()).await;
        assert_eq!(report.failed, 1);
        assert_eq!(only_task(&store).error_code.as_deref(), Some(SUBSCRIPTION_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_nothing_due_is_a_quiet_cycle() {
        let (store, _) = seeded(100.0, Some("copy-1"));
        let w = worker(store.clone(), Arc::new(PaperExecutor), Some(0.7), 20);
        w.run_cycle(t0()).await;

        let report = w.run_cycle(t0()).await;
        assert_eq!(report, CycleReport::default());
    }

    /// Never answers
    struct StuckVenue;

    #[async_trait]
    impl LiquidationExecutor for StuckVenue {
        async fn sell(&self, _order: &SellOrder) -> Result<Fill, ExecutionError> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_dropped_cycle_releases_running_flag() {
        let (store, _) = seeded(100.0, Some("copy-1"));
        let w = worker(store.clone(), Arc::new(StuckVenue), Some(0.7), 20);

        let abandoned = tokio::time::timeout(Duration::from_millis(50), w.run_cycle(t0())).await;
        assert!(abandoned.is_err());
        assert!(!w.running.load(Ordering::Acquire));

        // The task is still leased, but the next cycle runs instead of skipping
        let report = w.run_cycle(t0()).await;
        assert!(!report.skipped);
        assert_eq!(report.claimed, 0);
    }
}
