//! Subscription lifecycle
//!
//! ```text
//! PENDING -> RUNNING -> MATURED -> SETTLED
//!    \          \
//!     +----------+--> CANCELLED
//! ```
//!
//! Creation runs the coverage guard for guaranteed products under the
//! wallet lock and then the product lock. Matured and cancelled
//! subscriptions with open exposure are handed to the liquidation queue and
//! settle once every task for them is terminal.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wealth_model::{
    calculate_settlement, expected_profit_fee, mark_equity, nav_step, round8, NavState,
    SettlementInput,
};

use crate::config::{Catalog, SubscriptionConfig};
use crate::coverage::{enforce_coverage, CoverageReport};
use crate::error::{KeeperError, Result};
use crate::liquidation::{covered_tokens, enqueue_in, PricedPosition};
use crate::lock::{nav_key, product_key, wallet_key, KeyedLocks};
use crate::positions::{apply_fill_in, ExecutionFill};
use crate::price::{best_bid_within, mark_or_fallback, PriceSource};
use crate::reserve::push_entry;
use crate::referral::{apply_referral_bonus_in, register_referral_in};
use crate::store::{MemoryStore, Tables};
use crate::types::*;

/// Snapshots returned per subscription by [`SubscriptionLifecycle::list`]
pub const LISTED_SNAPSHOTS: usize = 30;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubscription {
    pub wallet_address: String,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub product_slug: Option<String>,
    pub term_id: String,
    pub principal: f64,
    #[serde(default)]
    pub accepted_terms: bool,
    #[serde(default)]
    pub copy_config_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Marketing {
    pub trial_applied: bool,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub referral_bonus_applied: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSubscription {
    pub subscription: ManagedSubscription,
    pub marketing: Marketing,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reserve_coverage: Option<CoverageReport>,
}

/// Subscription with its catalog entries, recent NAV and settlement
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    #[serde(flatten)]
    pub subscription: ManagedSubscription,
    pub product: Option<ManagedProduct>,
    pub term: Option<ManagedTerm>,
    pub nav_snapshots: Vec<NavSnapshot>,
    pub settlement: Option<SettlementRecord>,
}

/// Tasks created when a subscription starts liquidating
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidationPlan {
    pub subscription_id: Uuid,
    pub created: Vec<LiquidationTask>,
    pub open_task_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementCycleReport {
    pub matured: usize,
    pub liquidation_tasks_created: usize,
    pub settled: usize,
    pub waiting: usize,
}

pub struct SubscriptionLifecycle {
    store: Arc<MemoryStore>,
    locks: Arc<KeyedLocks>,
    catalog: Catalog,
    config: SubscriptionConfig,
    profit_fee_rate: f64,
    prices: Arc<dyn PriceSource>,
    price_timeout: Duration,
}

impl SubscriptionLifecycle {
    pub fn new(
        store: Arc<MemoryStore>,
        locks: Arc<KeyedLocks>,
        catalog: Catalog,
        config: SubscriptionConfig,
        profit_fee_rate: f64,
        prices: Arc<dyn PriceSource>,
        price_timeout: Duration,
    ) -> Self {
        Self {
            store,
            locks,
            catalog,
            config,
            profit_fee_rate,
            prices,
            price_timeout,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub async fn create(&self, req: NewSubscription, now: DateTime<Utc>) -> Result<CreatedSubscription> {
        if !req.accepted_terms {
            return Err(KeeperError::validation("acceptedTerms must be true"));
        }
        let wallet = normalize_wallet(&req.wallet_address);
        if wallet.is_empty() {
            return Err(KeeperError::validation("walletAddress is required"));
        }
        if !req.principal.is_finite() || req.principal < self.config.min_principal {
            return Err(KeeperError::validation(format!(
                "principal must be at least {}",
                self.config.min_principal
            )));
        }

        let product_ref = req
            .product_id
            .as_deref()
            .or(req.product_slug.as_deref())
            .ok_or_else(|| KeeperError::validation("productId or productSlug is required"))?;
        let product = self
            .catalog
            .find(product_ref)
            .ok_or_else(|| KeeperError::not_found(format!("product {}", product_ref)))?;
        let term = product
            .term(&req.term_id)
            .ok_or_else(|| KeeperError::not_found(format!("term {} of product {}", req.term_id, product.id)))?;
        if !product.is_active {
            return Err(KeeperError::conflict(format!("product {} is not active", product.id)));
        }
        if !term.is_active {
            return Err(KeeperError::conflict(format!("term {} is not active", term.id)));
        }
        if let Some(max) = term.max_subscription_amount {
            if req.principal > max {
                return Err(KeeperError::conflict(format!(
                    "principal exceeds the term limit of {}",
                    max
                )));
            }
        }

        let _wallet_guard = self.locks.lock(wallet_key(&wallet)).await;
        let _product_guard = if product.is_guaranteed {
            Some(self.locks.lock(product_key(&product.id)).await)
        } else {
            None
        };

        let guaranteed_min_yield = product
            .is_guaranteed
            .then(|| term.min_yield_rate.unwrap_or(0.0));
        let principal = round8(req.principal);
        let trial_max = self.config.trial_max_term_days;
        let bonus_days = self.config.referral_bonus_days;

        let created = self.store.transact(|t| {
            let reserve_coverage = if product.is_guaranteed {
                Some(enforce_coverage(t, product, principal, guaranteed_min_yield)?)
            } else {
                None
            };

            let first_for_wallet = !t.subscriptions.values().any(|s| s.wallet_address == wallet);
            let end_at = now + ChronoDuration::days(i64::from(term.duration_days));
            let trial_applied = first_for_wallet && term.duration_days <= trial_max;
            let trial_ends_at = trial_applied.then_some(end_at);

            let subscription = ManagedSubscription {
                id: Uuid::new_v4(),
                wallet_address: wallet.clone(),
                product_id: product.id.clone(),
                term_id: term.id.clone(),
                principal,
                status: SubscriptionStatus::Running,
                high_water_mark: principal,
                current_equity: principal,
                realized_pnl: 0.0,
                guaranteed_min_yield,
                performance_fee_rate: product.fee_rate_for(term),
                start_at: now,
                end_at,
                matured_at: None,
                liquidation_started_at: None,
                is_trial: trial_applied,
                trial_ends_at,
                copy_config_id: req.copy_config_id.clone(),
                created_at: now,
                updated_at: now,
            };
            t.subscriptions.insert(subscription.id, subscription.clone());
            t.nav_snapshots.push(NavSnapshot {
                subscription_id: subscription.id,
                snapshot_at: now,
                nav: 1.0,
                equity: principal,
                period_return: 0.0,
                cumulative_return: 0.0,
                drawdown: 0.0,
                price_source: PriceSourceKind::Initial,
                is_fallback_price: false,
            });

            let referral_bonus_applied = apply_referral_bonus_in(t, &wallet, bonus_days, now).is_some();

            Ok(CreatedSubscription {
                subscription,
                marketing: Marketing {
                    trial_applied,
                    trial_ends_at,
                    referral_bonus_applied,
                },
                reserve_coverage,
            })
        })?;

        info!(
            "[Lifecycle] created subscription {} for {} ({} {} on {}/{})",
            created.subscription.id,
            wallet,
            created.subscription.principal,
            if created.marketing.trial_applied { "trial" } else { "standard" },
            product.id,
            term.id
        );
        Ok(created)
    }

    /// Append a NAV snapshot for a freshly marked equity.
    pub async fn record_snapshot(
        &self,
        subscription_id: Uuid,
        mark_equity: f64,
        price_source: PriceSourceKind,
        is_fallback: bool,
        now: DateTime<Utc>,
    ) -> Result<NavSnapshot> {
        let _guard = self.locks.lock(nav_key(subscription_id)).await;
        self.write_snapshot(subscription_id, mark_equity, price_source, is_fallback, now)
    }

    fn write_snapshot(
        &self,
        subscription_id: Uuid,
        mark_equity: f64,
        price_source: PriceSourceKind,
        is_fallback: bool,
        now: DateTime<Utc>,
    ) -> Result<NavSnapshot> {
        self.store.transact(|t| {
            let sub = t.subscription_mut(subscription_id)?;
            if !matches!(
                sub.status,
                SubscriptionStatus::Pending | SubscriptionStatus::Running | SubscriptionStatus::Matured
            ) {
                return Err(KeeperError::conflict(format!(
                    "cannot snapshot subscription in status {}",
                    sub.status
                )));
            }
            let step = nav_step(
                NavState {
                    principal: sub.principal,
                    last_equity: sub.current_equity,
                    high_water_mark: sub.high_water_mark,
                },
                mark_equity,
            )
            .map_err(|e| KeeperError::validation(format!("invalid NAV input: {:?}", e)))?;

            sub.current_equity = step.equity;
            sub.high_water_mark = step.high_water_mark;
            sub.updated_at = now;

            let snapshot = NavSnapshot {
                subscription_id,
                snapshot_at: now,
                nav: step.nav,
                equity: step.equity,
                period_return: step.period_return,
                cumulative_return: step.cumulative_return,
                drawdown: step.drawdown,
                price_source,
                is_fallback_price: is_fallback,
            };
            t.nav_snapshots.push(snapshot.clone());
            Ok(snapshot)
        })
    }

    /// Mark every running or matured subscription to market and record a
    /// snapshot. Returns how many snapshots were written.
    pub async fn sample_nav(&self, now: DateTime<Utc>) -> usize {
        let ids: Vec<Uuid> = self.store.read(|t| {
            t.subscriptions
                .values()
                .filter(|s| matches!(s.status, SubscriptionStatus::Running | SubscriptionStatus::Matured))
                .map(|s| s.id)
                .collect()
        });

        let mut written = 0;
        for id in ids {
            let _guard = self.locks.lock(nav_key(id)).await;
            let Some((principal, realized, positions)) = self.store.read(|t| {
                t.subscriptions.get(&id).map(|s| {
                    let positions: Vec<SubscriptionPosition> = t.open_positions(id).cloned().collect();
                    (s.principal, s.realized_pnl, positions)
                })
            }) else {
                continue;
            };

            let mut marks = Vec::with_capacity(positions.len());
            let mut any_fallback = false;
            for p in &positions {
                let m = mark_or_fallback(self.prices.as_ref(), &p.token_id, p.avg_entry_price, self.price_timeout).await;
                any_fallback |= m.is_fallback;
                marks.push((p.shares, p.avg_entry_price, m.price));
            }
            let equity = mark_equity(principal, realized, marks);
            let source = if any_fallback {
                PriceSourceKind::EntryFallback
            } else {
                PriceSourceKind::Market
            };

            match self.write_snapshot(id, equity, source, any_fallback, now) {
                Ok(_) => written += 1,
                Err(e) => warn!("[Lifecycle] NAV snapshot for {} failed: {}", id, e),
            }
        }
        debug!("[Lifecycle] wrote {} NAV snapshot(s)", written);
        written
    }

    /// Ingest a fill from the execution feed.
    pub fn apply_fill(&self, fill: &ExecutionFill) -> Result<f64> {
        self.store.transact(|t| apply_fill_in(t, fill))
    }

    /// Move RUNNING subscriptions past their end date to MATURED.
    pub fn mark_matured(&self, now: DateTime<Utc>) -> Result<usize> {
        let count = self.store.transact(|t| {
            let mut count = 0;
            for sub in t.subscriptions.values_mut() {
                if sub.status == SubscriptionStatus::Running && sub.end_at <= now {
                    sub.status = SubscriptionStatus::Matured;
                    sub.matured_at = Some(now);
                    sub.updated_at = now;
                    count += 1;
                }
            }
            Ok(count)
        })?;
        if count > 0 {
            info!("[Lifecycle] {} subscription(s) matured", count);
        }
        Ok(count)
    }

    pub async fn cancel(&self, subscription_id: Uuid, now: DateTime<Utc>) -> Result<ManagedSubscription> {
        let wallet = self
            .store
            .read(|t| t.subscription(subscription_id).map(|s| s.wallet_address.clone()))?;
        let _guard = self.locks.lock(wallet_key(&wallet)).await;

        let (sub, has_exposure) = self.store.transact(|t| {
            let has_exposure = t.open_positions(subscription_id).next().is_some();
            let sub = t.subscription_mut(subscription_id)?;
            if !matches!(sub.status, SubscriptionStatus::Pending | SubscriptionStatus::Running) {
                return Err(KeeperError::conflict(format!(
                    "cannot cancel subscription in status {}",
                    sub.status
                )));
            }
            sub.status = SubscriptionStatus::Cancelled;
            sub.updated_at = now;
            Ok((sub.clone(), has_exposure))
        })?;
        info!("[Lifecycle] cancelled subscription {}", subscription_id);

        if has_exposure {
            self.transition_to_liquidating(subscription_id, now).await?;
        }
        Ok(sub)
    }

    /// Queue one liquidation task per open position not yet covered.
    ///
    /// Idempotent: repeated calls only add tasks for newly uncovered
    /// positions. Stamps `liquidation_started_at` on the first call.
    pub async fn transition_to_liquidating(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<LiquidationPlan> {
        let positions = self.store.read(|t| {
            let sub = t.subscription(subscription_id)?;
            if !matches!(sub.status, SubscriptionStatus::Matured | SubscriptionStatus::Cancelled) {
                return Err(KeeperError::conflict(format!(
                    "cannot liquidate subscription in status {}",
                    sub.status
                )));
            }
            let covered = covered_tokens(t, subscription_id);
            Ok(t.open_positions(subscription_id)
                .filter(|p| !covered.contains(&p.token_id))
                .cloned()
                .collect::<Vec<_>>())
        })?;

        let mut priced = Vec::with_capacity(positions.len());
        for p in positions {
            let (price, is_fallback) =
                match best_bid_within(self.prices.as_ref(), &p.token_id, self.price_timeout).await {
                    Ok(Some(bid)) => (bid, false),
                    Ok(None) => (p.avg_entry_price, true),
                    Err(e) => {
                        debug!("[Lifecycle] indicative price for {} unavailable: {}", p.token_id, e);
                        (p.avg_entry_price, true)
                    }
                };
            priced.push(PricedPosition {
                token_id: p.token_id,
                shares: p.shares,
                avg_entry_price: p.avg_entry_price,
                indicative_price: price,
                is_fallback,
            });
        }

        let plan = self.store.transact(|t| {
            let created = enqueue_in(t, subscription_id, &priced, now)?;
            let sub = t.subscription_mut(subscription_id)?;
            if sub.liquidation_started_at.is_none() {
                sub.liquidation_started_at = Some(now);
                sub.updated_at = now;
            }
            let open_task_count = t
                .tasks_for(subscription_id)
                .filter(|task| !task.status.is_terminal())
                .count();
            Ok(LiquidationPlan {
                subscription_id,
                created,
                open_task_count,
            })
        })?;

        if !plan.created.is_empty() {
            info!(
                "[Lifecycle] subscription {} liquidating: {} task(s) queued",
                subscription_id,
                plan.created.len()
            );
        }
        Ok(plan)
    }

    /// Settle a matured or cancelled subscription whose liquidation is done.
    pub async fn settle(&self, subscription_id: Uuid, now: DateTime<Utc>) -> Result<SettlementRecord> {
        let open = self.store.read(|t| {
            let sub = t.subscription(subscription_id)?;
            check_settleable(t, sub)?;
            Ok(t.open_positions(subscription_id).cloned().collect::<Vec<_>>())
        })?;

        // Positions an operator gave up on are valued at their current mark
        let mut marks = HashMap::new();
        for p in &open {
            let m = mark_or_fallback(self.prices.as_ref(), &p.token_id, p.avg_entry_price, self.price_timeout).await;
            marks.insert(p.token_id.clone(), m.price);
        }

        let profit_fee_rate = self.profit_fee_rate;
        let record = self.store.transact(|t| {
            let sub = t.subscription(subscription_id)?.clone();
            check_settleable(t, &sub)?;

            let unrealized = t.open_positions(subscription_id).map(|p| {
                let mark = marks.get(&p.token_id).copied().unwrap_or(p.avg_entry_price);
                (p.shares, p.avg_entry_price, mark)
            });
            let final_equity = mark_equity(sub.principal, sub.realized_pnl, unrealized.collect::<Vec<_>>());

            let outcome = calculate_settlement(SettlementInput {
                principal: sub.principal,
                final_equity,
                high_water_mark: sub.high_water_mark,
                performance_fee_rate: sub.effective_fee_rate(),
                guarantee_eligible: sub.guaranteed_min_yield.is_some() && sub.matured_at.is_some(),
                min_yield_rate: sub.guaranteed_min_yield,
            })
            .map_err(|e| KeeperError::validation(format!("settlement inputs rejected: {:?}", e)))?;

            let settlement_id = Uuid::new_v4();
            if outcome.reserve_topup > 0.0 {
                push_entry(
                    t,
                    ReserveEntryType::GuaranteePayout,
                    outcome.reserve_topup,
                    Some(subscription_id),
                    Some(format!("guarantee shortfall for settlement {}", settlement_id)),
                    now,
                )?;
            }

            let record = SettlementRecord {
                id: settlement_id,
                subscription_id,
                wallet_address: sub.wallet_address.clone(),
                trade_id: settlement_trade_id(subscription_id, settlement_id),
                gross_pnl: outcome.gross_pnl,
                expected_fee: expected_profit_fee(outcome.gross_pnl, profit_fee_rate),
                actual_fee: None,
                settled_at: now,
                principal: outcome.principal,
                final_equity: outcome.final_equity,
                high_water_mark: outcome.high_water_mark,
                performance_fee: outcome.performance_fee,
                guaranteed_payout: outcome.guaranteed_payout,
                reserve_topup: outcome.reserve_topup,
                final_payout: outcome.final_payout,
            };
            t.settlements.insert(record.id, record.clone());

            let sub = t.subscription_mut(subscription_id)?;
            sub.current_equity = outcome.final_equity;
            sub.high_water_mark = sub.high_water_mark.max(outcome.final_equity);
            if sub.status == SubscriptionStatus::Matured {
                sub.status = SubscriptionStatus::Settled;
            }
            sub.updated_at = now;
            Ok(record)
        })?;

        info!(
            "[Lifecycle] settled {}: payout {} (pnl {}, fee {}, reserve topup {})",
            subscription_id, record.final_payout, record.gross_pnl, record.performance_fee, record.reserve_topup
        );
        Ok(record)
    }

    /// Mature, liquidate and settle whatever is ready.
    pub async fn run_settlement_cycle(&self, now: DateTime<Utc>) -> Result<SettlementCycleReport> {
        let mut report = SettlementCycleReport {
            matured: self.mark_matured(now)?,
            ..Default::default()
        };

        let candidates: Vec<(Uuid, bool)> = self.store.read(|t| {
            t.subscriptions
                .values()
                .filter(|s| matches!(s.status, SubscriptionStatus::Matured | SubscriptionStatus::Cancelled))
                .filter(|s| t.settlement_for(s.id).is_none())
                .map(|s| {
                    let covered = covered_tokens(t, s.id);
                    let uncovered = t.open_positions(s.id).any(|p| !covered.contains(&p.token_id));
                    (s.id, uncovered)
                })
                .collect()
        });

        for (id, uncovered) in candidates {
            if uncovered {
                match self.transition_to_liquidating(id, now).await {
                    Ok(plan) => report.liquidation_tasks_created += plan.created.len(),
                    Err(e) => warn!("[Lifecycle] could not start liquidation for {}: {}", id, e),
                }
                report.waiting += 1;
                continue;
            }
            match self.settle(id, now).await {
                Ok(_) => report.settled += 1,
                Err(KeeperError::Conflict(reason)) => {
                    debug!("[Lifecycle] {} not ready to settle: {}", id, reason);
                    report.waiting += 1;
                }
                Err(e) => warn!("[Lifecycle] settlement of {} failed: {}", id, e),
            }
        }
        Ok(report)
    }

    pub fn register_referral(&self, referee: &str, referrer: &str) -> Result<Referral> {
        let referral = self.store.transact(|t| register_referral_in(t, referee, referrer))?;
        info!(
            "[Lifecycle] registered referral {} -> {}",
            referral.referrer_wallet, referral.referee_wallet
        );
        Ok(referral)
    }

    /// Subscriptions with their product, term, last snapshots and settlement.
    pub fn list(&self, wallet: Option<&str>, status: Option<SubscriptionStatus>) -> Vec<SubscriptionView> {
        let wallet = wallet.map(normalize_wallet);
        self.store.read(|t| {
            let mut subs: Vec<&ManagedSubscription> = t
                .subscriptions
                .values()
                .filter(|s| wallet.as_ref().map_or(true, |w| &s.wallet_address == w))
                .filter(|s| status.map_or(true, |st| s.status == st))
                .collect();
            subs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

            subs.into_iter()
                .map(|s| {
                    let product = self.catalog.find(&s.product_id);
                    let mut nav_snapshots: Vec<NavSnapshot> = t
                        .nav_snapshots
                        .iter()
                        .rev()
                        .filter(|n| n.subscription_id == s.id)
                        .take(LISTED_SNAPSHOTS)
                        .cloned()
                        .collect();
                    nav_snapshots.reverse();
                    SubscriptionView {
                        subscription: s.clone(),
                        product: product.cloned(),
                        term: product.and_then(|p| p.term(&s.term_id)).cloned(),
                        nav_snapshots,
                        settlement: t.settlement_for(s.id).cloned(),
                    }
                })
                .collect()
        })
    }
}

/// Settlement preconditions shared by the pre-check and the commit.
fn check_settleable(t: &Tables, sub: &ManagedSubscription) -> Result<()> {
    if t.settlement_for(sub.id).is_some() {
        return Err(KeeperError::conflict(format!("subscription {} is already settled", sub.id)));
    }
    if !matches!(sub.status, SubscriptionStatus::Matured | SubscriptionStatus::Cancelled) {
        return Err(KeeperError::conflict(format!(
            "cannot settle subscription in status {}",
            sub.status
        )));
    }
    let open_tasks = t.tasks_for(sub.id).filter(|task| !task.status.is_terminal()).count();
    if open_tasks > 0 {
        return Err(KeeperError::conflict(format!(
            "settlement blocked by {} open liquidation task(s)",
            open_tasks
        )));
    }
    let covered = covered_tokens(t, sub.id);
    if t.open_positions(sub.id).any(|p| !covered.contains(&p.token_id)) {
        return Err(KeeperError::conflict("open positions are not queued for liquidation"));
    }
    Ok(())
}
