//! Liquidation task queue
//!
//! One task per open position of a liquidating subscription. Workers claim
//! due tasks under a processing lease, report an [`AttemptOutcome`], and the
//! queue moves the task through
//!
//! ```text
//! PENDING -> claim -> COMPLETED
//!                  -> RETRYING (backoff) -> claim ... -> BLOCKED (attempts exhausted)
//! BLOCKED -> operator -> RETRYING | PENDING | FAILED
//! ```
//!
//! COMPLETED and FAILED are terminal.

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;
use wealth_model::{round8, RetryPolicy};

use crate::error::{ExecutionError, KeeperError, Result};
use crate::positions::{apply_fill_in, ExecutionFill, Side};
use crate::store::{MemoryStore, Tables};
use crate::types::*;

pub const EXECUTING_CODE: &str = "LIQUIDATION_EXECUTING";
pub const PARTIAL_RETRY_CODE: &str = "PARTIAL_LIQUIDATION_RETRY";
pub const MANUAL_RETRY_CODE: &str = "MANUAL_RETRY";
pub const MANUAL_FAIL_CODE: &str = "MANUAL_FAIL";

pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_LIMIT: usize = 200;
pub const MAX_ACTION_TASK_IDS: usize = 100;
pub const MAX_RETRY_DELAY_SECS: i64 = 24 * 60 * 60;
pub const MAX_REASON_CHARS: usize = 240;

/// What a worker observed for one claimed task
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The position is fully closed
    Completed,
    /// Some shares were sold; the rest stays queued
    Partial { remaining_shares: f64 },
    /// The attempt failed; transient failures back off, terminal ones block
    Failed(ExecutionError),
    /// The task can never run (its subscription is gone)
    Abandoned { code: String, message: String },
}

/// Operator intent on a set of tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum OperatorAction {
    Retry {
        #[serde(default, rename = "delaySeconds")]
        delay_seconds: i64,
        #[serde(default)]
        reason: Option<String>,
    },
    Requeue,
    Fail {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl OperatorAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Retry { .. } => "retry",
            Self::Requeue => "requeue",
            Self::Fail { .. } => "fail",
        }
    }

    fn validate(&self) -> Result<()> {
        let reason = match self {
            Self::Retry { delay_seconds, reason } => {
                if !(0..=MAX_RETRY_DELAY_SECS).contains(delay_seconds) {
                    return Err(KeeperError::validation(format!(
                        "delaySeconds must be between 0 and {}",
                        MAX_RETRY_DELAY_SECS
                    )));
                }
                reason.as_deref()
            }
            Self::Requeue => None,
            Self::Fail { reason } => reason.as_deref(),
        };
        match reason {
            Some(r) if r.trim().chars().count() > MAX_REASON_CHARS => Err(KeeperError::validation(
                format!("reason must be at most {} characters", MAX_REASON_CHARS),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub action: &'static str,
    pub requested_count: usize,
    pub updated_count: usize,
    pub tasks: Vec<LiquidationTask>,
}

/// Filters for the operator task listing
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub statuses: Option<Vec<TaskStatus>>,
    pub subscription_id: Option<Uuid>,
    pub wallet_address: Option<String>,
    pub due_only: bool,
    pub limit: Option<usize>,
}

/// Task plus its derived due flag
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    #[serde(flatten)]
    pub task: LiquidationTask,
    pub is_due: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub total_count: usize,
    pub due_count: usize,
    pub by_status: BTreeMap<TaskStatus, usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListing {
    pub tasks: Vec<TaskView>,
    pub summary: TaskSummary,
}

/// Open position with the price it was queued at
#[derive(Debug, Clone, PartialEq)]
pub struct PricedPosition {
    pub token_id: String,
    pub shares: f64,
    pub avg_entry_price: f64,
    pub indicative_price: f64,
    pub is_fallback: bool,
}

/// Parse a comma-separated status filter; unknown names are rejected.
pub fn parse_status_filter(raw: &str) -> Result<Option<Vec<TaskStatus>>> {
    let mut statuses = BTreeSet::new();
    let mut invalid = Vec::new();
    for token in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match token.parse::<TaskStatus>() {
            Ok(s) => {
                statuses.insert(s);
            }
            Err(_) => invalid.push(token.to_ascii_uppercase()),
        }
    }
    if !invalid.is_empty() {
        return Err(KeeperError::validation(format!(
            "Invalid liquidation status: {}",
            invalid.join(", ")
        )));
    }
    Ok((!statuses.is_empty()).then(|| statuses.into_iter().collect()))
}

/// Tokens of a subscription already owned by a task.
///
/// Open and operator-failed tasks own their token; a completed task does
/// not, so exposure rebuilt after completion is queued again.
pub fn covered_tokens(tables: &Tables, subscription_id: Uuid) -> BTreeSet<String> {
    tables
        .tasks_for(subscription_id)
        .filter(|t| t.status != TaskStatus::Completed)
        .map(|t| t.token_id.clone())
        .collect()
}

/// Create tasks for open positions no task covers yet.
pub fn enqueue_in(
    tables: &mut Tables,
    subscription_id: Uuid,
    positions: &[PricedPosition],
    now: DateTime<Utc>,
) -> Result<Vec<LiquidationTask>> {
    let wallet = tables.subscription(subscription_id)?.wallet_address.clone();
    let covered = covered_tokens(tables, subscription_id);

    let mut created = Vec::new();
    for pos in positions {
        if pos.shares <= OPEN_SHARES_EPSILON || covered.contains(&pos.token_id) {
            continue;
        }
        let task = LiquidationTask {
            id: Uuid::new_v4(),
            subscription_id,
            wallet_address: wallet.clone(),
            token_id: pos.token_id.clone(),
            requested_shares: pos.shares,
            avg_entry_price: pos.avg_entry_price,
            indicative_price: Some(pos.indicative_price),
            notional_usd: Some(round8(pos.shares * pos.indicative_price)),
            indicative_price_is_fallback: pos.is_fallback,
            status: TaskStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            next_retry_at: None,
            error_code: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        tables.liquidation_tasks.insert(task.id, task.clone());
        created.push(task);
    }
    Ok(created)
}

/// Apply an attempt outcome to a claimed task.
pub fn apply_outcome(
    task: &mut LiquidationTask,
    outcome: AttemptOutcome,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) {
    task.updated_at = now;
    match outcome {
        AttemptOutcome::Completed => {
            task.status = TaskStatus::Completed;
            task.next_retry_at = None;
            task.error_code = None;
            task.error_message = None;
        }
        AttemptOutcome::Partial { remaining_shares } => {
            task.requested_shares = round8(remaining_shares);
            let message = format!("{} shares remain after partial fill", task.requested_shares);
            schedule_retry(task, PARTIAL_RETRY_CODE, message, policy, now);
        }
        AttemptOutcome::Failed(ExecutionError::Transient { code, message }) => {
            schedule_retry(task, &code, message, policy, now);
        }
        AttemptOutcome::Failed(ExecutionError::Terminal { code, message }) => {
            task.status = TaskStatus::Blocked;
            task.next_retry_at = None;
            task.error_code = Some(code);
            task.error_message = Some(message);
        }
        AttemptOutcome::Abandoned { code, message } => {
            task.status = TaskStatus::Failed;
            task.next_retry_at = None;
            task.error_code = Some(code);
            task.error_message = Some(message);
        }
    }
}

fn schedule_retry(
    task: &mut LiquidationTask,
    code: &str,
    message: String,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) {
    task.error_code = Some(code.to_string());
    task.error_message = Some(message);
    if policy.exhausted(task.attempt_count) {
        task.status = TaskStatus::Blocked;
        task.next_retry_at = None;
    } else {
        task.status = TaskStatus::Retrying;
        let delay = policy.delay_secs(task.attempt_count);
        task.next_retry_at = Some(now + Duration::seconds(delay as i64));
    }
}

/// Apply an operator action to one task; returns whether it changed.
///
/// Tasks a worker is executing under an active lease are left alone.
pub fn apply_operator_action(task: &mut LiquidationTask, action: &OperatorAction, now: DateTime<Utc>) -> bool {
    if task.status.is_terminal() || task.is_executing(now) {
        return false;
    }
    match action {
        OperatorAction::Retry { delay_seconds, reason } => {
            if !matches!(task.status, TaskStatus::Retrying | TaskStatus::Blocked) {
                return false;
            }
            task.status = TaskStatus::Retrying;
            task.next_retry_at = Some(now + Duration::seconds(*delay_seconds));
            task.error_code = Some(MANUAL_RETRY_CODE.to_string());
            task.error_message = Some(
                reason
                    .clone()
                    .unwrap_or_else(|| "Manual retry requested by admin".to_string()),
            );
        }
        OperatorAction::Requeue => {
            task.status = TaskStatus::Pending;
            task.attempt_count = 0;
            task.next_retry_at = Some(now);
            task.error_code = None;
            task.error_message = None;
        }
        OperatorAction::Fail { reason } => {
            task.status = TaskStatus::Failed;
            task.next_retry_at = None;
            task.error_code = Some(MANUAL_FAIL_CODE.to_string());
            task.error_message = Some(
                reason
                    .clone()
                    .unwrap_or_else(|| "Manually marked as failed by admin".to_string()),
            );
        }
    }
    task.updated_at = now;
    true
}

pub struct LiquidationTaskQueue {
    store: Arc<MemoryStore>,
    policy: RetryPolicy,
    lease: Duration,
}

impl LiquidationTaskQueue {
    pub fn new(store: Arc<MemoryStore>, policy: RetryPolicy, lease_secs: i64) -> Self {
        Self {
            store,
            policy,
            lease: Duration::seconds(lease_secs),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn get(&self, task_id: Uuid) -> Option<LiquidationTask> {
        self.store.read(|t| t.liquidation_tasks.get(&task_id).cloned())
    }

    /// Claim up to `batch` due tasks, oldest due first.
    ///
    /// Claiming counts as an attempt and leases the task: if the worker dies
    /// before reporting, the task is due again once the lease runs out.
    pub fn claim_due(&self, now: DateTime<Utc>, batch: usize) -> Result<Vec<LiquidationTask>> {
        let lease = self.lease;
        self.store.transact(|t| {
            let mut due: Vec<&LiquidationTask> =
                t.liquidation_tasks.values().filter(|task| task.is_due(now)).collect();
            due.sort_by_key(|task| (task.next_retry_at.unwrap_or(task.created_at), task.created_at));
            let ids: Vec<Uuid> = due.into_iter().take(batch).map(|task| task.id).collect();

            let mut claimed = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(task) = t.liquidation_tasks.get_mut(&id) {
                    task.attempt_count += 1;
                    task.last_attempt_at = Some(now);
                    task.status = TaskStatus::Retrying;
                    task.next_retry_at = Some(now + lease);
                    task.error_code = Some(EXECUTING_CODE.to_string());
                    task.error_message = None;
                    task.updated_at = now;
                    claimed.push(task.clone());
                }
            }
            Ok(claimed)
        })
    }

    /// Record the outcome of a claimed attempt, applying the sale to the
    /// position in the same commit.
    ///
    /// A sale reported for a task that was closed in the meantime still
    /// reduces the position; only the task itself is left untouched.
    pub fn record_attempt(
        &self,
        task_id: Uuid,
        outcome: AttemptOutcome,
        sold: Option<(f64, f64)>,
        now: DateTime<Utc>,
    ) -> Result<LiquidationTask> {
        let policy = self.policy;
        let task = self.store.transact(|t| {
            let current = t
                .liquidation_tasks
                .get(&task_id)
                .cloned()
                .ok_or_else(|| KeeperError::not_found(format!("liquidation task {}", task_id)))?;
            if let Some((shares, price)) = sold {
                apply_fill_in(
                    t,
                    &ExecutionFill {
                        subscription_id: current.subscription_id,
                        token_id: current.token_id.clone(),
                        side: Side::Sell,
                        shares,
                        price,
                    },
                )?;
            }
            if current.status.is_terminal() {
                warn!(
                    "[LiquidationQueue] task {} already {}, keeping its status",
                    task_id, current.status
                );
                return Ok(current);
            }
            let task = t
                .liquidation_tasks
                .get_mut(&task_id)
                .ok_or_else(|| KeeperError::not_found(format!("liquidation task {}", task_id)))?;
            apply_outcome(task, outcome, &policy, now);
            Ok(task.clone())
        })?;
        info!(
            "[LiquidationQueue] task {} -> {} (attempt {}{})",
            task.id,
            task.status,
            task.attempt_count,
            task.error_code
                .as_deref()
                .map(|c| format!(", {}", c))
                .unwrap_or_default()
        );
        Ok(task)
    }

    /// Apply an operator action to a deduplicated set of tasks.
    pub fn apply_action(
        &self,
        action: &OperatorAction,
        task_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<ActionResult> {
        action.validate()?;
        let ids: Vec<Uuid> = task_ids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() || ids.len() > MAX_ACTION_TASK_IDS {
            return Err(KeeperError::validation(format!(
                "taskIds must contain between 1 and {} ids",
                MAX_ACTION_TASK_IDS
            )));
        }

        let (updated_count, mut tasks) = self.store.transact(|t| {
            let mut updated = 0;
            let mut tasks = Vec::new();
            for id in &ids {
                if let Some(task) = t.liquidation_tasks.get_mut(id) {
                    if apply_operator_action(task, action, now) {
                        updated += 1;
                    }
                    tasks.push(task.clone());
                }
            }
            Ok((updated, tasks))
        })?;
        tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        info!(
            "[LiquidationQueue] operator {} on {} task(s), {} updated",
            action.name(),
            ids.len(),
            updated_count
        );
        Ok(ActionResult {
            action: action.name(),
            requested_count: ids.len(),
            updated_count,
            tasks,
        })
    }

    pub fn list(&self, filter: &TaskFilter, now: DateTime<Utc>) -> TaskListing {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        let wallet = filter.wallet_address.as_deref().map(normalize_wallet);

        self.store.read(|t| {
            let matching: Vec<&LiquidationTask> = t
                .liquidation_tasks
                .values()
                .filter(|task| {
                    filter
                        .statuses
                        .as_ref()
                        .map_or(true, |s| s.contains(&task.status))
                })
                .filter(|task| filter.subscription_id.map_or(true, |id| task.subscription_id == id))
                .filter(|task| wallet.as_ref().map_or(true, |w| &task.wallet_address == w))
                .filter(|task| !filter.due_only || task.is_due(now))
                .collect();

            let mut by_status: BTreeMap<TaskStatus, usize> =
                TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
            for task in &matching {
                *by_status.entry(task.status).or_insert(0) += 1;
            }
            let summary = TaskSummary {
                total_count: matching.len(),
                due_count: matching.iter().filter(|task| task.is_due(now)).count(),
                by_status,
            };

            let mut sorted = matching;
            sorted.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            let tasks = sorted
                .into_iter()
                .take(limit)
                .map(|task| TaskView {
                    task: task.clone(),
                    is_due: task.is_due(now),
                })
                .collect();

            TaskListing { tasks, summary }
        })
    }

    /// Non-terminal tasks, most recently updated first, at most `limit`.
    pub fn open_tasks(&self, limit: usize) -> Vec<LiquidationTask> {
        self.store.read(|t| {
            let mut open: Vec<LiquidationTask> = t
                .liquidation_tasks
                .values()
                .filter(|task| !task.status.is_terminal())
                .cloned()
                .collect();
            open.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            open.truncate(limit);
            open
        })
    }

    /// Tasks due for execution across the whole queue
    pub fn due_count(&self, now: DateTime<Utc>) -> usize {
        self.store
            .read(|t| t.liquidation_tasks.values().filter(|task| task.is_due(now)).count())
    }

    /// Count of tasks per status across the whole queue
    pub fn status_counts(&self) -> BTreeMap<TaskStatus, usize> {
        self.store.read(|t| {
            let mut counts: BTreeMap<TaskStatus, usize> =
                TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
            for task in t.liquidation_tasks.values() {
                *counts.entry(task.status).or_insert(0) += 1;
            }
            counts
        })
    }
}
