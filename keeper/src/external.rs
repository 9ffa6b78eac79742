//! Collaborator seams: order execution and the profit-fee log
//!
//! The execution engine and the commission ledger live outside this crate.
//! Production wires real clients behind these traits; the paper and memory
//! implementations here drive the CLI's paper mode and the tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ExecutionError, KeeperError};
use crate::types::ProfitFeeLogEntry;

/// Sell order for one liquidation attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SellOrder {
    pub task_id: Uuid,
    pub subscription_id: Uuid,
    pub wallet_address: String,
    pub copy_config_id: String,
    pub token_id: String,
    pub shares: f64,
    pub limit_price: f64,
}

/// Result of a sell order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub filled_shares: f64,
    pub avg_price: f64,
}

/// Places sell orders against the venue.
///
/// Implementations classify failures: `Transient` is retried with backoff,
/// `Terminal` blocks the task until an operator steps in.
#[async_trait]
pub trait LiquidationExecutor: Send + Sync {
    async fn sell(&self, order: &SellOrder) -> Result<Fill, ExecutionError>;
}

/// Fills every order in full at its limit price
#[derive(Debug, Default)]
pub struct PaperExecutor;

#[async_trait]
impl LiquidationExecutor for PaperExecutor {
    async fn sell(&self, order: &SellOrder) -> Result<Fill, ExecutionError> {
        Ok(Fill {
            filled_shares: order.shares,
            avg_price: order.limit_price,
        })
    }
}

/// Read access to the commission engine's profit-fee log
#[async_trait]
pub trait FeeLedger: Send + Sync {
    async fn fee_entries(
        &self,
        subscription_id: Uuid,
        trade_id: &str,
    ) -> Result<Vec<ProfitFeeLogEntry>, KeeperError>;
}

#[derive(Debug, Default)]
pub struct MemoryFeeLedger {
    entries: RwLock<Vec<ProfitFeeLogEntry>>,
}

impl MemoryFeeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<ProfitFeeLogEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub fn record(&self, entry: ProfitFeeLogEntry) {
        self.entries.write().push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl FeeLedger for MemoryFeeLedger {
    async fn fee_entries(
        &self,
        subscription_id: Uuid,
        trade_id: &str,
    ) -> Result<Vec<ProfitFeeLogEntry>, KeeperError> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|e| e.subscription_id == subscription_id && e.trade_id == trade_id)
            .cloned()
            .collect())
    }
}
