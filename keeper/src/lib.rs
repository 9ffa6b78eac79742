//! Managed-wealth control plane
//!
//! Reserve ledger and guarantee coverage, subscription lifecycle with NAV
//! tracking, the liquidation task queue and its worker, and the read-only
//! audits behind the operator health report.

pub mod allocation;
pub mod config;
pub mod coverage;
pub mod error;
pub mod external;
pub mod health;
pub mod jobs;
pub mod lifecycle;
pub mod liquidation;
pub mod lock;
pub mod parity;
pub mod positions;
pub mod price;
pub mod referral;
pub mod reserve;
pub mod stale;
pub mod store;
pub mod types;
pub mod worker;

use std::sync::Arc;

pub use config::{Catalog, KeeperConfig};
pub use error::{ExecutionError, KeeperError, PriceError, Result};
pub use store::MemoryStore;

use allocation::AllocationMappingMonitor;
use coverage::GuaranteeCoverageGuard;
use external::{FeeLedger, LiquidationExecutor};
use health::OpsHealthReporter;
use lifecycle::SubscriptionLifecycle;
use liquidation::LiquidationTaskQueue;
use lock::KeyedLocks;
use parity::SettlementParityAuditor;
use price::PriceSource;
use reserve::ReserveLedger;
use worker::{LiquidationWorker, WorkerSettings};

/// Every component wired over one store
pub struct ControlPlane {
    pub config: KeeperConfig,
    pub catalog: Catalog,
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<ReserveLedger>,
    pub guard: Arc<GuaranteeCoverageGuard>,
    pub lifecycle: Arc<SubscriptionLifecycle>,
    pub queue: Arc<LiquidationTaskQueue>,
    pub worker: Arc<LiquidationWorker>,
    pub auditor: Arc<SettlementParityAuditor>,
    pub monitor: Arc<AllocationMappingMonitor>,
    pub health: Arc<OpsHealthReporter>,
}

impl ControlPlane {
    pub fn new(
        config: KeeperConfig,
        store: Arc<MemoryStore>,
        prices: Arc<dyn PriceSource>,
        executor: Arc<dyn LiquidationExecutor>,
        fees: Arc<dyn FeeLedger>,
    ) -> Self {
        let catalog = config.catalog();
        let locks = Arc::new(KeyedLocks::new());
        let price_timeout = config.worker.price_timeout();

        let ledger = Arc::new(ReserveLedger::new(store.clone()));
        let guard = Arc::new(GuaranteeCoverageGuard::new(store.clone()));
        let queue = Arc::new(LiquidationTaskQueue::new(
            store.clone(),
            config.worker.retry_policy(),
            config.worker.lease_secs,
        ));
        let lifecycle = Arc::new(SubscriptionLifecycle::new(
            store.clone(),
            locks,
            catalog.clone(),
            config.subscription.clone(),
            config.audit.profit_fee_rate,
            prices.clone(),
            price_timeout,
        ));
        let worker = Arc::new(LiquidationWorker::new(
            store.clone(),
            queue.clone(),
            executor,
            prices,
            WorkerSettings {
                batch_size: config.worker.liquidation_batch_size,
                concurrency: config.worker.worker_concurrency,
                min_notional_usd: config.worker.min_notional_usd,
                price_timeout,
            },
        ));
        let auditor = Arc::new(SettlementParityAuditor::new(
            store.clone(),
            fees,
            config.audit.fee_tolerance,
        ));
        let monitor = Arc::new(AllocationMappingMonitor::new(store.clone()));
        let health = Arc::new(OpsHealthReporter::new(
            catalog.clone(),
            ledger.clone(),
            guard.clone(),
            queue.clone(),
            auditor.clone(),
            monitor.clone(),
        ));

        Self {
            config,
            catalog,
            store,
            ledger,
            guard,
            lifecycle,
            queue,
            worker,
            auditor,
            monitor,
            health,
        }
    }
}
