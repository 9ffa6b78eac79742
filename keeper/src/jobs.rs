//! Background jobs: NAV sampling, the settlement cycle and the liquidation
//! worker, each on its own interval.

use chrono::Utc;
use log::{error, info};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::lifecycle::SettlementCycleReport;
use crate::worker::CycleReport;
use crate::ControlPlane;

/// Result of one pass of every job
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub nav_snapshots: usize,
    pub settlement: SettlementCycleReport,
    pub liquidation: CycleReport,
}

/// Run each job once, in dependency order.
pub async fn run_once(plane: &ControlPlane) -> PassReport {
    let nav_snapshots = plane.lifecycle.sample_nav(Utc::now()).await;
    let settlement = match plane.lifecycle.run_settlement_cycle(Utc::now()).await {
        Ok(report) => report,
        Err(e) => {
            error!("[Jobs] settlement cycle failed: {}", e);
            SettlementCycleReport::default()
        }
    };
    let liquidation = plane.worker.run_cycle(Utc::now()).await;
    PassReport {
        nav_snapshots,
        settlement,
        liquidation,
    }
}

/// Handles of the spawned job loops
pub struct JobHandles {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl JobHandles {
    /// Signal every loop to stop and wait for in-flight cycles to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("[Jobs] job panicked: {}", e);
            }
        }
        info!("[Jobs] stopped");
    }
}

/// Spawn the periodic jobs on the current runtime.
pub fn spawn(plane: Arc<ControlPlane>) -> JobHandles {
    let (tx, rx) = watch::channel(false);
    let worker = &plane.config.worker;
    let nav_every = Duration::from_secs(worker.nav_interval_secs.max(1));
    let settle_every = Duration::from_secs(worker.settlement_interval_secs.max(1));
    let liquidate_every = Duration::from_secs(worker.liquidation_interval_secs.max(1));

    let handles = vec![
        spawn_loop("nav", nav_every, rx.clone(), {
            let plane = plane.clone();
            move || {
                let plane = plane.clone();
                async move {
                    plane.lifecycle.sample_nav(Utc::now()).await;
                }
            }
        }),
        spawn_loop("settlement", settle_every, rx.clone(), {
            let plane = plane.clone();
            move || {
                let plane = plane.clone();
                async move {
                    if let Err(e) = plane.lifecycle.run_settlement_cycle(Utc::now()).await {
                        error!("[Jobs] settlement cycle failed: {}", e);
                    }
                }
            }
        }),
        spawn_loop("liquidation", liquidate_every, rx, {
            let plane = plane.clone();
            move || {
                let plane = plane.clone();
                async move {
                    plane.worker.run_cycle(Utc::now()).await;
                }
            }
        }),
    ];
    info!(
        "[Jobs] started: nav every {:?}, settlement every {:?}, liquidation every {:?}",
        nav_every, settle_every, liquidate_every
    );
    JobHandles {
        shutdown: tx,
        handles,
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => job().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("[Jobs] {} loop exiting", name);
                        break;
                    }
                }
            }
        }
    })
}
