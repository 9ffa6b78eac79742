//! Allocation mapping monitor
//!
//! A running or matured subscription trades through a copy-trading config.
//! Subscriptions that have waited too long for one are reported.

use chrono::{DateTime, Duration, Utc};
use log::warn;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::stale::flag_stale;
use crate::store::MemoryStore;
use crate::types::{ManagedSubscription, SubscriptionStatus};

pub const MAX_STALE_REPORTED: usize = 20;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmappedSubscription {
    pub subscription_id: Uuid,
    pub wallet_address: String,
    pub product_id: String,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
    pub age_minutes: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationReport {
    pub stale_mapping_minutes: i64,
    pub execution_scope_subscriptions: usize,
    pub mapped_count: usize,
    pub unmapped_count: usize,
    pub stale_unmapped_count: usize,
    pub stale_unmapped: Vec<UnmappedSubscription>,
}

pub struct AllocationMappingMonitor {
    store: Arc<MemoryStore>,
}

impl AllocationMappingMonitor {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    pub fn scan(&self, stale_mapping_minutes: i64, now: DateTime<Utc>) -> AllocationReport {
        let in_scope: Vec<ManagedSubscription> = self.store.read(|t| {
            t.subscriptions
                .values()
                .filter(|s| s.status.in_execution_scope())
                .cloned()
                .collect()
        });
        let total = in_scope.len();
        let (mapped, unmapped): (Vec<_>, Vec<_>) =
            in_scope.into_iter().partition(|s| s.copy_config_id.is_some());
        let unmapped_count = unmapped.len();

        let (stale, stale_count) = flag_stale(
            unmapped,
            |s| s.created_at,
            Duration::minutes(stale_mapping_minutes),
            now,
            MAX_STALE_REPORTED,
        );
        if stale_count > 0 {
            warn!(
                "[AllocationMonitor] {} subscription(s) unmapped for over {} minute(s)",
                stale_count, stale_mapping_minutes
            );
        }

        AllocationReport {
            stale_mapping_minutes,
            execution_scope_subscriptions: total,
            mapped_count: mapped.len(),
            unmapped_count,
            stale_unmapped_count: stale_count,
            stale_unmapped: stale
                .into_iter()
                .map(|s| UnmappedSubscription {
                    subscription_id: s.item.id,
                    wallet_address: s.item.wallet_address,
                    product_id: s.item.product_id,
                    status: s.item.status,
                    created_at: s.item.created_at,
                    age_minutes: s.age.num_minutes(),
                })
                .collect(),
        }
    }
}
