//! Keyed advisory locks
//!
//! Serializes work per key (`wallet:<addr>`, `product:<id>`, `nav:<id>`).
//! Callers that need several keys must take them in the order
//! wallet, product, nav.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `key`.
    pub async fn lock(&self, key: impl Into<String>) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock();
            // Drop slots nobody holds or waits on
            slots.retain(|_, m| Arc::strong_count(m) > 1);
            slots.entry(key.into()).or_default().clone()
        };
        slot.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn wallet_key(wallet: &str) -> String {
    format!("wallet:{}", wallet)
}

pub fn product_key(product_id: &str) -> String {
    format!("product:{}", product_id)
}

pub fn nav_key(subscription_id: Uuid) -> String {
    format!("nav:{}", subscription_id)
}
