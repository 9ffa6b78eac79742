//! In-memory store with atomic transactions and optional JSON snapshots
//!
//! Every mutation runs through [`MemoryStore::transact`]: the closure works on
//! a copy of the tables and the copy is swapped in only when the closure
//! returns `Ok`, so a failed guard or validation leaves no partial writes.
//! When a snapshot path is configured the committed tables are written to
//! disk before the swap.

use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{KeeperError, Result};
use crate::types::*;

/// All persisted tables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tables {
    pub reserve_ledger: Vec<ReserveLedgerEntry>,
    pub subscriptions: BTreeMap<Uuid, ManagedSubscription>,
    pub nav_snapshots: Vec<NavSnapshot>,
    pub positions: Vec<SubscriptionPosition>,
    pub liquidation_tasks: BTreeMap<Uuid, LiquidationTask>,
    pub settlements: BTreeMap<Uuid, SettlementRecord>,
    pub referrals: Vec<Referral>,
}

impl Tables {
    pub fn subscription(&self, id: Uuid) -> Result<&ManagedSubscription> {
        self.subscriptions
            .get(&id)
            .ok_or_else(|| KeeperError::not_found(format!("subscription {}", id)))
    }

    pub fn subscription_mut(&mut self, id: Uuid) -> Result<&mut ManagedSubscription> {
        self.subscriptions
            .get_mut(&id)
            .ok_or_else(|| KeeperError::not_found(format!("subscription {}", id)))
    }

    pub fn open_positions(&self, subscription_id: Uuid) -> impl Iterator<Item = &SubscriptionPosition> {
        self.positions
            .iter()
            .filter(move |p| p.subscription_id == subscription_id && p.is_open())
    }

    pub fn tasks_for(&self, subscription_id: Uuid) -> impl Iterator<Item = &LiquidationTask> {
        self.liquidation_tasks
            .values()
            .filter(move |t| t.subscription_id == subscription_id)
    }

    pub fn settlement_for(&self, subscription_id: Uuid) -> Option<&SettlementRecord> {
        self.settlements
            .values()
            .find(|s| s.subscription_id == subscription_id)
    }

    pub fn last_snapshot(&self, subscription_id: Uuid) -> Option<&NavSnapshot> {
        self.nav_snapshots
            .iter()
            .rev()
            .find(|s| s.subscription_id == subscription_id)
    }
}

pub struct MemoryStore {
    tables: RwLock<Tables>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            snapshot_path: None,
        }
    }

    /// Open a store backed by a JSON snapshot file, loading it if present.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let data = fs::read_to_string(&path)
                .map_err(|e| KeeperError::Storage(format!("read {}: {}", path.display(), e)))?;
            serde_json::from_str(&data)
                .map_err(|e| KeeperError::Storage(format!("parse {}: {}", path.display(), e)))?
        } else {
            Tables::default()
        };
        debug!("[Store] opened snapshot {}", path.display());
        Ok(Self {
            tables: RwLock::new(tables),
            snapshot_path: Some(path),
        })
    }

    /// Run a read-only view over the tables.
    pub fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.tables.read())
    }

    /// Run `f` atomically; changes commit only if it returns `Ok`.
    pub fn transact<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R>) -> Result<R> {
        let mut guard = self.tables.write();
        let mut working = guard.clone();
        let out = f(&mut working)?;
        if let Some(path) = &self.snapshot_path {
            write_snapshot(path, &working)?;
        }
        *guard = working;
        Ok(out)
    }

    pub fn snapshot(&self) -> Tables {
        self.tables.read().clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn write_snapshot(path: &Path, tables: &Tables) -> Result<()> {
    let json = serde_json::to_string_pretty(tables)
        .map_err(|e| KeeperError::Storage(format!("encode snapshot: {}", e)))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)
        .map_err(|e| KeeperError::Storage(format!("write {}: {}", tmp.display(), e)))?;
    fs::rename(&tmp, path)
        .map_err(|e| KeeperError::Storage(format!("rename {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn deposit(amount: f64) -> ReserveLedgerEntry {
        ReserveLedgerEntry {
            id: Uuid::new_v4(),
            entry_type: ReserveEntryType::Deposit,
            amount,
            recorded_at: Utc::now(),
            subscription_id: None,
            note: None,
        }
    }

    #[test]
    fn test_transact_commits_on_ok() {
        let store = MemoryStore::new();
        store
            .transact(|t| {
                t.reserve_ledger.push(deposit(10.0));
                Ok(())
            })
            .unwrap();
        assert_eq!(store.read(|t| t.reserve_ledger.len()), 1);
    }

    #[test]
    fn test_transact_rolls_back_on_err() {
        let store = MemoryStore::new();
        let res: Result<()> = store.transact(|t| {
            t.reserve_ledger.push(deposit(10.0));
            Err(KeeperError::conflict("nope"))
        });
        assert!(res.is_err());
        assert_eq!(store.read(|t| t.reserve_ledger.len()), 0);
    }

    #[test]
    fn test_snapshot_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = MemoryStore::open(&path).unwrap();
            store
                .transact(|t| {
                    t.reserve_ledger.push(deposit(250.0));
                    Ok(())
                })
                .unwrap();
        }

        let reopened = MemoryStore::open(&path).unwrap();
        let amounts: Vec<f64> = reopened.read(|t| t.reserve_ledger.iter().map(|e| e.amount).collect());
        assert_eq!(amounts, vec![250.0]);
    }

    #[test]
    fn test_open_rejects_corrupt_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(MemoryStore::open(&path), Err(KeeperError::Storage(_))));
    }
}
