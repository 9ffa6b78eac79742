//! Reserve ledger: append-only record of reserve-fund movements

use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;
use wealth_model::{reserve_balance, round8};

use crate::error::{KeeperError, Result};
use crate::store::{MemoryStore, Tables};
use crate::types::{ReserveEntryType, ReserveLedgerEntry};

/// Balance plus per-type totals
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveSummary {
    pub balance: f64,
    pub entry_count: usize,
    pub totals: BTreeMap<ReserveEntryType, f64>,
    pub last_recorded_at: Option<DateTime<Utc>>,
}

/// Signed fold of the ledger inside a transaction or read view
pub fn ledger_balance(tables: &Tables) -> f64 {
    reserve_balance(
        tables
            .reserve_ledger
            .iter()
            .map(|e| (e.entry_type.direction(), e.amount)),
    )
}

/// Validate and append one entry to the ledger inside a transaction.
pub fn push_entry(
    tables: &mut Tables,
    entry_type: ReserveEntryType,
    amount: f64,
    subscription_id: Option<Uuid>,
    note: Option<String>,
    now: DateTime<Utc>,
) -> Result<ReserveLedgerEntry> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(KeeperError::validation("amount must be a finite number greater than zero"));
    }
    let entry = ReserveLedgerEntry {
        id: Uuid::new_v4(),
        entry_type,
        amount: round8(amount),
        recorded_at: now,
        subscription_id,
        note,
    };
    tables.reserve_ledger.push(entry.clone());
    Ok(entry)
}

pub struct ReserveLedger {
    store: Arc<MemoryStore>,
}

impl ReserveLedger {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// Current balance, recomputed from every entry.
    pub fn balance(&self) -> f64 {
        self.store.read(ledger_balance)
    }

    pub fn append(
        &self,
        entry_type: ReserveEntryType,
        amount: f64,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ReserveLedgerEntry> {
        let entry = self
            .store
            .transact(|t| push_entry(t, entry_type, amount, None, note, now))?;
        info!(
            "[ReserveLedger] recorded {} of {} (id {})",
            entry.entry_type, entry.amount, entry.id
        );
        Ok(entry)
    }

    /// Newest entries first.
    pub fn entries(&self, limit: usize) -> Vec<ReserveLedgerEntry> {
        self.store.read(|t| {
            let mut entries = t.reserve_ledger.clone();
            entries.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
            entries.truncate(limit);
            entries
        })
    }

    pub fn summary(&self) -> ReserveSummary {
        self.store.read(|t| {
            let mut totals: BTreeMap<ReserveEntryType, f64> =
                ReserveEntryType::ALL.iter().map(|k| (*k, 0.0)).collect();
            for e in &t.reserve_ledger {
                *totals.entry(e.entry_type).or_insert(0.0) += e.amount;
            }
            for v in totals.values_mut() {
                *v = round8(*v);
            }
            ReserveSummary {
                balance: round8(ledger_balance(t)),
                entry_count: t.reserve_ledger.len(),
                totals,
                last_recorded_at: t.reserve_ledger.iter().map(|e| e.recorded_at).max(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ledger() -> ReserveLedger {
        ReserveLedger::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_balance_signed_by_type() {
        let l = ledger();
        let now = Utc::now();
        l.append(ReserveEntryType::Deposit, 100_000.0, None, now).unwrap();
        l.append(ReserveEntryType::Topup, 5_000.0, None, now).unwrap();
        l.append(ReserveEntryType::Withdraw, 20_000.0, Some("rebalance".into()), now).unwrap();
        l.append(ReserveEntryType::GuaranteePayout, 1_000.0, None, now).unwrap();
        assert_eq!(l.balance(), 84_000.0);
    }

    #[test]
    fn test_append_rejects_non_positive() {
        let l = ledger();
        let now = Utc::now();
        assert!(matches!(
            l.append(ReserveEntryType::Deposit, 0.0, None, now),
            Err(KeeperError::Validation(_))
        ));
        assert!(matches!(
            l.append(ReserveEntryType::Deposit, f64::INFINITY, None, now),
            Err(KeeperError::Validation(_))
        ));
        assert_eq!(l.summary().entry_count, 0);
    }

    #[test]
    fn test_entries_newest_first_and_summary() {
        let l = ledger();
        let t0 = Utc::now();
        l.append(ReserveEntryType::Deposit, 10.0, None, t0).unwrap();
        l.append(ReserveEntryType::Deposit, 20.0, None, t0 + Duration::seconds(5)).unwrap();
        l.append(ReserveEntryType::Withdraw, 5.0, None, t0 + Duration::seconds(10)).unwrap();

        let entries = l.entries(2);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].amount, 5.0);
        assert_eq!(entries[1].amount, 20.0);

        let summary = l.summary();
        assert_eq!(summary.balance, 25.0);
        assert_eq!(summary.totals[&ReserveEntryType::Deposit], 30.0);
        assert_eq!(summary.totals[&ReserveEntryType::Topup], 0.0);
        assert_eq!(summary.last_recorded_at, Some(t0 + Duration::seconds(10)));
    }
}
