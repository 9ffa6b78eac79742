//! Settlement/fee parity audit
//!
//! Every profitable settlement must be matched by profit-fee postings in the
//! commission ledger summing to its expected fee. The audit is read-only and
//! never fails as a whole: ledger read errors are reported per settlement.

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;
use wealth_model::round8;

use crate::external::FeeLedger;
use crate::store::MemoryStore;
use crate::types::SettlementRecord;

/// Findings reported per list
pub const MAX_FINDINGS: usize = 50;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingFee {
    pub settlement_id: Uuid,
    pub subscription_id: Uuid,
    pub wallet_address: String,
    pub trade_id: String,
    pub gross_pnl: f64,
    pub expected_fee: f64,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeMismatch {
    pub settlement_id: Uuid,
    pub subscription_id: Uuid,
    pub trade_id: String,
    pub expected_fee: f64,
    pub actual_fee: f64,
    /// `actual - expected`
    pub drift: f64,
    pub log_count: usize,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditError {
    pub settlement_id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParityReport {
    pub window_days: i64,
    pub checked_settlements: usize,
    pub profitable_settlements: usize,
    pub matched_count: usize,
    pub missing_count: usize,
    pub mismatch_count: usize,
    pub missing: Vec<MissingFee>,
    pub fee_mismatches: Vec<FeeMismatch>,
    pub errors: Vec<AuditError>,
}

impl ParityReport {
    pub fn is_clean(&self) -> bool {
        self.missing_count == 0 && self.mismatch_count == 0 && self.errors.is_empty()
    }
}

pub struct SettlementParityAuditor {
    store: Arc<MemoryStore>,
    fees: Arc<dyn FeeLedger>,
    tolerance: f64,
}

impl SettlementParityAuditor {
    pub fn new(store: Arc<MemoryStore>, fees: Arc<dyn FeeLedger>, tolerance: f64) -> Self {
        Self { store, fees, tolerance }
    }

    pub async fn audit(&self, window_days: i64, limit: usize, now: DateTime<Utc>) -> ParityReport {
        let since = now - Duration::days(window_days);
        let settlements: Vec<SettlementRecord> = self.store.read(|t| {
            let mut recent: Vec<SettlementRecord> = t
                .settlements
                .values()
                .filter(|s| s.settled_at >= since)
                .cloned()
                .collect();
            recent.sort_by(|a, b| b.settled_at.cmp(&a.settled_at));
            recent.truncate(limit);
            recent
        });

        let mut report = ParityReport {
            window_days,
            checked_settlements: settlements.len(),
            profitable_settlements: 0,
            matched_count: 0,
            missing_count: 0,
            mismatch_count: 0,
            missing: Vec::new(),
            fee_mismatches: Vec::new(),
            errors: Vec::new(),
        };

        for s in settlements.iter().filter(|s| s.gross_pnl > 0.0) {
            report.profitable_settlements += 1;
            let entries = match self.fees.fee_entries(s.subscription_id, &s.trade_id).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("[ParityAuditor] fee lookup for {} failed: {}", s.trade_id, e);
                    report.errors.push(AuditError {
                        settlement_id: s.id,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            if entries.is_empty() {
                report.missing_count += 1;
                if report.missing.len() < MAX_FINDINGS {
                    report.missing.push(MissingFee {
                        settlement_id: s.id,
                        subscription_id: s.subscription_id,
                        wallet_address: s.wallet_address.clone(),
                        trade_id: s.trade_id.clone(),
                        gross_pnl: s.gross_pnl,
                        expected_fee: s.expected_fee,
                        settled_at: s.settled_at,
                    });
                }
                continue;
            }

            let actual = round8(entries.iter().map(|e| e.amount).sum());
            let drift = round8(actual - s.expected_fee);
            if drift.abs() > self.tolerance {
                report.mismatch_count += 1;
                if report.fee_mismatches.len() < MAX_FINDINGS {
                    report.fee_mismatches.push(FeeMismatch {
                        settlement_id: s.id,
                        subscription_id: s.subscription_id,
                        trade_id: s.trade_id.clone(),
                        expected_fee: s.expected_fee,
                        actual_fee: actual,
                        drift,
                        log_count: entries.len(),
                        settled_at: s.settled_at,
                    });
                }
            } else {
                report.matched_count += 1;
            }
        }

        if report.is_clean() {
            info!(
                "[ParityAuditor] {} settlement(s) checked over {}d, all matched",
                report.checked_settlements, window_days
            );
        } else {
            warn!(
                "[ParityAuditor] {} missing, {} mismatched, {} lookup error(s) over {}d",
                report.missing_count,
                report.mismatch_count,
                report.errors.len(),
                window_days
            );
        }
        report
    }
}
