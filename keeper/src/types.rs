//! Persisted records of the control plane

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use wealth_model::Direction;

/// A position is open while it holds more than this many shares
pub const OPEN_SHARES_EPSILON: f64 = 1e-6;

macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let upper = s.trim().to_ascii_uppercase();
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == upper)
                    .ok_or_else(|| format!("unknown {}: {}", stringify!($name), s))
            }
        }
    };
}

status_enum! {
    /// Kind of reserve-fund movement
    ReserveEntryType {
        Deposit => "DEPOSIT",
        Withdraw => "WITHDRAW",
        Topup => "TOPUP",
        GuaranteePayout => "GUARANTEE_PAYOUT",
    }
}

impl ReserveEntryType {
    pub fn direction(&self) -> Direction {
        match self {
            Self::Deposit | Self::Topup => Direction::Credit,
            Self::Withdraw | Self::GuaranteePayout => Direction::Debit,
        }
    }
}

status_enum! {
    /// Subscription lifecycle state
    SubscriptionStatus {
        Pending => "PENDING",
        Running => "RUNNING",
        Matured => "MATURED",
        Settled => "SETTLED",
        Cancelled => "CANCELLED",
    }
}

impl SubscriptionStatus {
    /// States whose guarantee still weighs on the reserve
    pub fn carries_liability(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Matured)
    }

    /// States in which the subscription trades through an execution account
    pub fn in_execution_scope(&self) -> bool {
        matches!(self, Self::Running | Self::Matured)
    }
}

status_enum! {
    /// Liquidation task state
    TaskStatus {
        Pending => "PENDING",
        Retrying => "RETRYING",
        Blocked => "BLOCKED",
        Completed => "COMPLETED",
        Failed => "FAILED",
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }
}

status_enum! {
    /// Where a NAV snapshot's marks came from
    PriceSourceKind {
        Initial => "INITIAL",
        Market => "MARKET",
        EntryFallback => "ENTRY_FALLBACK",
    }
}

/// Append-only reserve ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveLedgerEntry {
    pub id: Uuid,
    pub entry_type: ReserveEntryType,
    pub amount: f64,
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// One term (duration and yield) offered by a product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedTerm {
    pub id: String,
    pub label: String,
    pub duration_days: u32,
    pub min_yield_rate: Option<f64>,
    /// Overrides the product fee rate when set
    pub performance_fee_rate: Option<f64>,
    pub max_subscription_amount: Option<f64>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedProduct {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub is_guaranteed: bool,
    pub is_active: bool,
    pub reserve_coverage_min: f64,
    pub performance_fee_rate: f64,
    pub terms: Vec<ManagedTerm>,
}

impl ManagedProduct {
    pub fn term(&self, term_id: &str) -> Option<&ManagedTerm> {
        self.terms.iter().find(|t| t.id == term_id)
    }

    pub fn fee_rate_for(&self, term: &ManagedTerm) -> f64 {
        term.performance_fee_rate.unwrap_or(self.performance_fee_rate)
    }
}

/// A wallet's stake in a managed product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedSubscription {
    pub id: Uuid,
    pub wallet_address: String,
    pub product_id: String,
    pub term_id: String,
    pub principal: f64,
    pub status: SubscriptionStatus,
    pub high_water_mark: f64,
    pub current_equity: f64,
    pub realized_pnl: f64,
    /// Minimum yield guaranteed at subscription time; `None` for
    /// non-guaranteed products
    pub guaranteed_min_yield: Option<f64>,
    pub performance_fee_rate: f64,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub matured_at: Option<DateTime<Utc>>,
    pub liquidation_started_at: Option<DateTime<Utc>>,
    pub is_trial: bool,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub copy_config_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManagedSubscription {
    /// Reserve liability this subscription currently carries
    pub fn liability(&self) -> f64 {
        if !self.status.carries_liability() {
            return 0.0;
        }
        wealth_model::guarantee_liability(self.principal, self.guaranteed_min_yield)
    }

    /// Fee rate applied at settlement; trials that end inside the trial
    /// window pay nothing.
    pub fn effective_fee_rate(&self) -> f64 {
        match (self.is_trial, self.trial_ends_at) {
            (true, Some(trial_end)) if self.end_at <= trial_end => 0.0,
            _ => self.performance_fee_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavSnapshot {
    pub subscription_id: Uuid,
    pub snapshot_at: DateTime<Utc>,
    pub nav: f64,
    pub equity: f64,
    pub period_return: f64,
    pub cumulative_return: f64,
    pub drawdown: f64,
    pub price_source: PriceSourceKind,
    pub is_fallback_price: bool,
}

/// Open exposure of a subscription in one outcome token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPosition {
    pub subscription_id: Uuid,
    pub token_id: String,
    pub shares: f64,
    pub avg_entry_price: f64,
}

impl SubscriptionPosition {
    pub fn is_open(&self) -> bool {
        self.shares > OPEN_SHARES_EPSILON
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidationTask {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub wallet_address: String,
    pub token_id: String,
    pub requested_shares: f64,
    pub avg_entry_price: f64,
    pub indicative_price: Option<f64>,
    pub notional_usd: Option<f64>,
    pub indicative_price_is_fallback: bool,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LiquidationTask {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// A worker holds the task and its processing lease has not run out.
    pub fn is_executing(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Retrying
            && self.error_code.as_deref() == Some(crate::liquidation::EXECUTING_CODE)
            && self.next_retry_at.map_or(false, |at| at > now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRecord {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub wallet_address: String,
    pub trade_id: String,
    pub gross_pnl: f64,
    pub expected_fee: f64,
    pub actual_fee: Option<f64>,
    pub settled_at: DateTime<Utc>,
    pub principal: f64,
    pub final_equity: f64,
    pub high_water_mark: f64,
    pub performance_fee: f64,
    pub guaranteed_payout: Option<f64>,
    pub reserve_topup: f64,
    pub final_payout: f64,
}

/// Trade id under which the fee ledger books a settlement's profit fee
pub fn settlement_trade_id(subscription_id: Uuid, settlement_id: Uuid) -> String {
    format!("managed-withdrawal:{}:{}", subscription_id, settlement_id)
}

/// Row of the external profit-fee log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfitFeeLogEntry {
    pub subscription_id: Uuid,
    pub trade_id: String,
    pub amount: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Referral {
    pub referee_wallet: String,
    pub referrer_wallet: String,
    pub bonus_granted_at: Option<DateTime<Utc>>,
}

/// Wallet addresses are compared lower-cased
pub fn normalize_wallet(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}
