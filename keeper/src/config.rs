//! Control-plane configuration
//!
//! Loaded from TOML by the CLI. Every field has a default so an empty file
//! (or no file) yields a usable paper-trading setup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use wealth_model::RetryPolicy;

use crate::types::{ManagedProduct, ManagedTerm};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    pub server: ServerConfig,
    pub subscription: SubscriptionConfig,
    pub worker: WorkerConfig,
    pub audit: AuditConfig,
    pub products: Vec<ProductConfig>,
    /// Static marks used by the static price source, keyed by token id
    pub marks: HashMap<String, f64>,
    /// Base URL of an HTTP price service; static marks are used when unset
    pub price_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8088".to_string(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub min_principal: f64,
    /// A wallet's first subscription is a trial when its term is at most
    /// this many days long
    pub trial_max_term_days: u32,
    pub referral_bonus_days: i64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            min_principal: 500.0,
            trial_max_term_days: 1,
            referral_bonus_days: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub nav_interval_secs: u64,
    pub settlement_interval_secs: u64,
    pub liquidation_interval_secs: u64,
    pub liquidation_batch_size: usize,
    pub worker_concurrency: usize,
    pub lease_secs: i64,
    pub retry_base_secs: u64,
    pub retry_max_secs: u64,
    pub max_attempts: u32,
    pub min_notional_usd: f64,
    pub price_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            nav_interval_secs: 300,
            settlement_interval_secs: 60,
            liquidation_interval_secs: 30,
            liquidation_batch_size: 10,
            worker_concurrency: 4,
            lease_secs: 120,
            retry_base_secs: 120,
            retry_max_secs: 1_800,
            max_attempts: 20,
            min_notional_usd: 1.0,
            price_timeout_ms: 3_000,
        }
    }
}

impl WorkerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay_secs: self.retry_base_secs,
            max_delay_secs: self.retry_max_secs,
            max_attempts: self.max_attempts,
        }
    }

    pub fn price_timeout(&self) -> Duration {
        Duration::from_millis(self.price_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub profit_fee_rate: f64,
    pub fee_tolerance: f64,
    /// JSON export of the commission engine's profit-fee log
    pub fee_log_path: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            profit_fee_rate: 0.2,
            fee_tolerance: 0.0001,
            fee_log_path: None,
        }
    }
}

/// `[[products]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductConfig {
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub is_guaranteed: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_coverage_min")]
    pub reserve_coverage_min: f64,
    #[serde(default = "default_fee_rate")]
    pub performance_fee_rate: f64,
    #[serde(default)]
    pub terms: Vec<TermConfig>,
}

/// `[[products.terms]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermConfig {
    pub id: String,
    pub label: String,
    pub duration_days: u32,
    pub min_yield_rate: Option<f64>,
    pub performance_fee_rate: Option<f64>,
    pub max_subscription_amount: Option<f64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

fn default_coverage_min() -> f64 {
    1.0
}

fn default_fee_rate() -> f64 {
    0.2
}

impl From<TermConfig> for ManagedTerm {
    fn from(t: TermConfig) -> Self {
        Self {
            id: t.id,
            label: t.label,
            duration_days: t.duration_days,
            min_yield_rate: t.min_yield_rate,
            performance_fee_rate: t.performance_fee_rate,
            max_subscription_amount: t.max_subscription_amount,
            is_active: t.is_active,
        }
    }
}

impl From<ProductConfig> for ManagedProduct {
    fn from(p: ProductConfig) -> Self {
        Self {
            id: p.id,
            slug: p.slug,
            name: p.name,
            is_guaranteed: p.is_guaranteed,
            is_active: p.is_active,
            reserve_coverage_min: p.reserve_coverage_min,
            performance_fee_rate: p.performance_fee_rate,
            terms: p.terms.into_iter().map(ManagedTerm::from).collect(),
        }
    }
}

impl KeeperConfig {
    pub fn catalog(&self) -> Catalog {
        Catalog::new(self.products.iter().cloned().map(ManagedProduct::from).collect())
    }
}

/// Product catalog lookup
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    products: Vec<ManagedProduct>,
}

impl Catalog {
    pub fn new(products: Vec<ManagedProduct>) -> Self {
        Self { products }
    }

    pub fn products(&self) -> &[ManagedProduct] {
        &self.products
    }

    /// Find a product by id or slug.
    pub fn find(&self, id_or_slug: &str) -> Option<&ManagedProduct> {
        self.products
            .iter()
            .find(|p| p.id == id_or_slug || p.slug == id_or_slug)
    }

    pub fn guaranteed(&self) -> impl Iterator<Item = &ManagedProduct> {
        self.products.iter().filter(|p| p.is_guaranteed)
    }
}
