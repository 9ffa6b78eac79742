//! Configuration loading and control-plane assembly

use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use wealth_keeper::external::{MemoryFeeLedger, PaperExecutor};
use wealth_keeper::price::{HttpPriceSource, PriceSource, StaticPriceSource};
use wealth_keeper::types::ProfitFeeLogEntry;
use wealth_keeper::{ControlPlane, KeeperConfig, MemoryStore};

/// Expand `~` and environment variables in a user-supplied path.
pub fn expand_path(raw: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(raw).with_context(|| format!("Failed to expand path: {}", raw))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

/// Load the TOML config; no path means all defaults.
pub fn load_config(path: Option<&str>) -> Result<KeeperConfig> {
    let Some(raw) = path else {
        return Ok(KeeperConfig::default());
    };
    let path = expand_path(raw)?;
    let data = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: KeeperConfig = toml::from_str(&data)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    info!(
        "Loaded {} with {} product(s)",
        path.display(),
        config.products.len()
    );
    Ok(config)
}

fn load_fee_log(raw: &str) -> Result<Vec<ProfitFeeLogEntry>> {
    let path = expand_path(raw)?;
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read fee log: {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("Failed to parse fee log: {}", path.display()))
}

/// Open the store and wire every component.
///
/// Orders are filled by the paper executor; prices come from the HTTP quote
/// service when `price_url` is set, otherwise from the static `[marks]`.
pub fn build_plane(config: KeeperConfig, state: Option<&str>) -> Result<ControlPlane> {
    let store = match state {
        Some(raw) => {
            let path = expand_path(raw)?;
            MemoryStore::open(&path).with_context(|| format!("Failed to open state file: {}", path.display()))?
        }
        None => MemoryStore::new(),
    };

    let prices: Arc<dyn PriceSource> = match &config.price_url {
        Some(url) => Arc::new(
            HttpPriceSource::new(url.clone(), config.worker.price_timeout())
                .context("Failed to build price client")?,
        ),
        None => Arc::new(StaticPriceSource::new(config.marks.clone())),
    };

    let fees = match &config.audit.fee_log_path {
        Some(raw) => MemoryFeeLedger::from_entries(load_fee_log(raw)?),
        None => MemoryFeeLedger::new(),
    };

    Ok(ControlPlane::new(
        config,
        Arc::new(store),
        prices,
        Arc::new(PaperExecutor),
        Arc::new(fees),
    ))
}
