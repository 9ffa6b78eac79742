//! Price sources for NAV marking and liquidation limits

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::PriceError;

#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Best bid for selling `token_id`; `None` when the book has no bids.
    async fn best_bid(&self, token_id: &str) -> Result<Option<f64>, PriceError>;

    /// Mark price used for NAV.
    async fn mark_price(&self, token_id: &str) -> Result<f64, PriceError>;
}

/// Fixed marks from configuration; the mark doubles as the best bid
#[derive(Debug, Clone, Default)]
pub struct StaticPriceSource {
    marks: HashMap<String, f64>,
}

impl StaticPriceSource {
    pub fn new(marks: HashMap<String, f64>) -> Self {
        Self { marks }
    }
}

#[async_trait]
impl PriceSource for StaticPriceSource {
    async fn best_bid(&self, token_id: &str) -> Result<Option<f64>, PriceError> {
        Ok(self.marks.get(token_id).copied().filter(|p| *p > 0.0))
    }

    async fn mark_price(&self, token_id: &str) -> Result<f64, PriceError> {
        self.marks
            .get(token_id)
            .copied()
            .ok_or_else(|| PriceError::Unavailable(token_id.to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    best_bid: Option<f64>,
    mark: Option<f64>,
}

/// Quote service over HTTP: `GET {base}/quote/{token_id}` returning
/// `{"bestBid": .., "mark": ..}`
pub struct HttpPriceSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPriceSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PriceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PriceError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn quote(&self, token_id: &str) -> Result<QuoteResponse, PriceError> {
        let url = format!("{}/quote/{}", self.base_url, token_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PriceError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PriceError::Http(format!("{} returned {}", url, response.status())));
        }
        response
            .json::<QuoteResponse>()
            .await
            .map_err(|e| PriceError::Http(e.to_string()))
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn best_bid(&self, token_id: &str) -> Result<Option<f64>, PriceError> {
        Ok(self.quote(token_id).await?.best_bid.filter(|p| *p > 0.0))
    }

    async fn mark_price(&self, token_id: &str) -> Result<f64, PriceError> {
        self.quote(token_id)
            .await?
            .mark
            .ok_or_else(|| PriceError::Unavailable(token_id.to_string()))
    }
}

/// Price with its provenance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricedMark {
    pub price: f64,
    pub is_fallback: bool,
}

/// Mark lookup bounded by `timeout`, degrading to `fallback` on any failure.
pub async fn mark_or_fallback(
    source: &dyn PriceSource,
    token_id: &str,
    fallback: f64,
    timeout: Duration,
) -> PricedMark {
    match tokio::time::timeout(timeout, source.mark_price(token_id)).await {
        Ok(Ok(price)) if price.is_finite() && price >= 0.0 => PricedMark {
            price,
            is_fallback: false,
        },
        Ok(Ok(price)) => {
            warn!("[Price] discarding invalid mark {} for {}", price, token_id);
            PricedMark { price: fallback, is_fallback: true }
        }
        Ok(Err(e)) => {
            debug!("[Price] mark for {} unavailable: {}", token_id, e);
            PricedMark { price: fallback, is_fallback: true }
        }
        Err(_) => {
            warn!("[Price] mark for {} timed out after {:?}", token_id, timeout);
            PricedMark { price: fallback, is_fallback: true }
        }
    }
}

/// Best-bid lookup bounded by `timeout`.
pub async fn best_bid_within(
    source: &dyn PriceSource,
    token_id: &str,
    timeout: Duration,
) -> Result<Option<f64>, PriceError> {
    tokio::time::timeout(timeout, source.best_bid(token_id))
        .await
        .map_err(|_| PriceError::Timeout(timeout.as_millis() as u64))?
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowSource;

    #[async_trait]
    impl PriceSource for SlowSource {
        async fn best_bid(&self, _token_id: &str) -> Result<Option<f64>, PriceError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Some(1.0))
        }

        async fn mark_price(&self, _token_id: &str) -> Result<f64, PriceError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1.0)
        }
    }

    fn marks() -> StaticPriceSource {
        StaticPriceSource::new(HashMap::from([("yes".to_string(), 0.62)]))
    }

    #[tokio::test]
    async fn test_static_mark_hit() {
        let m = mark_or_fallback(&marks(), "yes", 0.4, Duration::from_secs(1)).await;
        assert_eq!(m, PricedMark { price: 0.62, is_fallback: false });
    }

    #[tokio::test]
    async fn test_missing_mark_falls_back() {
        let m = mark_or_fallback(&marks(), "no", 0.4, Duration::from_secs(1)).await;
        assert_eq!(m, PricedMark { price: 0.4, is_fallback: true });
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_times_out() {
        let m = mark_or_fallback(&SlowSource, "yes", 0.4, Duration::from_millis(100)).await;
        assert!(m.is_fallback);

        let bid = best_bid_within(&SlowSource, "yes", Duration::from_millis(100)).await;
        assert!(matches!(bid, Err(PriceError::Timeout(100))));
    }
}
