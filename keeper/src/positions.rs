//! Execution feed: fills from the copy-trade engine applied to subscription
//! positions

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wealth_model::round8;

use crate::error::{KeeperError, Result};
use crate::store::Tables;
use crate::types::{SubscriptionPosition, SubscriptionStatus, OPEN_SHARES_EPSILON};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFill {
    pub subscription_id: Uuid,
    pub token_id: String,
    pub side: Side,
    pub shares: f64,
    pub price: f64,
}

/// Apply a fill to the position table and return the realized PnL it booked.
///
/// Buys average into the entry price; sells realize against it and never
/// take the position below zero. Settled subscriptions take no fills, and
/// once a subscription stops running it only takes sells.
pub fn apply_fill_in(tables: &mut Tables, fill: &ExecutionFill) -> Result<f64> {
    if !fill.shares.is_finite() || fill.shares <= 0.0 {
        return Err(KeeperError::validation("fill shares must be greater than zero"));
    }
    if !fill.price.is_finite() || fill.price < 0.0 {
        return Err(KeeperError::validation("fill price must be a non-negative number"));
    }
    let status = tables.subscription(fill.subscription_id)?.status;
    if status == SubscriptionStatus::Settled || tables.settlement_for(fill.subscription_id).is_some() {
        return Err(KeeperError::conflict(format!(
            "subscription {} is settled and takes no fills",
            fill.subscription_id
        )));
    }
    if fill.side == Side::Buy && !matches!(status, SubscriptionStatus::Pending | SubscriptionStatus::Running) {
        return Err(KeeperError::conflict(format!(
            "subscription {} is {} and takes no new exposure",
            fill.subscription_id, status
        )));
    }

    let idx = tables
        .positions
        .iter()
        .position(|p| p.subscription_id == fill.subscription_id && p.token_id == fill.token_id);

    let realized = match (fill.side, idx) {
        (Side::Buy, Some(i)) => {
            let pos = &mut tables.positions[i];
            let total = pos.shares + fill.shares;
            pos.avg_entry_price = round8((pos.shares * pos.avg_entry_price + fill.shares * fill.price) / total);
            pos.shares = round8(total);
            0.0
        }
        (Side::Buy, None) => {
            tables.positions.push(SubscriptionPosition {
                subscription_id: fill.subscription_id,
                token_id: fill.token_id.clone(),
                shares: round8(fill.shares),
                avg_entry_price: fill.price,
            });
            0.0
        }
        (Side::Sell, Some(i)) => {
            let pos = &mut tables.positions[i];
            let sold = fill.shares.min(pos.shares);
            pos.shares = round8(pos.shares - sold);
            if pos.shares <= OPEN_SHARES_EPSILON {
                pos.shares = 0.0;
            }
            sold * (fill.price - pos.avg_entry_price)
        }
        (Side::Sell, None) => {
            return Err(KeeperError::not_found(format!(
                "position {} for subscription {}",
                fill.token_id, fill.subscription_id
            )));
        }
    };

    if realized != 0.0 {
        let sub = tables.subscription_mut(fill.subscription_id)?;
        sub.realized_pnl = round8(sub.realized_pnl + realized);
    }
    Ok(round8(realized))
}
