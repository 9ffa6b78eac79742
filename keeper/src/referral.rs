//! One-time referral bonus
//!
//! When a referred wallet subscribes, the referrer's RUNNING subscription
//! that ends soonest is extended. Each referee grants the bonus at most once.

use chrono::{DateTime, Duration, Utc};
use log::info;
use uuid::Uuid;

use crate::error::{KeeperError, Result};
use crate::store::Tables;
use crate::types::{normalize_wallet, Referral, SubscriptionStatus};

/// Record that `referee` was referred by `referrer`.
pub fn register_referral_in(tables: &mut Tables, referee: &str, referrer: &str) -> Result<Referral> {
    let referee = normalize_wallet(referee);
    let referrer = normalize_wallet(referrer);
    if referee.is_empty() || referrer.is_empty() {
        return Err(KeeperError::validation("referee and referrer wallets are required"));
    }
    if referee == referrer {
        return Err(KeeperError::validation("a wallet cannot refer itself"));
    }
    if tables.referrals.iter().any(|r| r.referee_wallet == referee) {
        return Err(KeeperError::conflict(format!("{} already has a referrer", referee)));
    }
    let referral = Referral {
        referee_wallet: referee,
        referrer_wallet: referrer,
        bonus_granted_at: None,
    };
    tables.referrals.push(referral.clone());
    Ok(referral)
}

/// Grant the referee's pending bonus, if any. Returns the extended
/// subscription.
pub fn apply_referral_bonus_in(
    tables: &mut Tables,
    referee: &str,
    bonus_days: i64,
    now: DateTime<Utc>,
) -> Option<Uuid> {
    let referee = normalize_wallet(referee);
    let idx = tables
        .referrals
        .iter()
        .position(|r| r.referee_wallet == referee && r.bonus_granted_at.is_none())?;
    let referrer = tables.referrals[idx].referrer_wallet.clone();

    let target = tables
        .subscriptions
        .values_mut()
        .filter(|s| {
            s.wallet_address == referrer && s.status == SubscriptionStatus::Running && s.end_at > now
        })
        .min_by_key(|s| s.end_at)?;

    let bonus = Duration::days(bonus_days);
    target.end_at += bonus;
    // A trial keeps covering its whole term
    if let Some(trial_end) = target.trial_ends_at.as_mut() {
        *trial_end += bonus;
    }
    target.updated_at = now;
    let extended = target.id;
    tables.referrals[idx].bonus_granted_at = Some(now);

    info!(
        "[Referral] {} subscribed; extended {}'s subscription {} by {} day(s)",
        referee, referrer, extended, bonus_days
    );
    Some(extended)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManagedSubscription;

    fn running(wallet: &str, ends_in_days: i64, now: DateTime<Utc>) -> ManagedSubscription {
        ManagedSubscription {
            id: Uuid::new_v4(),
            wallet_address: wallet.into(),
            product_id: "p".into(),
            term_id: "t".into(),
            principal: 1_000.0,
            status: SubscriptionStatus::Running,
            high_water_mark: 1_000.0,
            current_equity: 1_000.0,
            realized_pnl: 0.0,
            guaranteed_min_yield: None,
            performance_fee_rate: 0.2,
            start_at: now,
            end_at: now + Duration::days(ends_in_days),
            matured_at: None,
            liquidation_started_at: None,
            is_trial: false,
            trial_ends_at: None,
            copy_config_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_bonus_extends_earliest_running_once() {
        let now = Utc::now();
        let mut t = Tables::default();
        let soon = running("0xref", 3, now);
        let later = running("0xref", 30, now);
        let soon_id = soon.id;
        let soon_end = soon.end_at;
        t.subscriptions.insert(soon.id, soon);
        t.subscriptions.insert(later.id, later);
        register_referral_in(&mut t, "0xNEW", "0xREF").unwrap();

        assert_eq!(apply_referral_bonus_in(&mut t, "0xnew", 1, now), Some(soon_id));
        assert_eq!(t.subscriptions[&soon_id].end_at, soon_end + Duration::days(1));

        // Second subscription by the same referee grants nothing
        assert_eq!(apply_referral_bonus_in(&mut t, "0xnew", 1, now), None);
        assert_eq!(t.subscriptions[&soon_id].end_at, soon_end + Duration::days(1));
    }

    #[test]
    fn test_bonus_on_trial_keeps_fee_waiver() {
        let now = Utc::now();
        let mut t = Tables::default();
        let mut trial = running("0xref", 1, now);
        trial.is_trial = true;
        trial.trial_ends_at = Some(trial.end_at);
        let id = trial.id;
        t.subscriptions.insert(id, trial);
        register_referral_in(&mut t, "0xnew", "0xref").unwrap();

        assert_eq!(apply_referral_bonus_in(&mut t, "0xnew", 1, now), Some(id));
        let sub = &t.subscriptions[&id];
        assert_eq!(sub.trial_ends_at, Some(sub.end_at));
        assert_eq!(sub.effective_fee_rate(), 0.0);
    }

    #[test]
    fn test_no_running_subscription_keeps_bonus_pending() {
        let now = Utc::now();
        let mut t = Tables::default();
        register_referral_in(&mut t, "0xnew", "0xref").unwrap();
        assert_eq!(apply_referral_bonus_in(&mut t, "0xnew", 1, now), None);
        assert!(t.referrals[0].bonus_granted_at.is_none());
    }

    #[test]
    fn test_register_rejects_self_and_duplicates() {
        let mut t = Tables::default();
        assert!(matches!(
            register_referral_in(&mut t, "0xa", "0xA"),
            Err(KeeperError::Validation(_))
        ));
        register_referral_in(&mut t, "0xa", "0xb").unwrap();
        assert!(matches!(
            register_referral_in(&mut t, "0xa", "0xc"),
            Err(KeeperError::Conflict(_))
        ));
    }
}
