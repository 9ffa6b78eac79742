//! Concurrent guaranteed subscriptions against one reserve

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use wealth_keeper::config::{ProductConfig, SubscriptionConfig, TermConfig};
use wealth_keeper::lifecycle::{NewSubscription, SubscriptionLifecycle};
use wealth_keeper::lock::KeyedLocks;
use wealth_keeper::price::StaticPriceSource;
use wealth_keeper::reserve::ReserveLedger;
use wealth_keeper::types::ReserveEntryType;
use wealth_keeper::{Catalog, KeeperError, MemoryStore};

fn guaranteed_catalog(coverage_min: f64) -> Catalog {
    let product = ProductConfig {
        id: "shield".into(),
        slug: "shield".into(),
        name: "Shield".into(),
        is_guaranteed: true,
        is_active: true,
        reserve_coverage_min: coverage_min,
        performance_fee_rate: 0.2,
        terms: vec![TermConfig {
            id: "30d".into(),
            label: "30 days".into(),
            duration_days: 30,
            min_yield_rate: Some(0.05),
            performance_fee_rate: None,
            max_subscription_amount: None,
            is_active: true,
        }],
    };
    Catalog::new(vec![product.into()])
}

fn request(wallet: String) -> NewSubscription {
    NewSubscription {
        wallet_address: wallet,
        product_id: Some("shield".into()),
        product_slug: None,
        term_id: "30d".into(),
        principal: 1_000.0,
        accepted_terms: true,
        copy_config_id: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_accept_exactly_one() {
    let store = Arc::new(MemoryStore::new());
    // 60 covers one 50 liability at ratio 1.2, but not two
    ReserveLedger::new(store.clone())
        .append(ReserveEntryType::Deposit, 60.0, None, Utc::now())
        .unwrap();
    let lifecycle = Arc::new(SubscriptionLifecycle::new(
        store.clone(),
        Arc::new(KeyedLocks::new()),
        guaranteed_catalog(1.0),
        SubscriptionConfig::default(),
        0.2,
        Arc::new(StaticPriceSource::new(HashMap::new())),
        Duration::from_millis(100),
    ));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.create(request(format!("0xwallet{}", i)), Utc::now()).await })
        })
        .collect();

    let mut accepted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(KeeperError::ReserveCoverage { required_ratio, .. }) => {
                assert_eq!(required_ratio, 1.0);
                rejected += 1;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(rejected, 7);
    assert_eq!(store.read(|t| t.subscriptions.len()), 1);
}

#[tokio::test]
async fn test_reference_coverage_scenario() {
    // 100,000 reserve against 80,000 existing liability plus 5,000 at 5%
    for (min, expect_ok) in [(1.2, true), (1.3, false)] {
        let store = Arc::new(MemoryStore::new());
        ReserveLedger::new(store.clone())
            .append(ReserveEntryType::Deposit, 100_000.0, None, Utc::now())
            .unwrap();
        let lifecycle = SubscriptionLifecycle::new(
            store.clone(),
            Arc::new(KeyedLocks::new()),
            guaranteed_catalog(0.0),
            SubscriptionConfig::default(),
            0.2,
            Arc::new(StaticPriceSource::new(HashMap::new())),
            Duration::from_millis(100),
        );
        // Existing book: 1.6M at 5% from one seeding wallet, accepted at min 0
        let mut seed = request("0xseed".into());
        seed.principal = 1_600_000.0;
        lifecycle.create(seed, Utc::now()).await.unwrap();

        let guarded = SubscriptionLifecycle::new(
            store.clone(),
            Arc::new(KeyedLocks::new()),
            guaranteed_catalog(min),
            SubscriptionConfig::default(),
            0.2,
            Arc::new(StaticPriceSource::new(HashMap::new())),
            Duration::from_millis(100),
        );
        let mut req = request("0xnew".into());
        req.principal = 5_000.0;
        match guarded.create(req, Utc::now()).await {
            Ok(created) => {
                assert!(expect_ok);
                let coverage = created.reserve_coverage.unwrap();
                assert_eq!(coverage.existing_liability, 80_000.0);
                assert_eq!(coverage.additional_liability, 250.0);
                assert!((coverage.coverage_ratio - 1.246).abs() < 0.001);
            }
            Err(KeeperError::ReserveCoverage { coverage, required_ratio }) => {
                assert!(!expect_ok);
                assert_eq!(required_ratio, 1.3);
                assert_eq!(coverage.projected_liability, 80_250.0);
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}
