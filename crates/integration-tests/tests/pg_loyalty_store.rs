//! Ledger and MFA store properties against a real Postgres.
//!
//! These tests require:
//! - A running `PostgreSQL` database
//! - `STAMPLINE_TEST_DATABASE_URL` pointing at it (migrations are applied)
//!
//! Run with: cargo test -p stampline-integration-tests -- --ignored

#![allow(clippy::unwrap_used)]

use chrono::Utc;
use stampline_core::{MfaStatus, StampOutcome, UserId};
use stampline_guard::db::{PgLoyaltyStore, PgMfaSecretStore};
use stampline_guard::services::loyalty::{
    LedgerError, LoyaltyLedger, RedeemRequest, StampRequest,
};
use stampline_guard::services::mfa::MfaSecretStore;
use stampline_integration_tests::{
    barista, clock, signer, test_pool, unique_key, unique_user_id,
};

async fn ledger() -> LoyaltyLedger<PgLoyaltyStore> {
    let (_, shared) = clock();
    LoyaltyLedger::new(PgLoyaltyStore::new(test_pool().await), signer(shared))
}

async fn stamp_count(key: &str) -> i64 {
    let pool = test_pool().await;
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM loyalty.stamp_event WHERE idempotency_key = $1",
    )
    .bind(key)
    .fetch_one(&pool)
    .await
    .unwrap()
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_concurrent_same_key_stamps_apply_once() {
    let ledger = ledger().await;
    let user = unique_user_id();
    let token = ledger_token(user);
    let key = unique_key("order");

    let request = || StampRequest {
        qr_token: &token,
        eligible_item_count: 3.0,
        idempotency_key: Some(key.clone()),
        order_id: None,
    };
    let (a, b) = tokio::join!(
        ledger.stamp_for_customer(barista(), request()),
        ledger.stamp_for_customer(barista(), request()),
    );

    let expected = StampOutcome {
        earned: 3,
        total_stamps: 3,
    };
    assert_eq!(a.unwrap(), expected);
    assert_eq!(b.unwrap(), expected);
    assert_eq!(stamp_count(key.as_str()).await, 1);

    let account = ledger
        .account_for_customer(barista(), &token)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.stamps, 3);
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_redeem_threshold() {
    let ledger = ledger().await;
    let reward_stamps = ledger.program_settings().await.unwrap().reward_stamps();
    let user = unique_user_id();
    let token = ledger_token(user);

    ledger
        .stamp_for_customer(
            barista(),
            StampRequest {
                qr_token: &token,
                eligible_item_count: f64::from(reward_stamps - 1),
                idempotency_key: None,
                order_id: None,
            },
        )
        .await
        .unwrap();
    let card = ledger
        .account_for_customer(barista(), &token)
        .await
        .unwrap()
        .unwrap()
        .card_token;

    let result = ledger
        .redeem_for_customer(
            barista(),
            RedeemRequest {
                card_token: card.as_str(),
                idempotency_key: None,
            },
        )
        .await;
    assert!(matches!(
        result,
        Err(LedgerError::InsufficientStamps { stamps, required })
            if stamps == reward_stamps - 1 && required == reward_stamps
    ));

    ledger
        .stamp_for_customer(
            barista(),
            StampRequest {
                qr_token: &token,
                eligible_item_count: 1.0,
                idempotency_key: None,
                order_id: None,
            },
        )
        .await
        .unwrap();
    let outcome = ledger
        .redeem_for_customer(
            barista(),
            RedeemRequest {
                card_token: card.as_str(),
                idempotency_key: Some(unique_key("redeem")),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.stamps, 0);
    assert_eq!(outcome.rewards_redeemed, 1);
}

async fn redemption_count(user: UserId) -> i64 {
    let pool = test_pool().await;
    sqlx::query_scalar::<_, i64>(
        r"
        SELECT COUNT(*)
        FROM loyalty.redemption_event r
        JOIN loyalty.account a ON a.id = r.account_id
        WHERE a.user_id = $1
        ",
    )
    .bind(user.as_i32())
    .fetch_one(&pool)
    .await
    .unwrap()
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_concurrent_redemptions_with_distinct_keys_never_go_negative() {
    let ledger = ledger().await;
    let reward_stamps = ledger.program_settings().await.unwrap().reward_stamps();
    let user = unique_user_id();
    let token = ledger_token(user);

    ledger
        .stamp_for_customer(
            barista(),
            StampRequest {
                qr_token: &token,
                eligible_item_count: f64::from(reward_stamps),
                idempotency_key: None,
                order_id: None,
            },
        )
        .await
        .unwrap();
    let card = ledger
        .account_for_customer(barista(), &token)
        .await
        .unwrap()
        .unwrap()
        .card_token;

    let mut handles = Vec::new();
    for _ in 0..6 {
        let ledger = ledger.clone();
        let card = card.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .redeem_for_customer(
                    barista(),
                    RedeemRequest {
                        card_token: card.as_str(),
                        idempotency_key: Some(unique_key("redeem")),
                    },
                )
                .await
        }));
    }

    let mut redeemed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) => {
                assert_eq!(outcome.stamps, 0);
                redeemed += 1;
            }
            Err(LedgerError::InsufficientStamps { stamps: 0, required }) => {
                assert_eq!(required, reward_stamps);
            }
            Err(other) => panic!("unexpected redemption error: {other:?}"),
        }
    }

    assert_eq!(redeemed, 1);
    assert_eq!(redemption_count(user).await, 1);
    let account = ledger
        .account_for_customer(barista(), &token)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.stamps, 0);
    assert_eq!(account.rewards_redeemed, 1);
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_mfa_store_step_is_compare_and_set() {
    let store = PgMfaSecretStore::new(test_pool().await);
    let user = unique_user_id();
    let now = Utc::now();

    assert!(store.save_pending(user, "v1.sealed", now).await.unwrap());
    assert!(!store.record_step(user, 10).await.unwrap());
    assert!(store.enable(user, 10, now).await.unwrap());
    assert!(!store.save_pending(user, "v1.other", now).await.unwrap());

    assert!(!store.record_step(user, 10).await.unwrap());
    assert!(store.record_step(user, 11).await.unwrap());

    let record = store.find(user).await.unwrap().unwrap();
    assert_eq!(record.status, MfaStatus::Enabled);
    assert_eq!(record.last_used_step, Some(11));
    assert_eq!(record.encrypted_secret, "v1.sealed");

    assert!(store.delete(user).await.unwrap());
    assert!(store.find(user).await.unwrap().is_none());
}

fn ledger_token(user: UserId) -> String {
    let (_, shared) = clock();
    signer(shared).issue(user).unwrap()
}
