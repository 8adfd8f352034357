//! Idempotent loyalty stamp and redemption ledger.
//!
//! Each mutating operation runs in one store transaction that locks the
//! customer's account row, looks up the idempotency key, and only then
//! applies the change. A replayed key returns the cached outcome without
//! touching balances, so `stamps >= 0` holds under any interleaving.

mod error;
mod store;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use tracing::{info, instrument};

use stampline_core::{
    Actor, CardToken, IdempotencyKey, LoyaltyAccount, OrderId, ProgramSettings,
    RedemptionOutcome, StampOutcome,
};

pub use error::LedgerError;
pub use store::{LoyaltyStore, LoyaltyTransaction, NewRedemptionEvent, NewStampEvent};

use crate::crypto::QrTokenSigner;

/// Largest item count accepted for one stamp request.
pub const MAX_ELIGIBLE_ITEMS: f64 = 10_000.0;

const CARD_TOKEN_BYTES: usize = 16;

/// Input to [`LoyaltyLedger::stamp_for_customer`].
#[derive(Debug, Clone)]
pub struct StampRequest<'a> {
    /// Token scanned from the customer's QR code.
    pub qr_token: &'a str,
    /// Items on the order that earn stamps. Fractions are floored, negatives earn zero.
    pub eligible_item_count: f64,
    pub idempotency_key: Option<IdempotencyKey>,
    pub order_id: Option<OrderId>,
}

/// Input to [`LoyaltyLedger::redeem_for_customer`].
#[derive(Debug, Clone)]
pub struct RedeemRequest<'a> {
    /// Card token scanned at the register.
    pub card_token: &'a str,
    pub idempotency_key: Option<IdempotencyKey>,
}

/// Loyalty ledger over a transactional store.
#[derive(Debug, Clone)]
pub struct LoyaltyLedger<S> {
    store: S,
    tokens: QrTokenSigner,
}

impl<S: LoyaltyStore> LoyaltyLedger<S> {
    #[must_use]
    pub const fn new(store: S, tokens: QrTokenSigner) -> Self {
        Self { store, tokens }
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Add stamps to the account identified by a customer's QR token.
    ///
    /// The account is created with zero balances on first use.
    ///
    /// # Errors
    ///
    /// - `LedgerError::Forbidden` if the actor cannot operate the register
    /// - `LedgerError::Token` if the QR token is invalid or expired
    /// - `LedgerError::Validation` for a non-finite or oversized item count
    /// - `LedgerError::Store` on storage failure, including a conflicting
    ///   idempotency key
    #[instrument(
        skip_all,
        fields(staff_id = %actor.staff_id, idempotency_key = ?request.idempotency_key.as_ref().map(IdempotencyKey::as_str))
    )]
    pub async fn stamp_for_customer(
        &self,
        actor: Actor,
        request: StampRequest<'_>,
    ) -> Result<StampOutcome, LedgerError> {
        if !actor.role.can_operate_register() {
            return Err(LedgerError::Forbidden("add stamps"));
        }

        let user_id = self.tokens.verify(request.qr_token)?;
        let earned = stamps_earned(request.eligible_item_count)?;

        let mut tx = self.store.begin().await?;
        let account = tx.lock_or_create_account(user_id, &new_card_token()?).await?;

        if let Some(key) = &request.idempotency_key
            && let Some(cached) = tx.find_stamp_event(key).await?
        {
            info!(user_id = %user_id, "Replayed stamp request");
            return Ok(cached);
        }

        let total_stamps = account
            .stamps
            .checked_add(earned)
            .ok_or_else(|| LedgerError::Validation("stamp balance overflow".to_owned()))?;

        tx.update_balances(account.id, total_stamps, account.rewards_redeemed)
            .await?;
        tx.insert_stamp_event(&NewStampEvent {
            idempotency_key: request.idempotency_key,
            account_id: account.id,
            user_id,
            earned,
            total_stamps,
            staff_id: actor.staff_id,
            order_id: request.order_id,
        })
        .await?;
        tx.commit().await?;

        info!(user_id = %user_id, earned, total_stamps, "Stamps added");

        Ok(StampOutcome {
            earned,
            total_stamps,
        })
    }

    /// Redeem one reward from the account holding a card token.
    ///
    /// # Errors
    ///
    /// - `LedgerError::Forbidden` if the actor cannot operate the register
    /// - `LedgerError::Validation` for a malformed card token
    /// - `LedgerError::AccountNotFound` if no account holds the token
    /// - `LedgerError::InsufficientStamps` if the balance is below the threshold
    /// - `LedgerError::Store` on storage failure
    #[instrument(
        skip_all,
        fields(staff_id = %actor.staff_id, idempotency_key = ?request.idempotency_key.as_ref().map(IdempotencyKey::as_str))
    )]
    pub async fn redeem_for_customer(
        &self,
        actor: Actor,
        request: RedeemRequest<'_>,
    ) -> Result<RedemptionOutcome, LedgerError> {
        if !actor.role.can_operate_register() {
            return Err(LedgerError::Forbidden("redeem rewards"));
        }

        let card_token =
            CardToken::parse(request.card_token).map_err(|e| LedgerError::Validation(e.to_string()))?;

        let mut tx = self.store.begin().await?;

        if let Some(key) = &request.idempotency_key
            && let Some(cached) = tx.find_redemption_event(key).await?
        {
            info!("Replayed redemption request");
            return Ok(cached);
        }

        let settings = tx.program_settings().await?;
        let account = tx
            .lock_account_by_card(&card_token)
            .await?
            .ok_or(LedgerError::AccountNotFound)?;

        // A concurrent request with the same key may have committed while we waited for the lock
        if let Some(key) = &request.idempotency_key
            && let Some(cached) = tx.find_redemption_event(key).await?
        {
            info!("Replayed redemption request after lock");
            return Ok(cached);
        }

        let reward_stamps = settings.reward_stamps();
        if account.stamps < reward_stamps {
            return Err(LedgerError::InsufficientStamps {
                stamps: account.stamps,
                required: reward_stamps,
            });
        }

        let stamps = account.stamps - reward_stamps;
        let rewards_redeemed = account
            .rewards_redeemed
            .checked_add(1)
            .ok_or_else(|| LedgerError::Validation("redemption count overflow".to_owned()))?;

        tx.update_balances(account.id, stamps, rewards_redeemed)
            .await?;
        tx.insert_redemption_event(&NewRedemptionEvent {
            idempotency_key: request.idempotency_key,
            account_id: account.id,
            reward_stamps,
            stamps_after: stamps,
            rewards_redeemed_after: rewards_redeemed,
            staff_id: actor.staff_id,
        })
        .await?;
        tx.commit().await?;

        info!(user_id = %account.user_id, stamps, rewards_redeemed, "Reward redeemed");

        Ok(RedemptionOutcome {
            stamps,
            rewards_redeemed,
            reward_stamps,
        })
    }

    /// Look up the account identified by a customer's QR token.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Token` for an invalid token and
    /// `LedgerError::Store` on storage failure.
    pub async fn account_for_customer(
        &self,
        _actor: Actor,
        qr_token: &str,
    ) -> Result<Option<LoyaltyAccount>, LedgerError> {
        let user_id = self.tokens.verify(qr_token)?;
        let mut tx = self.store.begin().await?;
        Ok(tx.find_account_by_user(user_id).await?)
    }

    /// Current program settings.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Store` on storage failure.
    pub async fn program_settings(&self) -> Result<ProgramSettings, LedgerError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.program_settings().await?)
    }

    /// Change the number of stamps one reward costs.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Forbidden` unless the actor is a manager,
    /// `LedgerError::Validation` if `reward_stamps < 1`, and
    /// `LedgerError::Store` on storage failure.
    #[instrument(skip_all, fields(staff_id = %actor.staff_id, reward_stamps = reward_stamps))]
    pub async fn update_program_settings(
        &self,
        actor: Actor,
        reward_stamps: i32,
    ) -> Result<ProgramSettings, LedgerError> {
        if !actor.role.can_manage_program() {
            return Err(LedgerError::Forbidden("change program settings"));
        }
        let settings =
            ProgramSettings::new(reward_stamps).map_err(|e| LedgerError::Validation(e.to_string()))?;

        let mut tx = self.store.begin().await?;
        tx.save_program_settings(settings, actor.staff_id).await?;
        tx.commit().await?;

        info!("Program settings updated");
        Ok(settings)
    }
}

/// Whole stamps earned for `count` eligible items.
fn stamps_earned(count: f64) -> Result<i32, LedgerError> {
    if !count.is_finite() {
        return Err(LedgerError::Validation(
            "eligible item count must be a finite number".to_owned(),
        ));
    }
    if count > MAX_ELIGIBLE_ITEMS {
        return Err(LedgerError::Validation(format!(
            "eligible item count cannot exceed {MAX_ELIGIBLE_ITEMS}"
        )));
    }
    // bounded to 0..=10_000 above
    #[allow(clippy::cast_possible_truncation)]
    let earned = count.max(0.0).floor() as i32;
    Ok(earned)
}

/// Fresh random card token for a new account.
pub fn new_card_token() -> Result<CardToken, LedgerError> {
    let mut bytes = [0u8; CARD_TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    CardToken::parse(&URL_SAFE_NO_PAD.encode(bytes))
        .map_err(|e| LedgerError::Validation(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use secrecy::SecretString;
    use stampline_core::{StaffId, StaffRole, UserId};

    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::db::InMemoryLoyaltyStore;

    const SECRET: &str = "ledger-test-secret-Zx81Qm2Lp0Vr7Tn4";

    fn setup() -> (LoyaltyLedger<InMemoryLoyaltyStore>, QrTokenSigner) {
        let clock: SharedClock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let signer = QrTokenSigner::new(SecretString::from(SECRET), 60, clock.clone()).unwrap();
        let ledger = LoyaltyLedger::new(InMemoryLoyaltyStore::new(clock), signer.clone());
        (ledger, signer)
    }

    fn barista() -> Actor {
        Actor::new(StaffId::new(10), StaffRole::Staff)
    }

    fn manager() -> Actor {
        Actor::new(StaffId::new(1), StaffRole::Manager)
    }

    fn key(s: &str) -> Option<IdempotencyKey> {
        Some(IdempotencyKey::parse(s).unwrap())
    }

    async fn stamp(
        ledger: &LoyaltyLedger<InMemoryLoyaltyStore>,
        token: &str,
        count: f64,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<StampOutcome, LedgerError> {
        ledger
            .stamp_for_customer(
                barista(),
                StampRequest {
                    qr_token: token,
                    eligible_item_count: count,
                    idempotency_key,
                    order_id: None,
                },
            )
            .await
    }

    #[test]
    fn test_stamps_earned() {
        assert_eq!(stamps_earned(3.0).unwrap(), 3);
        assert_eq!(stamps_earned(2.9).unwrap(), 2);
        assert_eq!(stamps_earned(-4.0).unwrap(), 0);
        assert_eq!(stamps_earned(10_000.0).unwrap(), 10_000);
        assert!(stamps_earned(10_000.5).is_err());
        assert!(stamps_earned(f64::NAN).is_err());
        assert!(stamps_earned(f64::INFINITY).is_err());
    }

    #[test]
    fn test_new_card_token_shape() {
        let token = new_card_token().unwrap();
        assert_eq!(token.as_str().len(), 22);
        assert_ne!(new_card_token().unwrap(), token);
    }

    #[tokio::test]
    async fn test_stamp_creates_account_and_accumulates() {
        let (ledger, signer) = setup();
        let token = signer.issue(UserId::new(7)).unwrap();

        let first = stamp(&ledger, &token, 2.0, None).await.unwrap();
        assert_eq!(first, StampOutcome { earned: 2, total_stamps: 2 });

        let second = stamp(&ledger, &token, 1.5, None).await.unwrap();
        assert_eq!(second, StampOutcome { earned: 1, total_stamps: 3 });

        let account = ledger
            .account_for_customer(barista(), &token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.stamps, 3);
        assert_eq!(account.user_id, UserId::new(7));
    }

    #[tokio::test]
    async fn test_replayed_stamp_key_returns_cached_result() {
        let (ledger, signer) = setup();
        let token = signer.issue(UserId::new(7)).unwrap();

        let first = stamp(&ledger, &token, 3.0, key("order-991")).await.unwrap();
        let replay = stamp(&ledger, &token, 8.0, key("order-991")).await.unwrap();

        assert_eq!(first, replay);
        assert_eq!(ledger.store().stamp_event_count().await, 1);
    }

    #[tokio::test]
    async fn test_viewer_cannot_stamp_or_redeem() {
        let (ledger, signer) = setup();
        let viewer = Actor::new(StaffId::new(3), StaffRole::Viewer);
        let token = signer.issue(UserId::new(7)).unwrap();

        let result = ledger
            .stamp_for_customer(
                viewer,
                StampRequest {
                    qr_token: &token,
                    eligible_item_count: 1.0,
                    idempotency_key: None,
                    order_id: None,
                },
            )
            .await;
        assert!(matches!(result, Err(LedgerError::Forbidden(_))));

        let result = ledger
            .redeem_for_customer(
                viewer,
                RedeemRequest {
                    card_token: "AAAAAAAAAAAAAAAAAAAAAA",
                    idempotency_key: None,
                },
            )
            .await;
        assert!(matches!(result, Err(LedgerError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let (ledger, _) = setup();
        let result = stamp(&ledger, "not-a-token", 1.0, None).await;
        assert!(matches!(result, Err(LedgerError::Token(_))));
    }

    #[tokio::test]
    async fn test_redeem_at_threshold_and_below() {
        let (ledger, signer) = setup();
        let token = signer.issue(UserId::new(7)).unwrap();
        stamp(&ledger, &token, 5.0, None).await.unwrap();
        let account = ledger
            .account_for_customer(barista(), &token)
            .await
            .unwrap()
            .unwrap();

        let redeem = |k: Option<IdempotencyKey>| {
            let card = account.card_token.clone();
            let ledger = &ledger;
            async move {
                ledger
                    .redeem_for_customer(
                        barista(),
                        RedeemRequest {
                            card_token: card.as_str(),
                            idempotency_key: k,
                        },
                    )
                    .await
            }
        };

        let outcome = redeem(key("redeem-1")).await.unwrap();
        assert_eq!(
            outcome,
            RedemptionOutcome {
                stamps: 0,
                rewards_redeemed: 1,
                reward_stamps: 5
            }
        );

        // Same key replays without consuming stamps again
        assert_eq!(redeem(key("redeem-1")).await.unwrap(), outcome);

        stamp(&ledger, &token, 4.0, None).await.unwrap();
        match redeem(key("redeem-2")).await {
            Err(LedgerError::InsufficientStamps { stamps, required }) => {
                assert_eq!((stamps, required), (4, 5));
            }
            other => panic!("expected insufficient stamps, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_redeem_unknown_or_malformed_card() {
        let (ledger, _) = setup();
        let result = ledger
            .redeem_for_customer(
                barista(),
                RedeemRequest {
                    card_token: "AAAAAAAAAAAAAAAAAAAAAA",
                    idempotency_key: None,
                },
            )
            .await;
        assert!(matches!(result, Err(LedgerError::AccountNotFound)));

        let result = ledger
            .redeem_for_customer(
                barista(),
                RedeemRequest {
                    card_token: "short",
                    idempotency_key: None,
                },
            )
            .await;
        assert!(matches!(result, Err(LedgerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_program_settings_threshold() {
        let (ledger, signer) = setup();
        assert_eq!(ledger.program_settings().await.unwrap().reward_stamps(), 5);

        assert!(matches!(
            ledger.update_program_settings(barista(), 3).await,
            Err(LedgerError::Forbidden(_))
        ));
        assert!(matches!(
            ledger.update_program_settings(manager(), 0).await,
            Err(LedgerError::Validation(_))
        ));

        ledger.update_program_settings(manager(), 3).await.unwrap();
        assert_eq!(ledger.program_settings().await.unwrap().reward_stamps(), 3);

        let token = signer.issue(UserId::new(9)).unwrap();
        stamp(&ledger, &token, 3.0, None).await.unwrap();
        let card = ledger
            .account_for_customer(barista(), &token)
            .await
            .unwrap()
            .unwrap()
            .card_token;
        let outcome = ledger
            .redeem_for_customer(
                manager(),
                RedeemRequest {
                    card_token: card.as_str(),
                    idempotency_key: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.stamps, 0);
        assert_eq!(outcome.reward_stamps, 3);
    }

    #[tokio::test]
    async fn test_account_lookup_without_account() {
        let (ledger, signer) = setup();
        let token = signer.issue(UserId::new(99)).unwrap();
        assert!(
            ledger
                .account_for_customer(barista(), &token)
                .await
                .unwrap()
                .is_none()
        );
    }
}
