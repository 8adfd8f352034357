//! Transactional storage interface for the loyalty ledger.
//!
//! A [`LoyaltyTransaction`] is an open unit of work. Dropping it without
//! calling [`LoyaltyTransaction::commit`] rolls back every write made through
//! it. Account locks taken inside a transaction are held until it ends.

use std::future::Future;

use stampline_core::{
    CardToken, IdempotencyKey, LoyaltyAccount, LoyaltyAccountId, OrderId, ProgramSettings,
    RedemptionOutcome, StaffId, StampOutcome, UserId,
};

use crate::db::StoreError;

/// A stamp accrual to persist.
#[derive(Debug, Clone)]
pub struct NewStampEvent {
    pub idempotency_key: Option<IdempotencyKey>,
    pub account_id: LoyaltyAccountId,
    pub user_id: UserId,
    pub earned: i32,
    pub total_stamps: i32,
    pub staff_id: StaffId,
    pub order_id: Option<OrderId>,
}

/// A reward redemption to persist.
#[derive(Debug, Clone)]
pub struct NewRedemptionEvent {
    pub idempotency_key: Option<IdempotencyKey>,
    pub account_id: LoyaltyAccountId,
    pub reward_stamps: i32,
    pub stamps_after: i32,
    pub rewards_redeemed_after: i32,
    pub staff_id: StaffId,
}

/// Opens loyalty transactions.
pub trait LoyaltyStore: Send + Sync {
    type Tx: LoyaltyTransaction;

    fn begin(&self) -> impl Future<Output = Result<Self::Tx, StoreError>> + Send;
}

/// Operations available inside one loyalty transaction.
pub trait LoyaltyTransaction: Send {
    /// Result cached for a previous stamp with this key.
    fn find_stamp_event(
        &mut self,
        key: &IdempotencyKey,
    ) -> impl Future<Output = Result<Option<StampOutcome>, StoreError>> + Send;

    /// Lock the user's account, creating it with zero balances and
    /// `card_token` if it does not exist yet.
    fn lock_or_create_account(
        &mut self,
        user_id: UserId,
        card_token: &CardToken,
    ) -> impl Future<Output = Result<LoyaltyAccount, StoreError>> + Send;

    /// Read the user's account without locking it.
    fn find_account_by_user(
        &mut self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Option<LoyaltyAccount>, StoreError>> + Send;

    /// Lock the account holding `card_token`.
    fn lock_account_by_card(
        &mut self,
        card_token: &CardToken,
    ) -> impl Future<Output = Result<Option<LoyaltyAccount>, StoreError>> + Send;

    /// Overwrite a locked account's balances.
    fn update_balances(
        &mut self,
        account_id: LoyaltyAccountId,
        stamps: i32,
        rewards_redeemed: i32,
    ) -> impl Future<Output = Result<LoyaltyAccount, StoreError>> + Send;

    /// Persist a stamp event. A reused idempotency key is `StoreError::Conflict`.
    fn insert_stamp_event(
        &mut self,
        event: &NewStampEvent,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Result cached for a previous redemption with this key.
    fn find_redemption_event(
        &mut self,
        key: &IdempotencyKey,
    ) -> impl Future<Output = Result<Option<RedemptionOutcome>, StoreError>> + Send;

    /// Current program settings, or the defaults if none are stored.
    fn program_settings(
        &mut self,
    ) -> impl Future<Output = Result<ProgramSettings, StoreError>> + Send;

    fn save_program_settings(
        &mut self,
        settings: ProgramSettings,
        updated_by: StaffId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Persist a redemption event. A reused idempotency key is `StoreError::Conflict`.
    fn insert_redemption_event(
        &mut self,
        event: &NewRedemptionEvent,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}
