//! In-memory stores for tests and single-process tools.
//!
//! The loyalty store serializes transactions on one async mutex: `begin`
//! takes the lock and works on a copy of the state, `commit` writes the copy
//! back, and dropping the transaction discards it. That is stricter than the
//! row locks Postgres takes but gives the same observable results.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;

use stampline_core::{
    CardToken, IdempotencyKey, LoyaltyAccount, LoyaltyAccountId, MfaStatus, ProgramSettings,
    RedemptionOutcome, StaffId, StampOutcome, UserId,
};

use super::StoreError;
use crate::clock::SharedClock;
use crate::services::loyalty::{
    LoyaltyStore, LoyaltyTransaction, NewRedemptionEvent, NewStampEvent,
};
use crate::services::mfa::{MfaRecord, MfaSecretStore};

#[derive(Debug, Clone, Default)]
struct LedgerState {
    accounts: Vec<LoyaltyAccount>,
    stamp_events: Vec<NewStampEvent>,
    redemption_events: Vec<NewRedemptionEvent>,
    settings: Option<(ProgramSettings, StaffId)>,
}

impl LedgerState {
    fn account_mut(&mut self, id: LoyaltyAccountId) -> Option<&mut LoyaltyAccount> {
        self.accounts.iter_mut().find(|a| a.id == id)
    }

    fn next_account_id(&self) -> Result<LoyaltyAccountId, StoreError> {
        let next = self
            .accounts
            .len()
            .checked_add(1)
            .and_then(|n| i32::try_from(n).ok())
            .ok_or_else(|| StoreError::DataCorruption("account id overflow".to_owned()))?;
        Ok(LoyaltyAccountId::new(next))
    }

    fn key_taken<'a>(
        mut keys: impl Iterator<Item = Option<&'a IdempotencyKey>>,
        key: Option<&IdempotencyKey>,
    ) -> bool {
        key.is_some_and(|key| keys.any(|k| k == Some(key)))
    }
}

/// Loyalty store backed by process memory.
#[derive(Debug, Clone)]
pub struct InMemoryLoyaltyStore {
    state: Arc<tokio::sync::Mutex<LedgerState>>,
    clock: SharedClock,
}

impl InMemoryLoyaltyStore {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Arc::new(tokio::sync::Mutex::new(LedgerState::default())),
            clock,
        }
    }

    /// Number of committed stamp events.
    pub async fn stamp_event_count(&self) -> usize {
        self.state.lock().await.stamp_events.len()
    }

    /// Number of committed redemption events.
    pub async fn redemption_event_count(&self) -> usize {
        self.state.lock().await.redemption_events.len()
    }

    /// Committed account for a user.
    pub async fn account(&self, user_id: UserId) -> Option<LoyaltyAccount> {
        self.state
            .lock()
            .await
            .accounts
            .iter()
            .find(|a| a.user_id == user_id)
            .cloned()
    }
}

impl LoyaltyStore for InMemoryLoyaltyStore {
    type Tx = InMemoryLoyaltyTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(InMemoryLoyaltyTransaction {
            guard,
            working,
            now: self.clock.now(),
        })
    }
}

/// Open transaction on an [`InMemoryLoyaltyStore`].
#[derive(Debug)]
pub struct InMemoryLoyaltyTransaction {
    guard: OwnedMutexGuard<LedgerState>,
    working: LedgerState,
    now: DateTime<Utc>,
}

impl LoyaltyTransaction for InMemoryLoyaltyTransaction {
    async fn find_stamp_event(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<StampOutcome>, StoreError> {
        Ok(self
            .working
            .stamp_events
            .iter()
            .find(|e| e.idempotency_key.as_ref() == Some(key))
            .map(|e| StampOutcome {
                earned: e.earned,
                total_stamps: e.total_stamps,
            }))
    }

    async fn lock_or_create_account(
        &mut self,
        user_id: UserId,
        card_token: &CardToken,
    ) -> Result<LoyaltyAccount, StoreError> {
        if let Some(account) = self.working.accounts.iter().find(|a| a.user_id == user_id) {
            return Ok(account.clone());
        }
        if self
            .working
            .accounts
            .iter()
            .any(|a| &a.card_token == card_token)
        {
            return Err(StoreError::Conflict("card token already exists".to_owned()));
        }

        let account = LoyaltyAccount {
            id: self.working.next_account_id()?,
            user_id,
            stamps: 0,
            rewards_redeemed: 0,
            card_token: card_token.clone(),
            created_at: self.now,
            updated_at: self.now,
        };
        self.working.accounts.push(account.clone());
        Ok(account)
    }

    async fn find_account_by_user(
        &mut self,
        user_id: UserId,
    ) -> Result<Option<LoyaltyAccount>, StoreError> {
        Ok(self
            .working
            .accounts
            .iter()
            .find(|a| a.user_id == user_id)
            .cloned())
    }

    async fn lock_account_by_card(
        &mut self,
        card_token: &CardToken,
    ) -> Result<Option<LoyaltyAccount>, StoreError> {
        Ok(self
            .working
            .accounts
            .iter()
            .find(|a| &a.card_token == card_token)
            .cloned())
    }

    async fn update_balances(
        &mut self,
        account_id: LoyaltyAccountId,
        stamps: i32,
        rewards_redeemed: i32,
    ) -> Result<LoyaltyAccount, StoreError> {
        if stamps < 0 || rewards_redeemed < 0 {
            return Err(StoreError::Conflict(
                "balances cannot be negative".to_owned(),
            ));
        }
        let now = self.now;
        let account = self
            .working
            .account_mut(account_id)
            .ok_or_else(|| StoreError::DataCorruption(format!("account {account_id} vanished")))?;
        account.stamps = stamps;
        account.rewards_redeemed = rewards_redeemed;
        account.updated_at = now;
        Ok(account.clone())
    }

    async fn insert_stamp_event(&mut self, event: &NewStampEvent) -> Result<(), StoreError> {
        let keys = self
            .working
            .stamp_events
            .iter()
            .map(|e| e.idempotency_key.as_ref());
        if LedgerState::key_taken(keys, event.idempotency_key.as_ref()) {
            return Err(StoreError::Conflict("stamp idempotency key already exists".to_owned()));
        }
        self.working.stamp_events.push(event.clone());
        Ok(())
    }

    async fn find_redemption_event(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<RedemptionOutcome>, StoreError> {
        Ok(self
            .working
            .redemption_events
            .iter()
            .find(|e| e.idempotency_key.as_ref() == Some(key))
            .map(|e| RedemptionOutcome {
                stamps: e.stamps_after,
                rewards_redeemed: e.rewards_redeemed_after,
                reward_stamps: e.reward_stamps,
            }))
    }

    async fn program_settings(&mut self) -> Result<ProgramSettings, StoreError> {
        Ok(self
            .working
            .settings
            .map(|(settings, _)| settings)
            .unwrap_or_default())
    }

    async fn save_program_settings(
        &mut self,
        settings: ProgramSettings,
        updated_by: StaffId,
    ) -> Result<(), StoreError> {
        self.working.settings = Some((settings, updated_by));
        Ok(())
    }

    async fn insert_redemption_event(
        &mut self,
        event: &NewRedemptionEvent,
    ) -> Result<(), StoreError> {
        let keys = self
            .working
            .redemption_events
            .iter()
            .map(|e| e.idempotency_key.as_ref());
        if LedgerState::key_taken(keys, event.idempotency_key.as_ref()) {
            return Err(StoreError::Conflict(
                "redemption idempotency key already exists".to_owned(),
            ));
        }
        self.working.redemption_events.push(event.clone());
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        let Self {
            mut guard, working, ..
        } = self;
        *guard = working;
        Ok(())
    }
}

/// MFA secret store backed by process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMfaSecretStore {
    records: Arc<Mutex<HashMap<UserId, MfaRecord>>>,
}

impl InMemoryMfaSecretStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, MfaRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MfaSecretStore for InMemoryMfaSecretStore {
    async fn find(&self, user_id: UserId) -> Result<Option<MfaRecord>, StoreError> {
        Ok(self.lock().get(&user_id).cloned())
    }

    async fn save_pending(
        &self,
        user_id: UserId,
        encrypted_secret: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut records = self.lock();
        if records
            .get(&user_id)
            .is_some_and(|r| r.status == MfaStatus::Enabled)
        {
            return Ok(false);
        }
        records.insert(
            user_id,
            MfaRecord {
                user_id,
                encrypted_secret: encrypted_secret.to_owned(),
                status: MfaStatus::Pending,
                last_used_step: None,
                created_at: now,
                enabled_at: None,
            },
        );
        Ok(true)
    }

    async fn enable(
        &self,
        user_id: UserId,
        step: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut records = self.lock();
        match records.get_mut(&user_id) {
            Some(record) if record.status == MfaStatus::Pending => {
                record.status = MfaStatus::Enabled;
                record.last_used_step = Some(step);
                record.enabled_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_step(&self, user_id: UserId, step: i64) -> Result<bool, StoreError> {
        let mut records = self.lock();
        match records.get_mut(&user_id) {
            Some(record)
                if record.status == MfaStatus::Enabled
                    && record.last_used_step.is_none_or(|last| last < step) =>
            {
                record.last_used_step = Some(step);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, user_id: UserId) -> Result<bool, StoreError> {
        Ok(self.lock().remove(&user_id).is_some())
    }
}
