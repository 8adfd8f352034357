//! Postgres loyalty store.
//!
//! Account rows are locked with `SELECT ... FOR UPDATE` for the rest of the
//! transaction. New accounts are inserted with `ON CONFLICT DO NOTHING` and
//! then locked, so two first-time requests for the same user converge on one
//! row.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use stampline_core::{
    CardToken, IdempotencyKey, LoyaltyAccount, LoyaltyAccountId, ProgramSettings,
    RedemptionOutcome, StaffId, StampOutcome, UserId,
};

use super::StoreError;
use crate::services::loyalty::{
    LoyaltyStore, LoyaltyTransaction, NewRedemptionEvent, NewStampEvent,
};

const ACCOUNT_COLUMNS: &str =
    "id, user_id, stamps, rewards_redeemed, card_token, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: i32,
    user_id: i32,
    stamps: i32,
    rewards_redeemed: i32,
    card_token: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for LoyaltyAccount {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        let card_token = CardToken::parse(&row.card_token).map_err(|e| {
            StoreError::DataCorruption(format!("invalid card token in database: {e}"))
        })?;
        Ok(Self {
            id: LoyaltyAccountId::new(row.id),
            user_id: UserId::new(row.user_id),
            stamps: row.stamps,
            rewards_redeemed: row.rewards_redeemed,
            card_token,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StampEventRow {
    earned: i32,
    total_stamps: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct RedemptionEventRow {
    reward_stamps: i32,
    stamps_after: i32,
    rewards_redeemed_after: i32,
}

/// Loyalty store on a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgLoyaltyStore {
    pool: PgPool,
}

impl PgLoyaltyStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl LoyaltyStore for PgLoyaltyStore {
    type Tx = PgLoyaltyTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(PgLoyaltyTransaction {
            tx: self.pool.begin().await?,
        })
    }
}

/// Open Postgres transaction. Rolls back on drop.
pub struct PgLoyaltyTransaction {
    tx: Transaction<'static, Postgres>,
}

impl std::fmt::Debug for PgLoyaltyTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgLoyaltyTransaction").finish_non_exhaustive()
    }
}

impl LoyaltyTransaction for PgLoyaltyTransaction {
    async fn find_stamp_event(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<StampOutcome>, StoreError> {
        let row = sqlx::query_as::<_, StampEventRow>(
            r"
            SELECT earned, total_stamps
            FROM loyalty.stamp_event
            WHERE idempotency_key = $1
            ",
        )
        .bind(key.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(|r| StampOutcome {
            earned: r.earned,
            total_stamps: r.total_stamps,
        }))
    }

    async fn lock_or_create_account(
        &mut self,
        user_id: UserId,
        card_token: &CardToken,
    ) -> Result<LoyaltyAccount, StoreError> {
        sqlx::query(
            r"
            INSERT INTO loyalty.account (user_id, card_token)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO NOTHING
            ",
        )
        .bind(user_id.as_i32())
        .bind(card_token.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| StoreError::from_write(e, "card token"))?;

        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM loyalty.account WHERE user_id = $1 FOR UPDATE"
        ))
        .bind(user_id.as_i32())
        .fetch_one(&mut *self.tx)
        .await?;

        row.try_into()
    }

    async fn find_account_by_user(
        &mut self,
        user_id: UserId,
    ) -> Result<Option<LoyaltyAccount>, StoreError> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM loyalty.account WHERE user_id = $1"
        ))
        .bind(user_id.as_i32())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn lock_account_by_card(
        &mut self,
        card_token: &CardToken,
    ) -> Result<Option<LoyaltyAccount>, StoreError> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM loyalty.account WHERE card_token = $1 FOR UPDATE"
        ))
        .bind(card_token.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn update_balances(
        &mut self,
        account_id: LoyaltyAccountId,
        stamps: i32,
        rewards_redeemed: i32,
    ) -> Result<LoyaltyAccount, StoreError> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            r"
            UPDATE loyalty.account
            SET stamps = $2, rewards_redeemed = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING {ACCOUNT_COLUMNS}
            "
        ))
        .bind(account_id.as_i32())
        .bind(stamps)
        .bind(rewards_redeemed)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| StoreError::DataCorruption(format!("account {account_id} vanished")))?;

        row.try_into()
    }

    async fn insert_stamp_event(&mut self, event: &NewStampEvent) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO loyalty.stamp_event (
                idempotency_key, account_id, user_id, earned, total_stamps, staff_id, order_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(event.idempotency_key.as_ref().map(IdempotencyKey::as_str))
        .bind(event.account_id.as_i32())
        .bind(event.user_id.as_i32())
        .bind(event.earned)
        .bind(event.total_stamps)
        .bind(event.staff_id.as_i32())
        .bind(event.order_id.map(|id| id.as_i32()))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| StoreError::from_write(e, "stamp idempotency key"))?;

        Ok(())
    }

    async fn find_redemption_event(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<RedemptionOutcome>, StoreError> {
        let row = sqlx::query_as::<_, RedemptionEventRow>(
            r"
            SELECT reward_stamps, stamps_after, rewards_redeemed_after
            FROM loyalty.redemption_event
            WHERE idempotency_key = $1
            ",
        )
        .bind(key.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(|r| RedemptionOutcome {
            stamps: r.stamps_after,
            rewards_redeemed: r.rewards_redeemed_after,
            reward_stamps: r.reward_stamps,
        }))
    }

    async fn program_settings(&mut self) -> Result<ProgramSettings, StoreError> {
        let reward_stamps = sqlx::query_scalar::<_, i32>(
            "SELECT reward_stamps FROM loyalty.program_settings WHERE id = 1",
        )
        .fetch_optional(&mut *self.tx)
        .await?;

        match reward_stamps {
            Some(n) => ProgramSettings::new(n).map_err(|e| {
                StoreError::DataCorruption(format!("invalid program settings in database: {e}"))
            }),
            None => Ok(ProgramSettings::default()),
        }
    }

    async fn save_program_settings(
        &mut self,
        settings: ProgramSettings,
        updated_by: StaffId,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO loyalty.program_settings (id, reward_stamps, updated_by)
            VALUES (1, $1, $2)
            ON CONFLICT (id) DO UPDATE
            SET reward_stamps = EXCLUDED.reward_stamps,
                updated_by = EXCLUDED.updated_by,
                updated_at = NOW()
            ",
        )
        .bind(settings.reward_stamps())
        .bind(updated_by.as_i32())
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn insert_redemption_event(
        &mut self,
        event: &NewRedemptionEvent,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO loyalty.redemption_event (
                idempotency_key, account_id, reward_stamps, stamps_after,
                rewards_redeemed_after, staff_id
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(event.idempotency_key.as_ref().map(IdempotencyKey::as_str))
        .bind(event.account_id.as_i32())
        .bind(event.reward_stamps)
        .bind(event.stamps_after)
        .bind(event.rewards_redeemed_after)
        .bind(event.staff_id.as_i32())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| StoreError::from_write(e, "redemption idempotency key"))?;

        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
