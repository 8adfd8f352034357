//! Postgres MFA secret store.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use stampline_core::{MfaStatus, UserId};

use super::StoreError;
use crate::services::mfa::{MfaRecord, MfaSecretStore};

#[derive(Debug, sqlx::FromRow)]
struct MfaRow {
    user_id: i32,
    encrypted_secret: String,
    status: String,
    last_used_step: Option<i64>,
    created_at: DateTime<Utc>,
    enabled_at: Option<DateTime<Utc>>,
}

impl TryFrom<MfaRow> for MfaRecord {
    type Error = StoreError;

    fn try_from(row: MfaRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<MfaStatus>()
            .map_err(StoreError::DataCorruption)?;
        Ok(Self {
            user_id: UserId::new(row.user_id),
            encrypted_secret: row.encrypted_secret,
            status,
            last_used_step: row.last_used_step,
            created_at: row.created_at,
            enabled_at: row.enabled_at,
        })
    }
}

/// MFA secret store on a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgMfaSecretStore {
    pool: PgPool,
}

impl PgMfaSecretStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl MfaSecretStore for PgMfaSecretStore {
    async fn find(&self, user_id: UserId) -> Result<Option<MfaRecord>, StoreError> {
        let row = sqlx::query_as::<_, MfaRow>(
            r"
            SELECT user_id, encrypted_secret, status, last_used_step, created_at, enabled_at
            FROM auth.mfa_secret
            WHERE user_id = $1
            ",
        )
        .bind(user_id.as_i32())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn save_pending(
        &self,
        user_id: UserId,
        encrypted_secret: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        // The conditional upsert leaves enabled rows untouched
        let result = sqlx::query(
            r"
            INSERT INTO auth.mfa_secret (user_id, encrypted_secret, status, created_at)
            VALUES ($1, $2, 'pending', $3)
            ON CONFLICT (user_id) DO UPDATE
            SET encrypted_secret = EXCLUDED.encrypted_secret,
                created_at = EXCLUDED.created_at,
                last_used_step = NULL,
                enabled_at = NULL
            WHERE auth.mfa_secret.status = 'pending'
            ",
        )
        .bind(user_id.as_i32())
        .bind(encrypted_secret)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn enable(
        &self,
        user_id: UserId,
        step: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE auth.mfa_secret
            SET status = 'enabled', last_used_step = $2, enabled_at = $3
            WHERE user_id = $1 AND status = 'pending'
            ",
        )
        .bind(user_id.as_i32())
        .bind(step)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_step(&self, user_id: UserId, step: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE auth.mfa_secret
            SET last_used_step = $2
            WHERE user_id = $1
              AND status = 'enabled'
              AND (last_used_step IS NULL OR last_used_step < $2)
            ",
        )
        .bind(user_id.as_i32())
        .bind(step)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, user_id: UserId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM auth.mfa_secret WHERE user_id = $1")
            .bind(user_id.as_i32())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
