//! Persistence for loyalty balances and MFA secrets.
//!
//! # Schemas
//!
//! - `loyalty.account` - one row per customer, `stamps >= 0`
//! - `loyalty.program_settings` - single row holding the reward threshold
//! - `loyalty.stamp_event` / `loyalty.redemption_event` - audit trail, unique
//!   idempotency keys
//! - `auth.mfa_secret` - encrypted TOTP secrets and replay guard
//!
//! # Migrations
//!
//! Migrations are stored in `crates/guard/migrations/` and run via:
//! ```bash
//! sl-cli migrate
//! ```
//!
//! Every store has a Postgres implementation and an in-memory one with the
//! same locking semantics, used by tests and single-process tools.

pub mod loyalty;
pub mod memory;
pub mod mfa;

use std::time::Duration;

use secrecy::ExposeSecret;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

pub use loyalty::PgLoyaltyStore;
pub use memory::{InMemoryLoyaltyStore, InMemoryMfaSecretStore};
pub use mfa::PgMfaSecretStore;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data in the database is corrupted or invalid.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Constraint violation (e.g., a reused idempotency key).
    #[error("constraint violation: {0}")]
    Conflict(String),
}

impl StoreError {
    /// Map a sqlx error, turning unique violations into `Conflict`.
    pub(crate) fn from_write(err: sqlx::Error, what: &str) -> Self {
        if let sqlx::Error::Database(ref db_err) = err
            && db_err.is_unique_violation()
        {
            return Self::Conflict(format!("{what} already exists"));
        }
        Self::Database(err)
    }
}

/// Create a `PostgreSQL` connection pool with sensible defaults.
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(database_url: &secrecy::SecretString) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}

/// Apply the bundled migrations.
///
/// # Errors
///
/// Returns `sqlx::migrate::MigrateError` if a migration fails.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
