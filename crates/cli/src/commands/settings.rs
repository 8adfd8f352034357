//! Loyalty program settings.
//!
//! # Usage
//!
//! ```bash
//! sl-cli settings show
//! sl-cli settings reward-stamps 8 --staff 1
//! ```
//!
//! Changes go through the ledger with a manager actor, so they are validated
//! and attributed the same way as changes made from the back office.

use std::sync::Arc;

use stampline_core::{Actor, StaffId, StaffRole};
use stampline_guard::clock::SystemClock;
use stampline_guard::config::{ConfigError, GuardConfig};
use stampline_guard::db;
use stampline_guard::services::loyalty::LedgerError;
use stampline_guard::state::{AppState, StateError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database connection error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

async fn connect() -> Result<AppState, SettingsError> {
    let config = GuardConfig::from_env()?;

    tracing::info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url).await?;

    Ok(AppState::new(config, pool, Arc::new(SystemClock))?)
}

/// Print the current settings.
///
/// # Errors
///
/// Returns an error if configuration is invalid or the database is unreachable.
pub async fn show() -> Result<(), SettingsError> {
    let state = connect().await?;
    let settings = state.ledger().program_settings().await?;

    tracing::info!("Stamps per reward: {}", settings.reward_stamps());
    Ok(())
}

/// Set the number of stamps one reward costs.
///
/// # Errors
///
/// Returns an error if `reward_stamps < 1`, configuration is invalid, or the
/// database is unreachable.
pub async fn set_reward_stamps(reward_stamps: i32, staff_id: i32) -> Result<(), SettingsError> {
    let state = connect().await?;
    let actor = Actor::new(StaffId::new(staff_id), StaffRole::Manager);

    let settings = state
        .ledger()
        .update_program_settings(actor, reward_stamps)
        .await?;

    tracing::info!(
        "Program settings saved: {} stamps per reward (staff {})",
        settings.reward_stamps(),
        staff_id
    );
    Ok(())
}
