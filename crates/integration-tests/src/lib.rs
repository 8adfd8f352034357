//! Integration tests for Stampline.
//!
//! # Running Tests
//!
//! ```bash
//! # In-memory tests
//! cargo test -p stampline-integration-tests
//!
//! # Postgres-backed tests (ignored by default)
//! STAMPLINE_TEST_DATABASE_URL=postgres://localhost/stampline_test \
//!     cargo test -p stampline-integration-tests -- --ignored
//! ```
//!
//! # Test Categories
//!
//! - `loyalty_ledger` - stamp/redeem semantics over the in-memory store
//! - `mfa_lifecycle` - enrollment, verification and replay protection
//! - `security_primitives` - hashing, sealing, TOTP vectors, tokens, webhooks
//! - `pg_loyalty_store` - the same ledger properties against Postgres

use std::sync::Arc;

use rand::Rng;
use secrecy::SecretString;
use sqlx::PgPool;

use stampline_core::{Actor, IdempotencyKey, StaffId, StaffRole, UserId};
use stampline_guard::clock::{ManualClock, SharedClock};
use stampline_guard::crypto::{QrTokenSigner, SecretBox};
use stampline_guard::db::{self, InMemoryLoyaltyStore, InMemoryMfaSecretStore};
use stampline_guard::services::loyalty::LoyaltyLedger;
use stampline_guard::services::mfa::MfaService;
use stampline_guard::services::rate_limit::RateLimiter;

/// QR signing secret shared by the test fixtures.
pub const QR_SECRET: &str = "it-qr-Vb7Kq2Xm9Lr4Tz1Np6Wc3Hd8";
pub const MFA_KEY: &str = "it-mfa-Gs5Jy0Pu3Ek8Ra2Oi7Fn4Cw9";

/// Unix time every fixture clock starts at.
pub const START: i64 = 1_750_000_000;

/// Manual clock plus a type-erased handle to the same clock.
#[must_use]
pub fn clock() -> (Arc<ManualClock>, SharedClock) {
    let clock = Arc::new(ManualClock::at_unix(START));
    let shared: SharedClock = clock.clone();
    (clock, shared)
}

/// Signer with a 60 second lifetime.
///
/// # Panics
///
/// Never: the fixture secret and lifetime are valid.
#[must_use]
#[allow(clippy::expect_used)]
pub fn signer(clock: SharedClock) -> QrTokenSigner {
    QrTokenSigner::new(SecretString::from(QR_SECRET), 60, clock).expect("valid signer fixture")
}

/// Ledger over a fresh in-memory store.
#[must_use]
pub fn memory_ledger(clock: SharedClock) -> LoyaltyLedger<InMemoryLoyaltyStore> {
    LoyaltyLedger::new(InMemoryLoyaltyStore::new(clock.clone()), signer(clock))
}

/// MFA service over a fresh in-memory store and limiter.
///
/// # Panics
///
/// Never: the fixture key is non-empty.
#[must_use]
#[allow(clippy::expect_used)]
pub fn memory_mfa(clock: SharedClock) -> MfaService<InMemoryMfaSecretStore> {
    MfaService::new(
        InMemoryMfaSecretStore::new(),
        SecretBox::new(MFA_KEY.as_bytes()).expect("valid key fixture"),
        RateLimiter::in_memory(clock.clone()),
        clock,
        "Stampline Test",
    )
}

#[must_use]
pub const fn barista() -> Actor {
    Actor::new(StaffId::new(10), StaffRole::Staff)
}

#[must_use]
pub const fn manager() -> Actor {
    Actor::new(StaffId::new(1), StaffRole::Manager)
}

#[must_use]
pub const fn viewer() -> Actor {
    Actor::new(StaffId::new(20), StaffRole::Viewer)
}

/// Random user ID so Postgres tests do not collide across runs.
#[must_use]
pub fn unique_user_id() -> UserId {
    UserId::new(rand::rng().random_range(1_000_000..i32::MAX))
}

/// Idempotency key with a random suffix.
///
/// # Panics
///
/// Never: the prefix and suffix only use allowed characters.
#[must_use]
#[allow(clippy::expect_used)]
pub fn unique_key(prefix: &str) -> IdempotencyKey {
    let suffix: u64 = rand::rng().random();
    IdempotencyKey::parse(&format!("{prefix}-{suffix:x}")).expect("valid key fixture")
}

/// Connect to `STAMPLINE_TEST_DATABASE_URL` and apply migrations.
///
/// # Panics
///
/// Panics if the variable is unset or the database is unreachable.
#[allow(clippy::expect_used)]
pub async fn test_pool() -> PgPool {
    let url = std::env::var("STAMPLINE_TEST_DATABASE_URL")
        .expect("STAMPLINE_TEST_DATABASE_URL must be set for Postgres tests");
    let pool = db::create_pool(&SecretString::from(url))
        .await
        .expect("Failed to connect to test database");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}
