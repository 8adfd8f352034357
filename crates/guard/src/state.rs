//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use sqlx::PgPool;

use crate::clock::SharedClock;
use crate::config::GuardConfig;
use crate::crypto::{
    PasswordHasher, QrTokenSigner, SecretBox, SecretBoxError, TokenError, WebhookError,
    WebhookVerifier,
};
use crate::db::{PgLoyaltyStore, PgMfaSecretStore};
use crate::services::loyalty::LoyaltyLedger;
use crate::services::mfa::MfaService;
use crate::services::rate_limit::{InMemoryRateLimitStore, RateLimiter};

/// How often expired rate limit counters are swept.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Error building application state from configuration.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("invalid QR token settings: {0}")]
    QrToken(#[from] TokenError),
    #[error("invalid MFA encryption key: {0}")]
    SecretBox(#[from] SecretBoxError),
    #[error("invalid webhook settings: {0}")]
    Webhook(#[from] WebhookError),
}

/// Application state shared across all handlers.
///
/// This struct is cheaply cloneable via `Arc` and provides access to
/// the ledger, MFA service and verifiers built from configuration.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: GuardConfig,
    pool: PgPool,
    clock: SharedClock,
    ledger: LoyaltyLedger<PgLoyaltyStore>,
    mfa: MfaService<PgMfaSecretStore>,
    webhooks: WebhookVerifier,
    passwords: PasswordHasher,
    limiter: RateLimiter,
    rate_limit_store: Arc<InMemoryRateLimitStore>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Create a new application state.
    ///
    /// # Arguments
    ///
    /// * `config` - Loaded configuration
    /// * `pool` - `PostgreSQL` connection pool
    /// * `clock` - Time source for token expiry, TOTP and rate limit windows
    ///
    /// # Errors
    ///
    /// Returns an error if a secret or lifetime in `config` is rejected by
    /// the component it configures.
    pub fn new(config: GuardConfig, pool: PgPool, clock: SharedClock) -> Result<Self, StateError> {
        let tokens = QrTokenSigner::new(
            config.qr_token.secret.clone(),
            config.qr_token.ttl_seconds,
            clock.clone(),
        )?;
        let secret_box = SecretBox::new(config.mfa.encryption_key.expose_secret().as_bytes())?;
        let webhooks = WebhookVerifier::new(
            config.webhook.secrets(),
            config.webhook.tolerance_seconds,
            clock.clone(),
        )?;

        let rate_limit_store = Arc::new(InMemoryRateLimitStore::new());
        let limiter = RateLimiter::new(rate_limit_store.clone(), clock.clone());

        let ledger = LoyaltyLedger::new(PgLoyaltyStore::new(pool.clone()), tokens);
        let mfa = MfaService::new(
            PgMfaSecretStore::new(pool.clone()),
            secret_box,
            limiter.clone(),
            clock.clone(),
            config.mfa.issuer.clone(),
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                pool,
                clock,
                ledger,
                mfa,
                webhooks,
                passwords: PasswordHasher::default(),
                limiter,
                rate_limit_store,
            }),
        })
    }

    /// Spawn background maintenance (rate limit counter sweeping).
    #[must_use]
    pub fn spawn_maintenance(&self) -> tokio::task::JoinHandle<()> {
        self.inner
            .rate_limit_store
            .start_sweeper(SWEEP_INTERVAL, self.inner.clock.clone())
    }

    #[must_use]
    pub fn config(&self) -> &GuardConfig {
        &self.inner.config
    }

    /// Get a reference to the database connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    #[must_use]
    pub fn ledger(&self) -> &LoyaltyLedger<PgLoyaltyStore> {
        &self.inner.ledger
    }

    #[must_use]
    pub fn mfa(&self) -> &MfaService<PgMfaSecretStore> {
        &self.inner.mfa
    }

    #[must_use]
    pub fn webhooks(&self) -> &WebhookVerifier {
        &self.inner.webhooks
    }

    #[must_use]
    pub fn passwords(&self) -> &PasswordHasher {
        &self.inner.passwords
    }

    /// Shared limiter for login, webhook and register endpoints.
    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }
}
