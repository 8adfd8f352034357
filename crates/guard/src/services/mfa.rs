//! TOTP enrollment and verification for staff accounts.
//!
//! Secrets are sealed with [`SecretBox`] before they reach the store. A new
//! secret starts `pending` and only becomes `enabled` after one correct code.
//! Every accepted code records its time step; a code whose step is not newer
//! than the last accepted one is refused, so a code cannot be used twice.

use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use stampline_core::{MfaStatus, UserId};

use crate::clock::SharedClock;
use crate::crypto::totp::build_provisioning_uri;
use crate::crypto::{SecretBox, SecretBoxError, TotpEngine, TotpSecret};
use crate::db::StoreError;
use crate::services::rate_limit::{RateLimitError, RateLimitKey, RateLimiter};

/// Verification attempts allowed per user per window.
pub const DEFAULT_ATTEMPT_LIMIT: u32 = 5;
/// Attempt window (5 minutes).
pub const DEFAULT_ATTEMPT_WINDOW_MS: u64 = 5 * 60 * 1_000;

/// Errors from MFA operations.
#[derive(Debug, Error)]
pub enum MfaError {
    #[error("multi-factor authentication is already enabled")]
    AlreadyEnabled,

    #[error("no pending multi-factor enrollment")]
    NotPending,

    #[error("multi-factor authentication is not enabled")]
    NotEnabled,

    #[error("invalid verification code")]
    InvalidCode,

    #[error("verification code already used")]
    CodeReused,

    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    /// The stored secret could not be decrypted.
    #[error("stored secret could not be opened: {0}")]
    Integrity(#[from] SecretBoxError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A user's stored MFA secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MfaRecord {
    pub user_id: UserId,
    /// `SecretBox` blob of the raw TOTP secret.
    pub encrypted_secret: String,
    pub status: MfaStatus,
    pub last_used_step: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub enabled_at: Option<DateTime<Utc>>,
}

/// Storage for MFA secrets.
pub trait MfaSecretStore: Send + Sync {
    fn find(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Option<MfaRecord>, StoreError>> + Send;

    /// Store a pending secret, replacing an earlier pending one.
    ///
    /// Returns `false` without writing if the user already has MFA enabled.
    fn save_pending(
        &self,
        user_id: UserId,
        encrypted_secret: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Promote a pending secret to enabled, recording `step` as used.
    ///
    /// Returns `false` if there was no pending secret.
    fn enable(
        &self,
        user_id: UserId,
        step: i64,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Record `step` as used if it is newer than the last used step.
    ///
    /// Returns `false` if the record is not enabled or the step is not newer.
    fn record_step(
        &self,
        user_id: UserId,
        step: i64,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Remove the user's secret. Returns whether one existed.
    fn delete(&self, user_id: UserId) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

/// What the user needs to add the account to an authenticator app.
pub struct MfaEnrollment {
    pub secret_base32: String,
    pub provisioning_uri: String,
}

impl fmt::Debug for MfaEnrollment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MfaEnrollment")
            .field("secret_base32", &"[REDACTED]")
            .field("provisioning_uri", &"[REDACTED]")
            .finish()
    }
}

/// MFA enrollment and verification service.
#[derive(Debug, Clone)]
pub struct MfaService<S> {
    store: S,
    totp: TotpEngine,
    secret_box: SecretBox,
    limiter: RateLimiter,
    clock: SharedClock,
    issuer: String,
    attempt_limit: u32,
    attempt_window_ms: u64,
}

impl<S: MfaSecretStore> MfaService<S> {
    #[must_use]
    pub fn new(
        store: S,
        secret_box: SecretBox,
        limiter: RateLimiter,
        clock: SharedClock,
        issuer: impl Into<String>,
    ) -> Self {
        Self {
            store,
            totp: TotpEngine::new(clock.clone()),
            secret_box,
            limiter,
            clock,
            issuer: issuer.into(),
            attempt_limit: DEFAULT_ATTEMPT_LIMIT,
            attempt_window_ms: DEFAULT_ATTEMPT_WINDOW_MS,
        }
    }

    /// Override the verification attempt limit.
    #[must_use]
    pub const fn with_attempt_limit(mut self, limit: u32, window_ms: u64) -> Self {
        self.attempt_limit = limit;
        self.attempt_window_ms = window_ms;
        self
    }

    /// Generate a new secret and store it as pending.
    ///
    /// # Errors
    ///
    /// Returns `MfaError::AlreadyEnabled` if MFA is already on for this user.
    #[instrument(skip(self, account_label), fields(user_id = %user_id))]
    pub async fn begin_enrollment(
        &self,
        user_id: UserId,
        account_label: &str,
    ) -> Result<MfaEnrollment, MfaError> {
        let secret = TotpSecret::generate();
        let sealed = self.secret_box.encrypt(secret.as_bytes())?;

        if !self
            .store
            .save_pending(user_id, &sealed, self.clock.now())
            .await?
        {
            return Err(MfaError::AlreadyEnabled);
        }

        info!("MFA enrollment started");

        Ok(MfaEnrollment {
            secret_base32: secret.to_base32(),
            provisioning_uri: build_provisioning_uri(&self.issuer, account_label, &secret),
        })
    }

    /// Enable a pending secret after the user proves they can produce codes.
    ///
    /// # Errors
    ///
    /// Returns `MfaError::NotPending`, `MfaError::AlreadyEnabled`,
    /// `MfaError::InvalidCode` or `MfaError::RateLimited`.
    #[instrument(skip(self, code), fields(user_id = %user_id))]
    pub async fn confirm_enrollment(&self, user_id: UserId, code: &str) -> Result<(), MfaError> {
        self.check_attempts(user_id)?;

        let record = self.store.find(user_id).await?.ok_or(MfaError::NotPending)?;
        if record.status == MfaStatus::Enabled {
            return Err(MfaError::AlreadyEnabled);
        }

        let step = self.matching_step(&record, code)?;
        if !self.store.enable(user_id, step, self.clock.now()).await? {
            return Err(MfaError::NotPending);
        }

        info!("MFA enabled");
        Ok(())
    }

    /// Check a code for a user with MFA enabled.
    ///
    /// # Errors
    ///
    /// Returns `MfaError::NotEnabled`, `MfaError::InvalidCode`,
    /// `MfaError::CodeReused` or `MfaError::RateLimited`.
    #[instrument(skip(self, code), fields(user_id = %user_id))]
    pub async fn verify(&self, user_id: UserId, code: &str) -> Result<(), MfaError> {
        self.check_attempts(user_id)?;

        let record = self
            .store
            .find(user_id)
            .await?
            .filter(|r| r.status == MfaStatus::Enabled)
            .ok_or(MfaError::NotEnabled)?;

        let step = self.matching_step(&record, code)?;
        if record.last_used_step.is_some_and(|last| step <= last) {
            warn!("Rejected reused MFA code");
            return Err(MfaError::CodeReused);
        }
        if !self.store.record_step(user_id, step).await? {
            warn!("Rejected reused MFA code");
            return Err(MfaError::CodeReused);
        }

        Ok(())
    }

    /// Turn MFA off. Returns whether the user had a secret.
    ///
    /// # Errors
    ///
    /// Returns `MfaError::Store` on storage failure.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn disable(&self, user_id: UserId) -> Result<bool, MfaError> {
        let removed = self.store.delete(user_id).await?;
        if removed {
            info!("MFA disabled");
        }
        Ok(removed)
    }

    /// # Errors
    ///
    /// Returns `MfaError::Store` on storage failure.
    pub async fn status(&self, user_id: UserId) -> Result<Option<MfaStatus>, MfaError> {
        Ok(self.store.find(user_id).await?.map(|r| r.status))
    }

    fn check_attempts(&self, user_id: UserId) -> Result<(), MfaError> {
        let key = RateLimitKey::new("mfa_verify").actor(user_id);
        self.limiter
            .enforce(&key, self.attempt_limit, self.attempt_window_ms)?;
        Ok(())
    }

    fn matching_step(&self, record: &MfaRecord, code: &str) -> Result<i64, MfaError> {
        let raw = self
            .secret_box
            .decrypt(&record.encrypted_secret)
            .inspect_err(|e| error!(error = %e, "Failed to open stored MFA secret"))?;
        let secret = TotpSecret::from_bytes(&raw);

        self.totp
            .verify_step(&secret, code.trim())
            .and_then(|step| i64::try_from(step).ok())
            .ok_or(MfaError::InvalidCode)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeDelta;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::crypto::totp::compute_code;
    use crate::db::InMemoryMfaSecretStore;

    const KEY: &[u8] = b"mfa-test-key-material-8Yw2Kd5Rn0";

    fn service() -> (MfaService<InMemoryMfaSecretStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let shared: SharedClock = clock.clone();
        let service = MfaService::new(
            InMemoryMfaSecretStore::new(),
            SecretBox::new(KEY).unwrap(),
            RateLimiter::in_memory(shared.clone()),
            shared,
            "Stampline",
        );
        (service, clock)
    }

    fn code_now(enrollment: &MfaEnrollment, clock: &ManualClock) -> String {
        let secret = TotpSecret::from_base32(&enrollment.secret_base32).unwrap();
        let step = u64::try_from(clock.now().timestamp()).unwrap() / 30;
        compute_code(secret.as_bytes(), step)
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let (service, clock) = service();
        let user = UserId::new(4);

        let enrollment = service.begin_enrollment(user, "ana@example.com").await.unwrap();
        assert!(enrollment.provisioning_uri.starts_with("otpauth://totp/Stampline:"));
        assert_eq!(service.status(user).await.unwrap(), Some(MfaStatus::Pending));

        // Pending secrets cannot be used to sign in
        let code = code_now(&enrollment, &clock);
        assert!(matches!(
            service.verify(user, &code).await,
            Err(MfaError::NotEnabled)
        ));

        service.confirm_enrollment(user, &code).await.unwrap();
        assert_eq!(service.status(user).await.unwrap(), Some(MfaStatus::Enabled));

        // The confirming code is already spent
        assert!(matches!(
            service.verify(user, &code).await,
            Err(MfaError::CodeReused)
        ));

        clock.advance(TimeDelta::seconds(30));
        let next = code_now(&enrollment, &clock);
        service.verify(user, &next).await.unwrap();
        assert!(matches!(
            service.verify(user, &next).await,
            Err(MfaError::CodeReused)
        ));

        assert!(service.disable(user).await.unwrap());
        assert_eq!(service.status(user).await.unwrap(), None);
        assert!(!service.disable(user).await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_code_does_not_enable() {
        let (service, clock) = service();
        let user = UserId::new(4);
        let enrollment = service.begin_enrollment(user, "ana").await.unwrap();

        let good = code_now(&enrollment, &clock);
        let bad = if good == "000000" { "000001" } else { "000000" };
        assert!(matches!(
            service.confirm_enrollment(user, bad).await,
            Err(MfaError::InvalidCode)
        ));
        assert_eq!(service.status(user).await.unwrap(), Some(MfaStatus::Pending));
    }

    #[tokio::test]
    async fn test_reenrollment_replaces_pending_but_not_enabled() {
        let (service, clock) = service();
        let user = UserId::new(4);

        let first = service.begin_enrollment(user, "ana").await.unwrap();
        let second = service.begin_enrollment(user, "ana").await.unwrap();
        assert_ne!(first.secret_base32, second.secret_base32);

        service
            .confirm_enrollment(user, &code_now(&second, &clock))
            .await
            .unwrap();
        assert!(matches!(
            service.begin_enrollment(user, "ana").await,
            Err(MfaError::AlreadyEnabled)
        ));
    }

    #[tokio::test]
    async fn test_attempts_are_rate_limited() {
        let (service, clock) = service();
        let user = UserId::new(4);
        service.begin_enrollment(user, "ana").await.unwrap();

        for _ in 0..DEFAULT_ATTEMPT_LIMIT {
            let _ = service.confirm_enrollment(user, "123456").await;
        }
        assert!(matches!(
            service.confirm_enrollment(user, "123456").await,
            Err(MfaError::RateLimited(RateLimitError::Exceeded { .. }))
        ));

        clock.advance(TimeDelta::minutes(5));
        assert!(!matches!(
            service.confirm_enrollment(user, "123456").await,
            Err(MfaError::RateLimited(_))
        ));
    }

    #[tokio::test]
    async fn test_tampered_secret_is_integrity_error() {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let shared: SharedClock = clock.clone();
        let store = InMemoryMfaSecretStore::new();
        let user = UserId::new(4);
        store.save_pending(user, "v1.AAAAAAAAAAAAAAAA.AAAA.AAAAAAAAAAAAAAAAAAAAAA", clock.now()).await.unwrap();

        let service = MfaService::new(
            store,
            SecretBox::new(KEY).unwrap(),
            RateLimiter::in_memory(shared.clone()),
            shared,
            "Stampline",
        );
        assert!(matches!(
            service.confirm_enrollment(user, "123456").await,
            Err(MfaError::Integrity(SecretBoxError::Integrity))
        ));
    }

    #[test]
    fn test_enrollment_debug_redacts() {
        let enrollment = MfaEnrollment {
            secret_base32: "JBSWY3DPEHPK3PXP".to_owned(),
            provisioning_uri: "otpauth://totp/x".to_owned(),
        };
        assert!(!format!("{enrollment:?}").contains("JBSWY3DP"));
    }
}
