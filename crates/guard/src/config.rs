//! Configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `STAMPLINE_DATABASE_URL` - `PostgreSQL` connection string (falls back to `DATABASE_URL`)
//! - `STAMPLINE_QR_TOKEN_SECRET` - QR token signing secret (min 32 chars, high entropy)
//! - `STAMPLINE_MFA_ENCRYPTION_KEY` - Key material for sealing TOTP secrets (min 32 chars, high entropy)
//! - `STAMPLINE_WEBHOOK_SECRET` - Payment provider webhook signing secret
//!
//! ## Optional
//! - `STAMPLINE_QR_TOKEN_TTL_SECONDS` - QR token lifetime (default: 60, max: 3600)
//! - `STAMPLINE_MFA_ISSUER` - Issuer shown in authenticator apps (default: Stampline)
//! - `STAMPLINE_WEBHOOK_SECRET_PREVIOUS` - Previous webhook secret, accepted during rotation
//! - `STAMPLINE_WEBHOOK_TOLERANCE_SECONDS` - Allowed webhook clock skew (default: 300)
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment name

use std::collections::HashMap;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use crate::crypto::qr_token::{DEFAULT_TTL_SECONDS, MAX_TTL_SECONDS};
use crate::crypto::webhook::DEFAULT_TOLERANCE_SECONDS;

const MIN_KEY_LENGTH: usize = 32;
const MIN_ENTROPY_BITS_PER_CHAR: f64 = 3.3;

/// Blocklist of common placeholder patterns (case-insensitive)
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "your-",
    "changeme",
    "replace",
    "placeholder",
    "example",
    "secret",
    "password",
    "xxx",
    "todo",
    "fixme",
    "insert",
    "enter-",
    "put-your",
    "add-your",
];

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// `PostgreSQL` database connection URL (contains password)
    pub database_url: SecretString,
    pub qr_token: QrTokenConfig,
    pub mfa: MfaConfig,
    pub webhook: WebhookConfig,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    pub sentry_environment: Option<String>,
}

/// Loyalty QR token settings.
#[derive(Clone)]
pub struct QrTokenConfig {
    pub secret: SecretString,
    pub ttl_seconds: i64,
}

impl std::fmt::Debug for QrTokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QrTokenConfig")
            .field("secret", &"[REDACTED]")
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}

/// TOTP enrollment settings.
#[derive(Clone)]
pub struct MfaConfig {
    pub encryption_key: SecretString,
    pub issuer: String,
}

impl std::fmt::Debug for MfaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MfaConfig")
            .field("encryption_key", &"[REDACTED]")
            .field("issuer", &self.issuer)
            .finish()
    }
}

/// Payment webhook verification settings.
#[derive(Clone)]
pub struct WebhookConfig {
    pub secret: SecretString,
    pub previous_secret: Option<SecretString>,
    pub tolerance_seconds: i64,
}

impl WebhookConfig {
    /// Current secret first, then the previous one if set.
    #[must_use]
    pub fn secrets(&self) -> Vec<SecretString> {
        std::iter::once(self.secret.clone())
            .chain(self.previous_secret.clone())
            .collect()
    }
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("secret", &"[REDACTED]")
            .field(
                "previous_secret",
                &self.previous_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("tolerance_seconds", &self.tolerance_seconds)
            .finish()
    }
}

impl GuardConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing, invalid, or
    /// if secrets fail validation (placeholder detection, entropy check).
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`GuardConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let database_url = env.database_url("STAMPLINE_DATABASE_URL")?;

        let qr_secret = env.validated_secret("STAMPLINE_QR_TOKEN_SECRET")?;
        validate_key_length(&qr_secret, "STAMPLINE_QR_TOKEN_SECRET")?;
        let ttl_seconds = env.parsed_or(
            "STAMPLINE_QR_TOKEN_TTL_SECONDS",
            DEFAULT_TTL_SECONDS,
        )?;
        if !(1..=MAX_TTL_SECONDS).contains(&ttl_seconds) {
            return Err(ConfigError::InvalidEnvVar(
                "STAMPLINE_QR_TOKEN_TTL_SECONDS".to_string(),
                format!("must be between 1 and {MAX_TTL_SECONDS}"),
            ));
        }

        let encryption_key = env.validated_secret("STAMPLINE_MFA_ENCRYPTION_KEY")?;
        validate_key_length(&encryption_key, "STAMPLINE_MFA_ENCRYPTION_KEY")?;
        let issuer = env.or_default("STAMPLINE_MFA_ISSUER", "Stampline");

        let webhook_secret = env.validated_secret("STAMPLINE_WEBHOOK_SECRET")?;
        let previous_secret = env
            .optional("STAMPLINE_WEBHOOK_SECRET_PREVIOUS")
            .map(|value| {
                validate_secret_strength(&value, "STAMPLINE_WEBHOOK_SECRET_PREVIOUS")
                    .map(|()| SecretString::from(value))
            })
            .transpose()?;
        let tolerance_seconds = env.parsed_or(
            "STAMPLINE_WEBHOOK_TOLERANCE_SECONDS",
            DEFAULT_TOLERANCE_SECONDS,
        )?;
        if tolerance_seconds < 0 {
            return Err(ConfigError::InvalidEnvVar(
                "STAMPLINE_WEBHOOK_TOLERANCE_SECONDS".to_string(),
                "cannot be negative".to_string(),
            ));
        }

        Ok(Self {
            database_url,
            qr_token: QrTokenConfig {
                secret: qr_secret,
                ttl_seconds,
            },
            mfa: MfaConfig {
                encryption_key,
                issuer,
            },
            webhook: WebhookConfig {
                secret: webhook_secret,
                previous_secret,
                tolerance_seconds,
            },
            sentry_dsn: env.optional("SENTRY_DSN"),
            sentry_environment: env.optional("SENTRY_ENVIRONMENT"),
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    /// Get a required environment variable.
    fn required(&self, key: &str) -> Result<String, ConfigError> {
        (self.0)(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    /// Get an optional environment variable. Empty values count as unset.
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.is_empty())
    }

    /// Get an environment variable with a default value.
    fn or_default(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed_or(&self, key: &str, default: i64) -> Result<i64, ConfigError> {
        self.optional(key).map_or(Ok(default), |value| {
            value
                .parse::<i64>()
                .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
        })
    }

    /// Get database URL with fallback to generic `DATABASE_URL`.
    fn database_url(&self, primary_key: &str) -> Result<SecretString, ConfigError> {
        self.optional(primary_key)
            .or_else(|| self.optional("DATABASE_URL"))
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingEnvVar(primary_key.to_string()))
    }

    /// Load and validate a secret from environment.
    fn validated_secret(&self, key: &str) -> Result<SecretString, ConfigError> {
        let value = self.required(key)?;
        validate_secret_strength(&value, key)?;
        Ok(SecretString::from(value))
    }
}

/// Validate that key material meets minimum length requirements.
fn validate_key_length(secret: &SecretString, var_name: &str) -> Result<(), ConfigError> {
    let value = secret.expose_secret();
    if value.len() < MIN_KEY_LENGTH {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "must be at least {} characters (got {})",
                MIN_KEY_LENGTH,
                value.len()
            ),
        ));
    }
    Ok(())
}

/// Calculate Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }

    let mut freq: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *freq.entry(c).or_insert(0) += 1;
    }

    #[allow(clippy::cast_precision_loss)] // String length will never exceed f64 precision
    let len = s.len() as f64;
    freq.values()
        .map(|&count| {
            #[allow(clippy::cast_precision_loss)]
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Validate that a secret is not a placeholder and has sufficient entropy.
fn validate_secret_strength(secret: &str, var_name: &str) -> Result<(), ConfigError> {
    let lower = secret.to_lowercase();

    for pattern in PLACEHOLDER_PATTERNS {
        if lower.contains(pattern) {
            return Err(ConfigError::InsecureSecret(
                var_name.to_string(),
                format!("appears to be a placeholder (contains '{pattern}')"),
            ));
        }
    }

    let entropy = shannon_entropy(secret);
    if entropy < MIN_ENTROPY_BITS_PER_CHAR {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "entropy too low ({entropy:.2} bits/char, need >= {MIN_ENTROPY_BITS_PER_CHAR:.1}). Use a randomly generated secret."
            ),
        ));
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const QR_SECRET: &str = "Qp7vX2mK9sL4wR8tY1zB6nC3dF5gH0jJ";
    const MFA_KEY: &str = "mZ4kP8qW2xR6vT0yL3nB7cD1fG5hJ9sA";
    const WEBHOOK: &str = "whsec_Lm3Np8Qr2St7Uv1Wx6Yz";

    fn vars(extra: &[(&str, &str)]) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = [
            ("STAMPLINE_DATABASE_URL", "postgres://localhost/stampline"),
            ("STAMPLINE_QR_TOKEN_SECRET", QR_SECRET),
            ("STAMPLINE_MFA_ENCRYPTION_KEY", MFA_KEY),
            ("STAMPLINE_WEBHOOK_SECRET", WEBHOOK),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in extra {
            map.insert((*k).to_string(), (*v).to_string());
        }
        map
    }

    fn load(map: &HashMap<String, String>) -> Result<GuardConfig, ConfigError> {
        GuardConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&vars(&[])).unwrap();
        assert_eq!(config.qr_token.ttl_seconds, 60);
        assert_eq!(config.mfa.issuer, "Stampline");
        assert_eq!(config.webhook.tolerance_seconds, 300);
        assert!(config.webhook.previous_secret.is_none());
        assert_eq!(config.webhook.secrets().len(), 1);
        assert!(config.sentry_dsn.is_none());
    }

    #[test]
    fn test_database_url_fallback() {
        let mut map = vars(&[("DATABASE_URL", "postgres://fallback/db")]);
        map.remove("STAMPLINE_DATABASE_URL");
        let config = load(&map).unwrap();
        assert_eq!(config.database_url.expose_secret(), "postgres://fallback/db");

        map.remove("DATABASE_URL");
        assert!(matches!(load(&map), Err(ConfigError::MissingEnvVar(_))));
    }

    #[test]
    fn test_ttl_bounds() {
        assert!(load(&vars(&[("STAMPLINE_QR_TOKEN_TTL_SECONDS", "3600")])).is_ok());
        for bad in ["0", "3601", "-5", "soon"] {
            assert!(
                matches!(
                    load(&vars(&[("STAMPLINE_QR_TOKEN_TTL_SECONDS", bad)])),
                    Err(ConfigError::InvalidEnvVar(_, _))
                ),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_short_key_rejected() {
        let result = load(&vars(&[("STAMPLINE_MFA_ENCRYPTION_KEY", "aB3xY9mK2nL5pQ7")]));
        assert!(matches!(result, Err(ConfigError::InsecureSecret(_, _))));
    }

    #[test]
    fn test_previous_webhook_secret() {
        let config = load(&vars(&[(
            "STAMPLINE_WEBHOOK_SECRET_PREVIOUS",
            "whsec_Ab4Cd9Ef2Gh7Ij1Kl6Mn",
        )]))
        .unwrap();
        assert_eq!(config.webhook.secrets().len(), 2);

        let result = load(&vars(&[("STAMPLINE_WEBHOOK_SECRET_PREVIOUS", "changeme")]));
        assert!(matches!(result, Err(ConfigError::InsecureSecret(_, _))));
    }

    #[test]
    fn test_shannon_entropy_empty() {
        assert!((shannon_entropy("") - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shannon_entropy_two_chars() {
        let entropy = shannon_entropy("ab");
        assert!((entropy - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_validate_secret_strength_placeholder() {
        let result = validate_secret_strength("your-api-key-here", "TEST_VAR");
        assert!(matches!(result, Err(ConfigError::InsecureSecret(_, _))));
    }

    #[test]
    fn test_validate_secret_strength_low_entropy() {
        let result = validate_secret_strength("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", "TEST_VAR");
        assert!(matches!(result, Err(ConfigError::InsecureSecret(_, _))));
    }

    #[test]
    fn test_validate_secret_strength_valid() {
        assert!(validate_secret_strength("aB3$xY9!mK2@nL5#pQ7&rT0*uW4^zC6", "TEST_VAR").is_ok());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = load(&vars(&[(
            "STAMPLINE_WEBHOOK_SECRET_PREVIOUS",
            "whsec_Ab4Cd9Ef2Gh7Ij1Kl6Mn",
        )]))
        .unwrap();
        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("Stampline"));
        assert!(debug_output.contains("[REDACTED]"));
        for secret in [QR_SECRET, MFA_KEY, WEBHOOK, "whsec_Ab4Cd9Ef2Gh7Ij1Kl6Mn"] {
            assert!(!debug_output.contains(secret));
        }
    }
}
