//! Development helpers for exercising the register flow by hand.
//!
//! # Environment Variables
//!
//! - `STAMPLINE_QR_TOKEN_SECRET` - used by `qr issue`
//! - `STAMPLINE_WEBHOOK_SECRET` - used by `webhook sign`

use std::path::Path;
use std::sync::Arc;

use secrecy::SecretString;
use stampline_core::UserId;
use stampline_guard::clock::{Clock, SystemClock};
use stampline_guard::crypto::qr_token::DEFAULT_TTL_SECONDS;
use stampline_guard::crypto::totp::build_provisioning_uri;
use stampline_guard::crypto::webhook::sign;
use stampline_guard::crypto::{QrTokenSigner, TokenError, TotpSecret, WebhookError};
use thiserror::Error;

use super::env_var;

#[derive(Debug, Error)]
pub enum DevError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(&'static str),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error("Could not read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
}

/// Print a new TOTP secret and its provisioning URI.
pub fn totp_new(account: &str, issuer: &str) {
    let secret = TotpSecret::generate();
    let uri = build_provisioning_uri(issuer, account, &secret);

    #[allow(clippy::print_stdout)]
    {
        println!("secret: {}", secret.to_base32());
        println!("uri:    {uri}");
    }
}

/// Print a QR token for `user_id`.
///
/// # Errors
///
/// Returns an error if the signing secret is missing or `ttl` is out of range.
pub fn qr_issue(user_id: i32, ttl: Option<i64>) -> Result<(), DevError> {
    let secret = env_var("STAMPLINE_QR_TOKEN_SECRET")
        .ok_or(DevError::MissingEnvVar("STAMPLINE_QR_TOKEN_SECRET"))?;
    let signer = QrTokenSigner::new(
        SecretString::from(secret),
        ttl.unwrap_or(DEFAULT_TTL_SECONDS),
        Arc::new(SystemClock),
    )?;

    let token = signer.issue(UserId::new(user_id))?;
    tracing::info!(user_id, ttl_seconds = signer.ttl_seconds(), "Issued QR token");

    #[allow(clippy::print_stdout)]
    {
        println!("{token}");
    }
    Ok(())
}

/// Print a signature header for the body stored at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the secret is missing.
pub fn webhook_sign(path: &Path, timestamp: Option<i64>) -> Result<(), DevError> {
    let secret = env_var("STAMPLINE_WEBHOOK_SECRET")
        .ok_or(DevError::MissingEnvVar("STAMPLINE_WEBHOOK_SECRET"))?;
    let body = std::fs::read(path).map_err(|source| DevError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let timestamp = timestamp.unwrap_or_else(|| SystemClock.now().timestamp());
    let header = sign(&body, secret.as_bytes(), timestamp)?;

    #[allow(clippy::print_stdout)]
    {
        println!("{header}");
    }
    Ok(())
}
