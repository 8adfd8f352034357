//! Short-lived signed identity tokens shown as the customer's loyalty QR code.
//!
//! Wire format: `base64url(JSON{userId, exp}) "." base64url(HMAC-SHA256)`.
//! The MAC covers the encoded payload segment. Tokens are never stored;
//! rotating the secret invalidates every outstanding token, and the short TTL
//! bounds how long a captured code can be replayed.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use stampline_core::UserId;

use crate::clock::SharedClock;

type HmacSha256 = Hmac<Sha256>;

/// Default token lifetime.
pub const DEFAULT_TTL_SECONDS: i64 = 60;
/// Longest lifetime a token may be issued with.
pub const MAX_TTL_SECONDS: i64 = 3_600;

/// Reasons a token is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is malformed")]
    MalformedToken,

    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("token has expired")]
    Expired,

    /// Authentic token whose payload could not be understood.
    #[error("token payload is invalid")]
    InvalidPayload,

    #[error("token lifetime must be between 1 and {MAX_TTL_SECONDS} seconds")]
    InvalidTtl,

    #[error("token signing secret cannot be empty")]
    EmptySecret,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Claims {
    user_id: UserId,
    exp: i64,
}

/// Issues and verifies QR tokens with a shared secret.
#[derive(Clone)]
pub struct QrTokenSigner {
    secret: SecretString,
    ttl_seconds: i64,
    clock: SharedClock,
}

impl std::fmt::Debug for QrTokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QrTokenSigner")
            .field("secret", &"[REDACTED]")
            .field("ttl_seconds", &self.ttl_seconds)
            .finish_non_exhaustive()
    }
}

impl QrTokenSigner {
    /// Create a signer.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::EmptySecret` for an empty secret and
    /// `TokenError::InvalidTtl` if `ttl_seconds` is outside 1..=3600.
    pub fn new(
        secret: SecretString,
        ttl_seconds: i64,
        clock: SharedClock,
    ) -> Result<Self, TokenError> {
        if secret.expose_secret().is_empty() {
            return Err(TokenError::EmptySecret);
        }
        validate_ttl(ttl_seconds)?;
        Ok(Self {
            secret,
            ttl_seconds,
            clock,
        })
    }

    /// Issue a token for `user_id` with the configured lifetime.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::InvalidTtl` only if the configured TTL overflows the clock.
    pub fn issue(&self, user_id: UserId) -> Result<String, TokenError> {
        self.issue_with_ttl(user_id, self.ttl_seconds)
    }

    /// Issue a token with an explicit lifetime.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::InvalidTtl` if `ttl_seconds` is outside 1..=3600.
    pub fn issue_with_ttl(&self, user_id: UserId, ttl_seconds: i64) -> Result<String, TokenError> {
        issue_at(
            user_id,
            ttl_seconds,
            self.secret.expose_secret().as_bytes(),
            self.clock.now().timestamp(),
        )
    }

    /// Verify a token and return the user it identifies.
    ///
    /// # Errors
    ///
    /// Returns the matching [`TokenError`] variant on any failure.
    pub fn verify(&self, token: &str) -> Result<UserId, TokenError> {
        verify_at(
            token,
            self.secret.expose_secret().as_bytes(),
            self.clock.now().timestamp(),
        )
    }

    #[must_use]
    pub const fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }
}

const fn validate_ttl(ttl_seconds: i64) -> Result<(), TokenError> {
    if ttl_seconds < 1 || ttl_seconds > MAX_TTL_SECONDS {
        return Err(TokenError::InvalidTtl);
    }
    Ok(())
}

/// Issue a token that expires `ttl_seconds` after `now` (unix seconds).
///
/// # Errors
///
/// Returns `TokenError::InvalidTtl` or `TokenError::EmptySecret`.
pub fn issue_at(
    user_id: UserId,
    ttl_seconds: i64,
    secret: &[u8],
    now: i64,
) -> Result<String, TokenError> {
    if secret.is_empty() {
        return Err(TokenError::EmptySecret);
    }
    validate_ttl(ttl_seconds)?;

    let exp = now.checked_add(ttl_seconds).ok_or(TokenError::InvalidTtl)?;
    let claims = Claims { user_id, exp };
    let json = serde_json::to_vec(&claims).map_err(|_| TokenError::InvalidPayload)?;
    let payload = URL_SAFE_NO_PAD.encode(json);
    let signature = URL_SAFE_NO_PAD.encode(sign(payload.as_bytes(), secret)?);

    Ok(format!("{payload}.{signature}"))
}

/// Verify a token against `now` (unix seconds).
///
/// The signature is checked before the payload is decoded.
///
/// # Errors
///
/// Returns the matching [`TokenError`] variant on any failure.
pub fn verify_at(token: &str, secret: &[u8], now: i64) -> Result<UserId, TokenError> {
    let (payload, signature) = token.split_once('.').ok_or(TokenError::MalformedToken)?;
    if payload.is_empty() || signature.is_empty() || signature.contains('.') {
        return Err(TokenError::MalformedToken);
    }
    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| TokenError::MalformedToken)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::EmptySecret)?;
    mac.update(payload.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| TokenError::InvalidSignature)?;

    let json = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| TokenError::InvalidPayload)?;
    let claims: Claims = serde_json::from_slice(&json).map_err(|_| TokenError::InvalidPayload)?;

    if now >= claims.exp {
        return Err(TokenError::Expired);
    }

    Ok(claims.user_id)
}

fn sign(payload: &[u8], secret: &[u8]) -> Result<Vec<u8>, TokenError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::EmptySecret)?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}
