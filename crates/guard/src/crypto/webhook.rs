//! Payment provider webhook signature verification.
//!
//! The provider sends a header of the form `t=<unix>,v1=<hex>[,v1=<hex>...]`
//! where each `v1` value is `hex(HMAC-SHA256(secret, "{t}." ++ raw_body))`.
//! Verification works on the raw request bytes; the body is only parsed
//! after a signature matches.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;

use crate::clock::SharedClock;

type HmacSha256 = Hmac<Sha256>;

/// Default allowed clock skew between the provider and us.
pub const DEFAULT_TOLERANCE_SECONDS: i64 = 300;

const SIGNATURE_SCHEME: &str = "v1";

/// Errors from webhook verification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingHeader,

    #[error("malformed signature header")]
    MalformedHeader,

    #[error("webhook timestamp outside tolerance")]
    TimestampOutsideTolerance,

    #[error("webhook signature mismatch")]
    SignatureMismatch,

    /// The signature matched but the body is not the expected JSON shape.
    #[error("webhook payload is invalid: {0}")]
    InvalidPayload(String),

    #[error("no webhook secret configured")]
    NoSecret,
}

/// A parsed `t=...,v1=...` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    pub signatures: Vec<String>,
}

impl SignatureHeader {
    /// Parse a signature header.
    ///
    /// Whitespace around items is ignored, as are schemes other than `v1`.
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::MissingHeader` for an empty header and
    /// `WebhookError::MalformedHeader` if the timestamp is missing, repeated
    /// or not an integer, or no `v1` signature is present.
    pub fn parse(header: &str) -> Result<Self, WebhookError> {
        if header.trim().is_empty() {
            return Err(WebhookError::MissingHeader);
        }

        let mut timestamp = None;
        let mut signatures = Vec::new();

        for item in header.split(',') {
            let (key, value) = item
                .trim()
                .split_once('=')
                .ok_or(WebhookError::MalformedHeader)?;
            let value = value.trim();
            match key.trim() {
                "t" => {
                    if timestamp.is_some() {
                        return Err(WebhookError::MalformedHeader);
                    }
                    let parsed = value
                        .parse::<i64>()
                        .map_err(|_| WebhookError::MalformedHeader)?;
                    timestamp = Some(parsed);
                }
                SIGNATURE_SCHEME => signatures.push(value.to_ascii_lowercase()),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(WebhookError::MalformedHeader)?;
        if signatures.is_empty() {
            return Err(WebhookError::MalformedHeader);
        }

        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

/// Verifies webhook deliveries against one or more shared secrets.
///
/// Secrets are tried in order; the first is the current secret and any others
/// are previous secrets still accepted during a rotation.
#[derive(Clone)]
pub struct WebhookVerifier {
    secrets: Vec<SecretString>,
    tolerance_seconds: i64,
    clock: SharedClock,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secrets", &format!("[{} REDACTED]", self.secrets.len()))
            .field("tolerance_seconds", &self.tolerance_seconds)
            .finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    /// # Errors
    ///
    /// Returns `WebhookError::NoSecret` if `secrets` is empty or contains an empty secret.
    pub fn new(
        secrets: Vec<SecretString>,
        tolerance_seconds: i64,
        clock: SharedClock,
    ) -> Result<Self, WebhookError> {
        if secrets.is_empty() || secrets.iter().any(|s| s.expose_secret().is_empty()) {
            return Err(WebhookError::NoSecret);
        }
        Ok(Self {
            secrets,
            tolerance_seconds,
            clock,
        })
    }

    /// Verify a delivery and deserialize its body.
    ///
    /// # Errors
    ///
    /// Returns the matching [`WebhookError`] variant.
    pub fn verify<T: DeserializeOwned>(
        &self,
        raw_body: &[u8],
        header: Option<&str>,
    ) -> Result<T, WebhookError> {
        let header = header.ok_or(WebhookError::MissingHeader)?;
        let now = self.clock.now().timestamp();

        let mut last_err = WebhookError::SignatureMismatch;
        for secret in &self.secrets {
            match verify_signature(
                raw_body,
                header,
                secret.expose_secret().as_bytes(),
                self.tolerance_seconds,
                now,
            ) {
                Ok(()) => {
                    debug!("Webhook signature verified");
                    return serde_json::from_slice(raw_body)
                        .map_err(|e| WebhookError::InvalidPayload(e.to_string()));
                }
                Err(WebhookError::SignatureMismatch) => {}
                Err(e) => last_err = e,
            }
        }

        Err(last_err)
    }
}

/// Check a signature header against `raw_body` and one secret.
///
/// # Errors
///
/// Returns the matching [`WebhookError`] variant.
pub fn verify_signature(
    raw_body: &[u8],
    header: &str,
    secret: &[u8],
    tolerance_seconds: i64,
    now: i64,
) -> Result<(), WebhookError> {
    let parsed = SignatureHeader::parse(header)?;

    if now.abs_diff(parsed.timestamp) > tolerance_seconds.unsigned_abs() {
        return Err(WebhookError::TimestampOutsideTolerance);
    }

    let expected = hex::encode(compute_mac(raw_body, secret, parsed.timestamp)?);

    // Evaluate every candidate so timing does not reveal which one matched
    let matched = parsed
        .signatures
        .iter()
        .fold(subtle::Choice::from(0), |acc, candidate| {
            acc | expected.as_bytes().ct_eq(candidate.as_bytes())
        });

    if bool::from(matched) {
        Ok(())
    } else {
        Err(WebhookError::SignatureMismatch)
    }
}

/// Produce a header value signing `raw_body` at `timestamp`.
///
/// # Errors
///
/// Returns `WebhookError::NoSecret` if `secret` is empty.
pub fn sign(raw_body: &[u8], secret: &[u8], timestamp: i64) -> Result<String, WebhookError> {
    let mac = compute_mac(raw_body, secret, timestamp)?;
    Ok(format!("t={timestamp},{SIGNATURE_SCHEME}={}", hex::encode(mac)))
}

fn compute_mac(raw_body: &[u8], secret: &[u8], timestamp: i64) -> Result<Vec<u8>, WebhookError> {
    if secret.is_empty() {
        return Err(WebhookError::NoSecret);
    }
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| WebhookError::NoSecret)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    Ok(mac.finalize().into_bytes().to_vec())
}
