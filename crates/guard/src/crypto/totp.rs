//! Time-based one-time passwords (RFC 6238, HOTP truncation from RFC 4226).
//!
//! Codes are always 6 digits with HMAC-SHA1 and a 30 second step, which is
//! what authenticator apps assume when the provisioning URI is scanned.

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use subtle::{Choice, ConstantTimeEq};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::clock::SharedClock;

type HmacSha1 = Hmac<Sha1>;

/// Secret length in bytes (160 bits).
pub const SECRET_LEN: usize = 20;
/// Number of digits in a code.
pub const DIGITS: usize = 6;
/// Default time step.
pub const DEFAULT_STEP_SECONDS: u64 = 30;
/// Default number of steps accepted either side of the current one.
pub const DEFAULT_WINDOW_STEPS: u64 = 1;
/// Widest window accepted by [`TotpEngine::with_window`].
pub const MAX_WINDOW_STEPS: u64 = 10;

const MODULUS: u32 = 1_000_000;

/// Errors from TOTP secret handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TotpError {
    #[error("secret is not valid base32")]
    InvalidSecret,

    #[error("time step must be greater than zero")]
    InvalidStep,

    #[error("verification window must be at most {MAX_WINDOW_STEPS} steps")]
    InvalidWindow,
}

/// Raw TOTP secret bytes, zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct TotpSecret(Zeroizing<Vec<u8>>);

impl TotpSecret {
    /// Generate a fresh random 160-bit secret.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new(vec![0u8; SECRET_LEN]);
        rand::rng().fill_bytes(bytes.as_mut_slice());
        Self(bytes)
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(Zeroizing::new(bytes.to_vec()))
    }

    /// Decode the external base32 form.
    ///
    /// Lowercase letters, whitespace and trailing `=` padding are tolerated.
    ///
    /// # Errors
    ///
    /// Returns `TotpError::InvalidSecret` if the input is not base32 or is empty.
    pub fn from_base32(encoded: &str) -> Result<Self, TotpError> {
        let normalized: Zeroizing<String> = Zeroizing::new(
            encoded
                .chars()
                .filter(|c| !c.is_ascii_whitespace())
                .map(|c| c.to_ascii_uppercase())
                .collect::<String>()
                .trim_end_matches('=')
                .to_owned(),
        );
        let bytes = BASE32_NOPAD
            .decode(normalized.as_bytes())
            .map_err(|_| TotpError::InvalidSecret)?;
        if bytes.is_empty() {
            return Err(TotpError::InvalidSecret);
        }
        Ok(Self(Zeroizing::new(bytes)))
    }

    /// RFC 4648 base32, uppercase, unpadded.
    #[must_use]
    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for TotpSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TotpSecret([REDACTED])")
    }
}

/// Compute the 6-digit HOTP code for `counter`.
#[must_use]
pub fn compute_code(secret: &[u8], counter: u64) -> String {
    format!("{:0width$}", truncate(&hotp_digest(secret, counter)), width = DIGITS)
}

#[allow(clippy::expect_used)]
fn hotp_digest(secret: &[u8], counter: u64) -> [u8; 20] {
    let mut mac =
        <HmacSha1 as Mac>::new_from_slice(secret).expect("HMAC-SHA1 accepts keys of any length");
    mac.update(&counter.to_be_bytes());
    let mut digest = [0u8; 20];
    digest.copy_from_slice(&mac.finalize().into_bytes());
    digest
}

fn truncate(digest: &[u8; 20]) -> u32 {
    let [.., last] = *digest;
    let offset = usize::from(last & 0x0f);
    // offset <= 15, so the 4-byte window always fits in 20 bytes
    let window = digest
        .get(offset..offset + 4)
        .and_then(|bytes| <[u8; 4]>::try_from(bytes).ok())
        .unwrap_or_default();
    (u32::from_be_bytes(window) & 0x7fff_ffff) % MODULUS
}

/// Build an `otpauth://` URI for rendering as a QR code.
#[must_use]
pub fn build_provisioning_uri(issuer: &str, account: &str, secret: &TotpSecret) -> String {
    let issuer = urlencoding::encode(issuer);
    let account = urlencoding::encode(account);
    format!(
        "otpauth://totp/{issuer}:{account}?secret={}&issuer={issuer}&algorithm=SHA1&digits={DIGITS}&period={DEFAULT_STEP_SECONDS}",
        secret.to_base32(),
    )
}

/// Verifies codes against the current time.
#[derive(Debug, Clone)]
pub struct TotpEngine {
    clock: SharedClock,
    step_seconds: u64,
    window_steps: u64,
}

impl TotpEngine {
    /// Create an engine with a 30 second step and a window of one step.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            step_seconds: DEFAULT_STEP_SECONDS,
            window_steps: DEFAULT_WINDOW_STEPS,
        }
    }

    /// Override the step and window.
    ///
    /// # Errors
    ///
    /// Returns `TotpError::InvalidStep` if `step_seconds` is zero and
    /// `TotpError::InvalidWindow` if `window_steps` exceeds [`MAX_WINDOW_STEPS`].
    pub fn with_window(
        mut self,
        window_steps: u64,
        step_seconds: u64,
    ) -> Result<Self, TotpError> {
        if step_seconds == 0 {
            return Err(TotpError::InvalidStep);
        }
        if window_steps > MAX_WINDOW_STEPS {
            return Err(TotpError::InvalidWindow);
        }
        self.window_steps = window_steps;
        self.step_seconds = step_seconds;
        Ok(self)
    }

    /// The time step containing the current instant.
    #[must_use]
    pub fn current_step(&self) -> u64 {
        let now = u64::try_from(self.clock.now().timestamp()).unwrap_or(0);
        now / self.step_seconds
    }

    /// The code for the current step.
    #[must_use]
    pub fn current_code(&self, secret: &TotpSecret) -> String {
        compute_code(secret.as_bytes(), self.current_step())
    }

    /// Whether `token` is valid for any step in the window around now.
    #[must_use]
    pub fn verify(&self, secret: &TotpSecret, token: &str) -> bool {
        self.verify_step(secret, token).is_some()
    }

    /// Like [`TotpEngine::verify`], but returns the matching step so callers
    /// can refuse a second use of the same code.
    ///
    /// Every step in the window is checked, even after a match.
    #[must_use]
    pub fn verify_step(&self, secret: &TotpSecret, token: &str) -> Option<u64> {
        if token.len() != DIGITS || !token.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        let current = self.current_step();
        let first = current.saturating_sub(self.window_steps);
        let last = current.saturating_add(self.window_steps);

        let mut matched = None;
        for step in first..=last {
            let candidate = compute_code(secret.as_bytes(), step);
            let equal: Choice = candidate.as_bytes().ct_eq(token.as_bytes());
            if bool::from(equal) && matched.is_none() {
                matched = Some(step);
            }
        }
        matched
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;

    const RFC_SECRET: &[u8] = b"12345678901234567890";

    fn engine_at(unix: i64) -> TotpEngine {
        TotpEngine::new(Arc::new(ManualClock::at_unix(unix)))
    }

    #[test]
    fn test_rfc4226_hotp_vectors() {
        let expected = [
            "755224", "287082", "359152", "969429", "338314", "254676", "287922", "162583",
            "399871", "520489",
        ];
        for (counter, code) in expected.iter().enumerate() {
            assert_eq!(compute_code(RFC_SECRET, counter as u64), *code);
        }
    }

    #[test]
    fn test_rfc6238_sha1_vectors_truncated_to_six_digits() {
        // RFC 6238 appendix B (8-digit values, last six digits kept)
        for (time, code) in [
            (59_i64, "287082"),
            (1_111_111_109, "081804"),
            (1_111_111_111, "050471"),
            (1_234_567_890, "005924"),
            (2_000_000_000, "279037"),
        ] {
            assert_eq!(engine_at(time).current_code(&TotpSecret::from_bytes(RFC_SECRET)), code);
        }
    }

    #[test]
    fn test_compute_code_is_deterministic() {
        let secret = TotpSecret::generate();
        assert_eq!(
            compute_code(secret.as_bytes(), 123),
            compute_code(secret.as_bytes(), 123)
        );
    }

    #[test]
    fn test_verify_accepts_adjacent_steps_only() {
        let secret = TotpSecret::generate();
        let engine = engine_at(30 * 1_000);
        let current = engine.current_step();
        assert_eq!(current, 1_000);

        for step in [current - 1, current, current + 1] {
            let code = compute_code(secret.as_bytes(), step);
            assert_eq!(engine.verify_step(&secret, &code), Some(step));
        }
        for step in [current - 2, current + 2] {
            let code = compute_code(secret.as_bytes(), step);
            // Codes are random enough that an accidental collision is negligible
            assert!(!engine.verify(&secret, &code));
        }
    }

    #[test]
    fn test_verify_rejects_malformed_tokens() {
        let secret = TotpSecret::generate();
        let engine = engine_at(1_000_000);
        let code = engine.current_code(&secret);
        assert!(engine.verify(&secret, &code));
        assert!(!engine.verify(&secret, ""));
        assert!(!engine.verify(&secret, "12345"));
        assert!(!engine.verify(&secret, "1234567"));
        assert!(!engine.verify(&secret, "12a456"));
        assert!(!engine.verify(&secret, &format!(" {code}")));
    }

    #[test]
    fn test_wider_window() {
        let secret = TotpSecret::generate();
        let engine = engine_at(600).with_window(2, 30).unwrap();
        let code = compute_code(secret.as_bytes(), 18);
        assert_eq!(engine.verify_step(&secret, &code), Some(18));
        assert_eq!(
            engine_at(0).with_window(1, 0).unwrap_err(),
            TotpError::InvalidStep
        );
        assert_eq!(
            engine_at(0).with_window(MAX_WINDOW_STEPS + 1, 30).unwrap_err(),
            TotpError::InvalidWindow
        );
        assert_eq!(
            engine_at(0).with_window(u64::MAX, 30).unwrap_err(),
            TotpError::InvalidWindow
        );
        assert!(engine_at(0).with_window(MAX_WINDOW_STEPS, 30).is_ok());
    }

    #[test]
    fn test_window_at_epoch_does_not_underflow() {
        let secret = TotpSecret::generate();
        let engine = engine_at(0);
        let code = compute_code(secret.as_bytes(), 0);
        assert_eq!(engine.verify_step(&secret, &code), Some(0));
    }

    #[test]
    fn test_generated_secret_base32() {
        let secret = TotpSecret::generate();
        assert_eq!(secret.as_bytes().len(), SECRET_LEN);
        let encoded = secret.to_base32();
        assert_eq!(encoded.len(), 32);
        assert!(!encoded.contains('='));
        assert_eq!(encoded, encoded.to_ascii_uppercase());
        assert_eq!(TotpSecret::from_base32(&encoded).unwrap(), secret);
    }

    #[test]
    fn test_from_base32_is_lenient_about_formatting() {
        let secret = TotpSecret::from_base32("gezd gnbv gy3t qojq gezd gnbv gy3t qojq").unwrap();
        assert_eq!(secret.as_bytes(), RFC_SECRET);
        assert!(TotpSecret::from_base32("JBSWY3DPEE======").is_ok());
        assert_eq!(TotpSecret::from_base32("not base32!"), Err(TotpError::InvalidSecret));
        assert_eq!(TotpSecret::from_base32(""), Err(TotpError::InvalidSecret));
    }

    #[test]
    fn test_provisioning_uri() {
        let secret = TotpSecret::from_bytes(RFC_SECRET);
        let uri = build_provisioning_uri("Corner Café", "ana@example.com", &secret);
        assert_eq!(
            uri,
            "otpauth://totp/Corner%20Caf%C3%A9:ana%40example.com?secret=GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ&issuer=Corner%20Caf%C3%A9&algorithm=SHA1&digits=6&period=30"
        );
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = TotpSecret::from_bytes(RFC_SECRET);
        assert_eq!(format!("{secret:?}"), "TotpSecret([REDACTED])");
    }
}
