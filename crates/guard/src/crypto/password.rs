//! Password credential hashing.
//!
//! Credentials are encoded as
//! `scrypt$<N>$<r>$<p>$<salt-b64url>$<hash-b64url>` so the cost parameters
//! travel with the hash and can be raised later without invalidating
//! existing credentials.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

/// Minimum password length, in characters.
pub const MIN_PASSWORD_LENGTH: usize = 10;

/// Maximum password length, in characters.
pub const MAX_PASSWORD_LENGTH: usize = 200;

const ALGORITHM_ID: &str = "scrypt";
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

// Cost bounds checked before any derivation. A stored credential may ask for
// at most 64 MiB of scratch (128 * r * N bytes) and 4 lanes.
const MAX_LOG_N: u8 = 20;
const MAX_R: u32 = 32;
const MAX_P: u32 = 4;
const MAX_SCRATCH_BYTES: u64 = 64 * 1024 * 1024;
const MIN_STORED_HASH_LEN: usize = 16;
const MAX_STORED_HASH_LEN: usize = 64;

/// Errors that can occur while creating a credential.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PasswordError {
    #[error("password must be at least {MIN_PASSWORD_LENGTH} characters")]
    TooShort,

    #[error("password must be at most {MAX_PASSWORD_LENGTH} characters")]
    TooLong,

    /// The configured cost parameters were rejected by scrypt.
    #[error("invalid key derivation parameters")]
    InvalidParameters,
}

/// scrypt-based password hasher.
///
/// The default cost is N = 2^14, r = 8, p = 1 (16 MiB per derivation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordHasher {
    log_n: u8,
    r: u32,
    p: u32,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self {
            log_n: 14,
            r: 8,
            p: 1,
        }
    }
}

impl PasswordHasher {
    /// Create a hasher with explicit cost parameters.
    ///
    /// # Errors
    ///
    /// Returns `PasswordError::InvalidParameters` if scrypt rejects the
    /// parameters or they exceed the bounds accepted at verification time.
    pub fn with_cost(log_n: u8, r: u32, p: u32) -> Result<Self, PasswordError> {
        if log_n == 0 || !within_cost_budget(log_n, r, p) {
            return Err(PasswordError::InvalidParameters);
        }
        scrypt::Params::new(log_n, r, p, HASH_LEN).map_err(|_| PasswordError::InvalidParameters)?;
        Ok(Self { log_n, r, p })
    }

    /// Hash a password into an encoded credential string.
    ///
    /// # Errors
    ///
    /// Returns `PasswordError::TooShort` / `PasswordError::TooLong` if the
    /// password length is outside 10-200 characters.
    pub fn create(&self, password: &str) -> Result<String, PasswordError> {
        validate_password(password)?;

        let mut salt = [0u8; SALT_LEN];
        rand::rng().fill_bytes(&mut salt);

        let hash = derive(password.as_bytes(), &salt, self.log_n, self.r, self.p, HASH_LEN)
            .ok_or(PasswordError::InvalidParameters)?;

        Ok(format!(
            "{ALGORITHM_ID}${}${}${}${}${}",
            1u64 << self.log_n,
            self.r,
            self.p,
            URL_SAFE_NO_PAD.encode(salt),
            URL_SAFE_NO_PAD.encode(hash.as_slice()),
        ))
    }

    /// Verify a password against an encoded credential.
    ///
    /// Returns `false` for a wrong password and for any malformed credential.
    #[must_use]
    pub fn verify(&self, password: &str, stored: &str) -> bool {
        let Some(parsed) = ParsedCredential::parse(stored) else {
            return false;
        };

        let Some(candidate) = derive(
            password.as_bytes(),
            &parsed.salt,
            parsed.log_n,
            parsed.r,
            parsed.p,
            parsed.hash.len(),
        ) else {
            return false;
        };

        candidate.as_slice().ct_eq(parsed.hash.as_slice()).into()
    }

    /// Whether a stored credential was produced with different cost parameters.
    ///
    /// Malformed credentials always need rehashing.
    #[must_use]
    pub fn needs_rehash(&self, stored: &str) -> bool {
        ParsedCredential::parse(stored).is_none_or(|parsed| {
            parsed.log_n != self.log_n
                || parsed.r != self.r
                || parsed.p != self.p
                || parsed.hash.len() != HASH_LEN
        })
    }
}

/// Hash a password with the default cost parameters.
///
/// # Errors
///
/// See [`PasswordHasher::create`].
pub fn create(password: &str) -> Result<String, PasswordError> {
    PasswordHasher::default().create(password)
}

/// Verify a password against an encoded credential.
#[must_use]
pub fn verify(password: &str, stored: &str) -> bool {
    PasswordHasher::default().verify(password, stored)
}

fn validate_password(password: &str) -> Result<(), PasswordError> {
    let length = password.chars().count();
    if length < MIN_PASSWORD_LENGTH {
        return Err(PasswordError::TooShort);
    }
    if length > MAX_PASSWORD_LENGTH {
        return Err(PasswordError::TooLong);
    }
    Ok(())
}

fn within_cost_budget(log_n: u8, r: u32, p: u32) -> bool {
    if log_n > MAX_LOG_N || r == 0 || r > MAX_R || p == 0 || p > MAX_P {
        return false;
    }
    128 * u64::from(r) * (1u64 << log_n) <= MAX_SCRATCH_BYTES
}

fn derive(
    password: &[u8],
    salt: &[u8],
    log_n: u8,
    r: u32,
    p: u32,
    len: usize,
) -> Option<Zeroizing<Vec<u8>>> {
    let params = scrypt::Params::new(log_n, r, p, len).ok()?;
    let mut output = Zeroizing::new(vec![0u8; len]);
    scrypt::scrypt(password, salt, &params, output.as_mut_slice()).ok()?;
    Some(output)
}

struct ParsedCredential {
    log_n: u8,
    r: u32,
    p: u32,
    salt: Vec<u8>,
    hash: Vec<u8>,
}

impl ParsedCredential {
    fn parse(stored: &str) -> Option<Self> {
        let mut parts = stored.split('$');
        if parts.next()? != ALGORITHM_ID {
            return None;
        }

        let n: u64 = parts.next()?.parse().ok()?;
        let r: u32 = parts.next()?.parse().ok()?;
        let p: u32 = parts.next()?.parse().ok()?;
        let salt = URL_SAFE_NO_PAD.decode(parts.next()?).ok()?;
        let hash = URL_SAFE_NO_PAD.decode(parts.next()?).ok()?;
        if parts.next().is_some() {
            return None;
        }

        if n < 2 || !n.is_power_of_two() {
            return None;
        }
        let log_n = u8::try_from(n.trailing_zeros()).ok()?;

        if !within_cost_budget(log_n, r, p) {
            return None;
        }
        if salt.is_empty()
            || !(MIN_STORED_HASH_LEN..=MAX_STORED_HASH_LEN).contains(&hash.len())
        {
            return None;
        }

        Some(Self {
            log_n,
            r,
            p,
            salt,
            hash,
        })
    }
}
