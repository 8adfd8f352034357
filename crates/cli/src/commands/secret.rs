//! Secret generation and password hashing.

use std::io::BufRead;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use stampline_guard::crypto::{PasswordError, PasswordHasher};
use thiserror::Error;

/// Default size of generated secrets (43 base64url characters).
pub const DEFAULT_SECRET_BYTES: usize = 32;

/// Smallest secret that passes configuration validation.
const MIN_SECRET_BYTES: usize = 24;
const MAX_SECRET_BYTES: usize = 1024;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret size must be between {MIN_SECRET_BYTES} and {MAX_SECRET_BYTES} bytes")]
    InvalidLength,

    #[error("no password on stdin")]
    EmptyInput,

    #[error(transparent)]
    Password(#[from] PasswordError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Random base64url string from `bytes` random bytes.
///
/// # Errors
///
/// Returns `SecretError::InvalidLength` outside 24..=1024 bytes.
pub fn random_secret(bytes: usize) -> Result<String, SecretError> {
    if !(MIN_SECRET_BYTES..=MAX_SECRET_BYTES).contains(&bytes) {
        return Err(SecretError::InvalidLength);
    }
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    Ok(URL_SAFE_NO_PAD.encode(buf))
}

/// Print a fresh random secret.
///
/// # Errors
///
/// See [`random_secret`].
pub fn generate(bytes: usize) -> Result<(), SecretError> {
    let secret = random_secret(bytes)?;
    #[allow(clippy::print_stdout)]
    {
        println!("{secret}");
    }
    Ok(())
}

/// Strip the trailing newline from one line of input.
fn read_password(input: impl BufRead) -> Result<String, SecretError> {
    let line = input.lines().next().ok_or(SecretError::EmptyInput)??;
    let password = line.trim_end_matches('\r').to_owned();
    if password.is_empty() {
        return Err(SecretError::EmptyInput);
    }
    Ok(password)
}

/// Hash the first line of stdin and print the credential string.
///
/// # Errors
///
/// Returns an error if stdin is empty or the password is rejected.
pub fn hash_password() -> Result<(), SecretError> {
    let password = read_password(std::io::stdin().lock())?;
    let credential = PasswordHasher::default().create(&password)?;

    #[allow(clippy::print_stdout)]
    {
        println!("{credential}");
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_random_secret_length() {
        let secret = random_secret(DEFAULT_SECRET_BYTES).unwrap();
        assert_eq!(secret.len(), 43);
        assert_ne!(secret, random_secret(DEFAULT_SECRET_BYTES).unwrap());
    }

    #[test]
    fn test_random_secret_bounds() {
        assert!(matches!(random_secret(8), Err(SecretError::InvalidLength)));
        assert!(matches!(random_secret(4096), Err(SecretError::InvalidLength)));
    }

    #[test]
    fn test_read_password_strips_line_ending() {
        let password = read_password("hunter2hunter2\r\nignored\n".as_bytes()).unwrap();
        assert_eq!(password, "hunter2hunter2");
    }

    #[test]
    fn test_read_password_empty() {
        assert!(matches!(read_password("".as_bytes()), Err(SecretError::EmptyInput)));
        assert!(matches!(read_password("\n".as_bytes()), Err(SecretError::EmptyInput)));
    }
}
