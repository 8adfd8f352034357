//! Cryptographic primitives.
//!
//! Everything here is pure and synchronous: no I/O, no locks. Time-dependent
//! checks read the injected [`crate::clock::Clock`].
//!
//! - `password` - scrypt credential hashing
//! - `secret_box` - AES-256-GCM sealing of secrets at rest
//! - `totp` - RFC 6238 one-time codes and provisioning URIs
//! - `qr_token` - short-lived HMAC-signed identity tokens
//! - `webhook` - payment webhook signature verification

pub mod password;
pub mod qr_token;
pub mod secret_box;
pub mod totp;
pub mod webhook;

pub use password::{PasswordError, PasswordHasher};
pub use qr_token::{QrTokenSigner, TokenError};
pub use secret_box::{SecretBox, SecretBoxError};
pub use totp::{TotpEngine, TotpError, TotpSecret};
pub use webhook::{WebhookError, WebhookVerifier};
