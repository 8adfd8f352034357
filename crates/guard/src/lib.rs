//! Stampline guard.
//!
//! Security and ledger core for the Stampline loyalty program: credential
//! hashing, sealed MFA secrets, TOTP, signed QR identity tokens, payment
//! webhook verification, rate limiting and the stamp/redeem ledger.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod clock;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod services;
pub mod state;
pub mod telemetry;
