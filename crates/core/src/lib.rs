//! Stampline Core - Shared types library.
//!
//! This crate provides common types used across all Stampline components:
//! - `guard` - Credential, token, webhook and loyalty ledger primitives
//! - `cli` - Command-line tools for migrations and operator tasks
//!
//! # Architecture
//!
//! The core crate contains only types and traits - no I/O, no database access,
//! no cryptography. This keeps it lightweight and allows it to be used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Newtype wrappers for type-safe IDs, loyalty values, roles and statuses

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
