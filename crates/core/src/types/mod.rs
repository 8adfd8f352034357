//! Core types for Stampline.
//!
//! This module provides type-safe wrappers for common domain concepts.

pub mod id;
pub mod loyalty;
pub mod status;

pub use id::*;
pub use loyalty::{
    CardToken, CardTokenError, IdempotencyKey, IdempotencyKeyError, LoyaltyAccount,
    ProgramSettings, ProgramSettingsError, RedemptionOutcome, StampOutcome,
};
pub use status::*;
