//! Loyalty ledger errors.

use thiserror::Error;

use crate::crypto::TokenError;
use crate::db::StoreError;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The acting staff member's role does not allow the operation.
    #[error("not permitted to {0}")]
    Forbidden(&'static str),

    /// The customer's QR token was rejected.
    #[error("invalid loyalty token: {0}")]
    Token(#[from] TokenError),

    #[error("{0}")]
    Validation(String),

    /// No account holds the scanned card token.
    #[error("loyalty card not found")]
    AccountNotFound,

    #[error("insufficient stamps: have {stamps}, need {required}")]
    InsufficientStamps { stamps: i32, required: i32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}
