//! Unified error handling with Sentry integration.
//!
//! Every component error converts into an `AppError` category, and
//! `AppError` converts into an HTTP response. Server-side failures are
//! captured to Sentry before responding.

use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::crypto::{PasswordError, SecretBoxError, TokenError, TotpError, WebhookError};
use crate::db::StoreError;
use crate::services::loyalty::LedgerError;
use crate::services::mfa::MfaError;
use crate::services::rate_limit::RateLimitError;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Caller input was rejected.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Credential, token, code or signature did not check out.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Forbidden: {0}")]
    Authorization(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient stamps: have {stamps}, need {required}")]
    InsufficientStamps { stamps: i32, required: i32 },

    #[error("Rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    /// Stored ciphertext failed authentication.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// The store could not be reached or the query failed.
    #[error("Store unavailable: {0}")]
    TransientStore(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Authorization(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::InsufficientStamps { .. } => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Integrity(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Whether the error is reported to Sentry.
    #[must_use]
    pub const fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::Integrity(_) | Self::Internal(_) | Self::TransientStore(_)
        )
    }

    /// Message safe to show to the client.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Integrity(_) | Self::Internal(_) => "Internal server error".to_string(),
            Self::TransientStore(_) => "Service temporarily unavailable".to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.is_server_error() {
            let event_id = sentry::capture_error(&self);
            tracing::error!(
                error = %self,
                sentry_event_id = %event_id,
                "Request error"
            );
        }

        let status = self.status();
        let message = self.client_message();

        if let Self::RateLimited {
            retry_after_seconds,
        } = self
        {
            return (
                status,
                [(header::RETRY_AFTER, retry_after_seconds.to_string())],
                message,
            )
                .into_response();
        }

        (status, message).into_response()
    }
}

/// Result type alias for `AppError`.
pub type Result<T> = std::result::Result<T, AppError>;

impl From<PasswordError> for AppError {
    fn from(err: PasswordError) -> Self {
        match err {
            PasswordError::TooShort | PasswordError::TooLong => Self::Validation(err.to_string()),
            PasswordError::InvalidParameters => Self::Internal(err.to_string()),
        }
    }
}

impl From<SecretBoxError> for AppError {
    fn from(err: SecretBoxError) -> Self {
        match err {
            SecretBoxError::Malformed
            | SecretBoxError::UnsupportedVersion
            | SecretBoxError::Integrity => Self::Integrity(err.to_string()),
            SecretBoxError::EmptyKey | SecretBoxError::Encryption => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<TotpError> for AppError {
    fn from(err: TotpError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::MalformedToken
            | TokenError::InvalidSignature
            | TokenError::Expired
            | TokenError::InvalidPayload => Self::Authentication(err.to_string()),
            TokenError::InvalidTtl | TokenError::EmptySecret => Self::Internal(err.to_string()),
        }
    }
}

impl From<WebhookError> for AppError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::MissingHeader
            | WebhookError::MalformedHeader
            | WebhookError::TimestampOutsideTolerance
            | WebhookError::SignatureMismatch => Self::Authentication(err.to_string()),
            WebhookError::InvalidPayload(_) => Self::Validation(err.to_string()),
            WebhookError::NoSecret => Self::Internal(err.to_string()),
        }
    }
}

impl From<RateLimitError> for AppError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Exceeded {
                retry_after_seconds,
            } => Self::RateLimited {
                retry_after_seconds,
            },
            RateLimitError::InvalidWindow => Self::Internal(err.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(_) => Self::TransientStore(err.to_string()),
            StoreError::DataCorruption(_) => Self::Internal(err.to_string()),
            StoreError::Conflict(_) => Self::Conflict(err.to_string()),
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Forbidden(_) => Self::Authorization(err.to_string()),
            LedgerError::Token(inner) => inner.into(),
            LedgerError::Validation(msg) => Self::Validation(msg),
            LedgerError::AccountNotFound => Self::NotFound(err.to_string()),
            LedgerError::InsufficientStamps { stamps, required } => {
                Self::InsufficientStamps { stamps, required }
            }
            LedgerError::Store(inner) => inner.into(),
        }
    }
}

impl From<MfaError> for AppError {
    fn from(err: MfaError) -> Self {
        match err {
            MfaError::AlreadyEnabled => Self::Conflict(err.to_string()),
            MfaError::NotPending => Self::NotFound(err.to_string()),
            MfaError::NotEnabled | MfaError::InvalidCode | MfaError::CodeReused => {
                Self::Authentication(err.to_string())
            }
            MfaError::RateLimited(inner) => inner.into(),
            MfaError::Integrity(inner) => inner.into(),
            MfaError::Store(inner) => inner.into(),
        }
    }
}
