//! Loyalty card domain types.
//!
//! Balances are stored as `i32` to match the `INTEGER` columns they map to.
//! Every constructor that accepts external input validates it, so a value of
//! these types is always well-formed.

use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{LoyaltyAccountId, UserId};

/// Errors that can occur when parsing an [`IdempotencyKey`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyKeyError {
    /// The input string is empty.
    #[error("idempotency key cannot be empty")]
    Empty,
    /// The input string is too long.
    #[error("idempotency key must be at most {max} characters")]
    TooLong {
        /// Maximum allowed length.
        max: usize,
    },
    /// The input contains a character outside the allowed set.
    #[error("idempotency key contains invalid character {0:?}")]
    InvalidCharacter(char),
}

/// A caller-supplied key that makes a mutating ledger operation apply at most once.
///
/// ## Constraints
///
/// - Length: 1-128 characters
/// - ASCII alphanumerics plus `-`, `_`, `:` and `.`
///
/// ## Examples
///
/// ```
/// use stampline_core::IdempotencyKey;
///
/// assert!(IdempotencyKey::parse("order-1042:stamp").is_ok());
/// assert!(IdempotencyKey::parse("").is_err());
/// assert!(IdempotencyKey::parse("has space").is_err());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Maximum length of an idempotency key.
    pub const MAX_LENGTH: usize = 128;

    /// Parse an `IdempotencyKey` from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is empty, longer than 128 characters,
    /// or contains characters outside the allowed set.
    pub fn parse(s: &str) -> Result<Self, IdempotencyKeyError> {
        if s.is_empty() {
            return Err(IdempotencyKeyError::Empty);
        }

        if s.len() > Self::MAX_LENGTH {
            return Err(IdempotencyKeyError::TooLong {
                max: Self::MAX_LENGTH,
            });
        }

        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.')))
        {
            return Err(IdempotencyKeyError::InvalidCharacter(c));
        }

        Ok(Self(s.to_owned()))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = IdempotencyKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

/// Errors that can occur when parsing a [`CardToken`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CardTokenError {
    /// The token length is outside the accepted range.
    #[error("card token must be between {min} and {max} characters")]
    InvalidLength {
        /// Minimum accepted length.
        min: usize,
        /// Maximum accepted length.
        max: usize,
    },
    /// The token contains a character outside the base64url alphabet.
    #[error("card token must use the base64url alphabet")]
    InvalidAlphabet,
}

/// Opaque identifier printed on (or encoded into) a customer's loyalty card.
///
/// Tokens are random base64url strings. Staff scan this value to redeem
/// rewards, so it never carries the user id.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct CardToken(String);

impl CardToken {
    /// Minimum accepted token length.
    pub const MIN_LENGTH: usize = 16;
    /// Maximum accepted token length.
    pub const MAX_LENGTH: usize = 64;

    /// Parse a `CardToken` from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the length is outside 16-64 characters or the
    /// input uses characters outside the base64url alphabet.
    pub fn parse(s: &str) -> Result<Self, CardTokenError> {
        if !(Self::MIN_LENGTH..=Self::MAX_LENGTH).contains(&s.len()) {
            return Err(CardTokenError::InvalidLength {
                min: Self::MIN_LENGTH,
                max: Self::MAX_LENGTH,
            });
        }

        if !s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(CardTokenError::InvalidAlphabet);
        }

        Ok(Self(s.to_owned()))
    }

    /// Returns the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Card tokens are bearer credentials for redemption; keep them out of logs.
impl fmt::Debug for CardToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CardToken([REDACTED])")
    }
}

impl TryFrom<String> for CardToken {
    type Error = CardTokenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CardToken> for String {
    fn from(token: CardToken) -> Self {
        token.0
    }
}

/// A customer's loyalty balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoyaltyAccount {
    pub id: LoyaltyAccountId,
    pub user_id: UserId,
    /// Stamps collected towards the next reward. Never negative.
    pub stamps: i32,
    /// Lifetime count of rewards redeemed. Never negative.
    pub rewards_redeemed: i32,
    pub card_token: CardToken,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a stamp accrual, cached verbatim for idempotent replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StampOutcome {
    pub earned: i32,
    pub total_stamps: i32,
}

/// Result of a reward redemption, cached verbatim for idempotent replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionOutcome {
    /// Stamps left on the card after the redemption.
    pub stamps: i32,
    pub rewards_redeemed: i32,
    /// Stamps consumed by the redemption.
    pub reward_stamps: i32,
}

/// Errors that can occur when building [`ProgramSettings`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProgramSettingsError {
    #[error("reward threshold must be at least 1 stamp (got {0})")]
    ThresholdTooLow(i32),
}

/// Loyalty program configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramSettings {
    reward_stamps: i32,
}

impl ProgramSettings {
    /// Stamps needed for one reward when no settings are stored.
    pub const DEFAULT_REWARD_STAMPS: i32 = 5;

    /// Create program settings.
    ///
    /// # Errors
    ///
    /// Returns `ProgramSettingsError::ThresholdTooLow` if `reward_stamps < 1`.
    pub const fn new(reward_stamps: i32) -> Result<Self, ProgramSettingsError> {
        if reward_stamps < 1 {
            return Err(ProgramSettingsError::ThresholdTooLow(reward_stamps));
        }
        Ok(Self { reward_stamps })
    }

    /// Stamps consumed by one redemption.
    #[must_use]
    pub const fn reward_stamps(&self) -> i32 {
        self.reward_stamps
    }
}

impl Default for ProgramSettings {
    fn default() -> Self {
        Self {
            reward_stamps: Self::DEFAULT_REWARD_STAMPS,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_valid() {
        let key = IdempotencyKey::parse("pos-7:order.1042_a").unwrap();
        assert_eq!(key.as_str(), "pos-7:order.1042_a");
        assert_eq!(key.to_string(), "pos-7:order.1042_a");
    }

    #[test]
    fn test_idempotency_key_rejects_empty() {
        assert_eq!(IdempotencyKey::parse(""), Err(IdempotencyKeyError::Empty));
    }

    #[test]
    fn test_idempotency_key_rejects_too_long() {
        let long = "a".repeat(IdempotencyKey::MAX_LENGTH + 1);
        assert!(matches!(
            IdempotencyKey::parse(&long),
            Err(IdempotencyKeyError::TooLong { .. })
        ));
        assert!(IdempotencyKey::parse(&"a".repeat(IdempotencyKey::MAX_LENGTH)).is_ok());
    }

    #[test]
    fn test_idempotency_key_rejects_invalid_chars() {
        assert_eq!(
            IdempotencyKey::parse("a/b"),
            Err(IdempotencyKeyError::InvalidCharacter('/'))
        );
    }

    #[test]
    fn test_idempotency_key_deserialize_validates() {
        let ok: Result<IdempotencyKey, _> = serde_json::from_str("\"abc-1\"");
        assert!(ok.is_ok());
        let bad: Result<IdempotencyKey, _> = serde_json::from_str("\"a b\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_card_token_parse() {
        assert!(CardToken::parse("AbCdEfGhIjKlMnOp_-12").is_ok());
        assert!(matches!(
            CardToken::parse("short"),
            Err(CardTokenError::InvalidLength { .. })
        ));
        assert_eq!(
            CardToken::parse("AbCdEfGhIjKlMnOp+/12"),
            Err(CardTokenError::InvalidAlphabet)
        );
    }

    #[test]
    fn test_card_token_debug_is_redacted() {
        let token = CardToken::parse("AbCdEfGhIjKlMnOpQrSt").unwrap();
        assert!(!format!("{token:?}").contains("AbCd"));
    }

    #[test]
    fn test_program_settings() {
        assert_eq!(ProgramSettings::default().reward_stamps(), 5);
        assert_eq!(ProgramSettings::new(8).unwrap().reward_stamps(), 8);
        assert_eq!(
            ProgramSettings::new(0),
            Err(ProgramSettingsError::ThresholdTooLow(0))
        );
    }

    #[test]
    fn test_outcomes_serialize_camel_case() {
        let json = serde_json::to_value(StampOutcome {
            earned: 3,
            total_stamps: 7,
        })
        .unwrap();
        assert_eq!(json["totalStamps"], 7);

        let json = serde_json::to_value(RedemptionOutcome {
            stamps: 0,
            rewards_redeemed: 1,
            reward_stamps: 5,
        })
        .unwrap();
        assert_eq!(json["rewardsRedeemed"], 1);
        assert_eq!(json["rewardStamps"], 5);
    }
}
