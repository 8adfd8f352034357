//! Role and status enums.

use serde::{Deserialize, Serialize};

use super::id::StaffId;

/// Staff role with different permission levels at the register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffRole {
    /// Read-only access (reports, balances).
    Viewer,
    /// Can stamp cards and redeem rewards.
    Staff,
    /// Staff permissions plus loyalty program configuration.
    Manager,
}

impl StaffRole {
    /// Whether this role may mutate loyalty balances.
    #[must_use]
    pub const fn can_operate_register(self) -> bool {
        matches!(self, Self::Staff | Self::Manager)
    }

    /// Whether this role may change loyalty program settings.
    #[must_use]
    pub const fn can_manage_program(self) -> bool {
        matches!(self, Self::Manager)
    }
}

impl std::fmt::Display for StaffRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Viewer => write!(f, "viewer"),
            Self::Staff => write!(f, "staff"),
            Self::Manager => write!(f, "manager"),
        }
    }
}

impl std::str::FromStr for StaffRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Self::Viewer),
            "staff" => Ok(Self::Staff),
            "manager" => Ok(Self::Manager),
            _ => Err(format!("invalid staff role: {s}")),
        }
    }
}

/// The staff member performing an operation, passed explicitly for audit attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub staff_id: StaffId,
    pub role: StaffRole,
}

impl Actor {
    #[must_use]
    pub const fn new(staff_id: StaffId, role: StaffRole) -> Self {
        Self { staff_id, role }
    }
}

/// Lifecycle state of a user's TOTP enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MfaStatus {
    /// Secret generated, waiting for the first correct code.
    Pending,
    /// Confirmed and required at sign-in.
    Enabled,
}

impl std::fmt::Display for MfaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Enabled => write!(f, "enabled"),
        }
    }
}

impl std::str::FromStr for MfaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "enabled" => Ok(Self::Enabled),
            _ => Err(format!("invalid mfa status: {s}")),
        }
    }
}
