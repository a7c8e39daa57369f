//! Records owned by the admission core.
//!
//! Timestamps are Unix seconds (UTC), as stored in SQLite.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type AccountId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// An account with a prepaid balance. The balance never goes below zero.
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub account_id: AccountId,
    /// Identifier issued by the identity provider.
    pub external_id: String,
    pub email: String,
    pub display_name: String,
    pub role: Role,
    pub balance: i64,
    pub locked: bool,
    pub created_at: i64,
}

/// Already-authenticated identity handed over by the login flow.
#[derive(Debug, Clone)]
pub struct Identity {
    pub external_id: String,
    pub email: String,
    pub display_name: Option<String>,
}

/// A named tier: rate-limit ceiling plus per-request price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub code: String,
    pub name: String,
    /// Requests per window; `None` or zero means unlimited.
    pub rate_limit: Option<u32>,
    /// Price per request; `None` means requests are free.
    pub price: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub subscription_id: i64,
    pub account_id: AccountId,
    pub plan_code: String,
    pub active: bool,
    pub started_at: i64,
    pub expires_at: Option<i64>,
}

impl Subscription {
    /// Active flag set and expiry, if any, strictly in the future.
    pub fn is_active_at(&self, now: i64) -> bool {
        self.active && self.expires_at.is_none_or(|expiry| expiry > now)
    }
}

/// Result of plan resolution.
#[derive(Debug, Clone)]
pub struct ActivePlan {
    pub plan: Plan,
    pub subscription: Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Deduct,
    Topup,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Deduct => "deduct",
            LedgerKind::Topup => "topup",
        }
    }
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deduct" => Ok(LedgerKind::Deduct),
            "topup" => Ok(LedgerKind::Topup),
            other => Err(format!("unknown ledger kind '{other}'")),
        }
    }
}

/// Immutable record of one balance change. At most one exists per
/// idempotency key.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub entry_id: i64,
    pub account_id: AccountId,
    /// Signed: negative for debits.
    pub amount: i64,
    pub kind: LedgerKind,
    pub reason: String,
    pub idempotency_key: String,
    pub created_at: i64,
}

/// Append-only log line for an admitted request.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub account_id: AccountId,
    pub plan_code: Option<String>,
    pub endpoint: String,
    pub cost: i64,
    pub request_id: String,
    pub created_at: i64,
}
