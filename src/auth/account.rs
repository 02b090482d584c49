//! Account identity record and its closed enumerations.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Client,
    Collector,
    Admin,
    Operations,
    Finance,
    Support,
}

impl Role {
    pub const ALL: [Self; 6] = [
        Self::Client,
        Self::Collector,
        Self::Admin,
        Self::Operations,
        Self::Finance,
        Self::Support,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "CLIENT",
            Self::Collector => "COLLECTOR",
            Self::Admin => "ADMIN",
            Self::Operations => "OPERATIONS",
            Self::Finance => "FINANCE",
            Self::Support => "SUPPORT",
        }
    }

    /// Roles an end user may pick for themselves at signup.
    #[must_use]
    pub fn is_self_service(self) -> bool {
        matches!(self, Self::Client | Self::Collector)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| anyhow!("unknown role: {value}"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Pending,
    Active,
    Suspended,
    Blocked,
    Deactivated,
}

impl AccountStatus {
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Active,
        Self::Suspended,
        Self::Blocked,
        Self::Deactivated,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Suspended => "SUSPENDED",
            Self::Blocked => "BLOCKED",
            Self::Deactivated => "DEACTIVATED",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| anyhow!("unknown account status: {value}"))
    }
}

/// Persisted account record.
///
/// `email`, `username` and `phone` are stored normalized and are each unique
/// when present. `password_hash` is an Argon2 PHC string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub username: Option<String>,
    pub phone: Option<String>,
    pub password_hash: String,
    pub role: Role,
    pub status: AccountStatus,
    pub archived: bool,
    pub email_verified: bool,
    pub phone_verified: bool,
    pub failed_login_count: i64,
    pub login_count: i64,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_failed_login_at: Option<DateTime<Utc>>,
    pub password_changed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Fresh signup record: `PENDING`, unverified, no login history.
    #[must_use]
    pub fn pending(
        id: Uuid,
        email: String,
        username: Option<String>,
        phone: Option<String>,
        password_hash: String,
        role: Role,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            email,
            username,
            phone,
            password_hash,
            role,
            status: AccountStatus::Pending,
            archived: false,
            email_verified: false,
            phone_verified: false,
            failed_login_count: 0,
            login_count: 0,
            last_login_at: None,
            last_failed_login_at: None,
            password_changed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Public view of an account, without the password hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub id: Uuid,
    pub email: String,
    pub username: Option<String>,
    pub phone: Option<String>,
    pub role: Role,
    pub status: AccountStatus,
    pub archived: bool,
    pub email_verified: bool,
    pub phone_verified: bool,
    pub login_count: i64,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&Account> for AccountSummary {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id,
            email: account.email.clone(),
            username: account.username.clone(),
            phone: account.phone.clone(),
            role: account.role,
            status: account.status,
            archived: account.archived,
            email_verified: account.email_verified,
            phone_verified: account.phone_verified,
            login_count: account.login_count,
            last_login_at: account.last_login_at,
            created_at: account.created_at,
        }
    }
}
