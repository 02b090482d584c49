//! Persistence seams for accounts, single-use tokens, session revocations and
//! rate-limit counters.
//!
//! The core only talks to these traits. Two properties must hold for every
//! implementation:
//! - `TokenRepository::mark_consumed` is a compare-and-set on `consumed_at`;
//!   at most one caller wins for a given token.
//! - `AccountRepository::update` is a compare-and-set against the state the
//!   caller read; a concurrent status or role change is never overwritten.
//! - `CounterStore::increment_with_ceiling` increments and compares in one
//!   atomic step and never increments past the ceiling.
//!
//! `memory` backs tests and single-process embedding; `postgres` is the
//! production implementation.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tracing::error;
use uuid::Uuid;

use super::account::Account;
use super::error::{AccountField, AuthError};
use super::tokens::TokenKind;

pub mod memory;
pub mod postgres;

/// Outcome when attempting to create a new account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Created,
    Conflict(AccountField),
}

/// Persisted single-use token. Only the SHA-256 of the secret is stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenRecord {
    pub id: Uuid,
    pub secret_hash: Vec<u8>,
    pub account_id: Uuid,
    pub kind: TokenKind,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    /// Unconsumed and not yet expired.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.consumed_at.is_none() && now < self.expires_at
    }
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Insert a new account; unique collisions are reported, not raised.
    async fn insert(&self, account: &Account) -> Result<InsertOutcome>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>>;

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>>;

    async fn find_by_username(&self, username: &str) -> Result<Option<Account>>;

    /// First unique field already taken by another account, checked in the
    /// order email, username, phone.
    async fn find_conflict(
        &self,
        email: &str,
        username: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Option<AccountField>>;

    /// Compare-and-set of status, role, archival and verification flags.
    ///
    /// `account` is written only if the stored row still carries the same
    /// status, role and flags as `read`. Returns `false` if the account
    /// changed in between or vanished. Login counters and the password hash
    /// are left untouched; they have their own atomic writes below.
    async fn update(&self, read: &Account, account: &Account) -> Result<bool>;

    /// Reset `failed_login_count`, bump `login_count`, stamp `last_login_at`.
    async fn record_login_success(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Atomically increment `failed_login_count` and stamp `last_failed_login_at`.
    async fn record_login_failure(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Replace the password hash, stamp `password_changed_at`, and reset the
    /// failure counter.
    async fn update_password(&self, id: Uuid, password_hash: &str, at: DateTime<Utc>)
    -> Result<bool>;

    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Accounts ordered by creation time; archived ones only on request.
    async fn list(&self, include_archived: bool) -> Result<Vec<Account>>;
}

#[async_trait]
pub trait TokenRepository: Send + Sync {
    /// Persist a single-use token and delete every other live token of the
    /// same kind for the same account, in one atomic step.
    ///
    /// Returns how many live tokens were invalidated.
    async fn insert_single_use(&self, record: &TokenRecord) -> Result<u64>;

    async fn find_by_secret_hash(&self, secret_hash: &[u8]) -> Result<Option<TokenRecord>>;

    /// Compare-and-set `consumed_at` from null to `at`.
    ///
    /// Returns `false` if the token was already consumed (or vanished).
    async fn mark_consumed(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    async fn latest_issued_at(
        &self,
        account_id: Uuid,
        kind: TokenKind,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Delete every single-use token of the account. The session epoch is
    /// kept so sessions issued before the deletion stay invalid.
    async fn delete_for_account(&self, account_id: Uuid) -> Result<u64>;

    /// Delete consumed or expired single-use tokens.
    async fn purge_tokens(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Record a session token id as revoked until `expires_at`.
    ///
    /// Returns `false` if it was already revoked.
    async fn revoke_session(&self, token_id: &str, expires_at: DateTime<Utc>) -> Result<bool>;

    async fn is_session_revoked(&self, token_id: &str) -> Result<bool>;

    /// Drop revocation entries whose tokens have expired on their own.
    async fn purge_revocations(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Current session generation for an account. Starts at zero.
    async fn session_epoch(&self, account_id: Uuid) -> Result<i64>;

    /// Invalidate every session issued so far for the account.
    async fn bump_session_epoch(&self, account_id: Uuid) -> Result<i64>;
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter under `key` unless it already reached
    /// `ceiling`. Counters past `expires_at` restart at one.
    ///
    /// Returns the new count, or `None` if the ceiling was already reached.
    async fn increment_with_ceiling(
        &self,
        key: &str,
        ceiling: u32,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<u32>>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Run a storage future under a deadline.
///
/// Faults and timeouts are logged and collapsed into `AuthError::Unavailable`
/// so they never masquerade as a credential decision.
pub(crate) async fn bounded<T, F>(
    timeout: Duration,
    operation: &'static str,
    future: F,
) -> Result<T, AuthError>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            error!("Storage operation '{operation}' failed: {err:#}");
            Err(AuthError::Unavailable(operation))
        }
        Err(_) => {
            error!("Storage operation '{operation}' timed out after {timeout:?}");
            Err(AuthError::Unavailable(operation))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn bounded_passes_values_through() {
        let value = bounded(Duration::from_secs(1), "noop", async { Ok(7) }).await;
        assert_eq!(value, Ok(7));
    }

    #[tokio::test]
    async fn bounded_maps_errors_to_unavailable() {
        let value: Result<(), AuthError> = bounded(Duration::from_secs(1), "lookup", async {
            Err(anyhow!("connection refused"))
        })
        .await;
        assert_eq!(value, Err(AuthError::Unavailable("lookup")));
    }

    #[tokio::test]
    async fn bounded_maps_timeouts_to_unavailable() {
        let value: Result<(), AuthError> = bounded(Duration::from_millis(10), "slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(value, Err(AuthError::Unavailable("slow")));
    }

    #[test]
    fn token_record_liveness() {
        let now = Utc::now();
        let mut record = TokenRecord {
            id: Uuid::nil(),
            secret_hash: vec![1],
            account_id: Uuid::nil(),
            kind: TokenKind::PasswordReset,
            issued_at: now,
            expires_at: now + ChronoDuration::minutes(5),
            consumed_at: None,
        };
        assert!(record.is_live(now));
        assert!(!record.is_live(now + ChronoDuration::minutes(5)));
        record.consumed_at = Some(now);
        assert!(!record.is_live(now));
    }
}
