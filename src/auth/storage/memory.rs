//! In-process storage backed by `tokio::sync::Mutex` maps.
//!
//! Each repository guards all of its tables with a single lock, which makes
//! every trait method trivially atomic.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AccountRepository, CounterStore, InsertOutcome, TokenRecord, TokenRepository};
use crate::auth::account::Account;
use crate::auth::error::AccountField;
use crate::auth::tokens::TokenKind;

#[derive(Default)]
pub struct MemoryAccountRepository {
    accounts: Mutex<HashMap<Uuid, Account>>,
}

fn conflict_in(
    accounts: &HashMap<Uuid, Account>,
    email: &str,
    username: Option<&str>,
    phone: Option<&str>,
) -> Option<AccountField> {
    if accounts.values().any(|a| a.email == email) {
        return Some(AccountField::Email);
    }
    if let Some(username) = username {
        if accounts
            .values()
            .any(|a| a.username.as_deref() == Some(username))
        {
            return Some(AccountField::Username);
        }
    }
    if let Some(phone) = phone {
        if accounts.values().any(|a| a.phone.as_deref() == Some(phone)) {
            return Some(AccountField::Phone);
        }
    }
    None
}

/// Fields guarded by the `update` compare-and-set.
fn same_state(stored: &Account, read: &Account) -> bool {
    stored.role == read.role
        && stored.status == read.status
        && stored.archived == read.archived
        && stored.email_verified == read.email_verified
        && stored.phone_verified == read.phone_verified
}

#[async_trait]
impl AccountRepository for MemoryAccountRepository {
    async fn insert(&self, account: &Account) -> Result<InsertOutcome> {
        let mut accounts = self.accounts.lock().await;
        if let Some(field) = conflict_in(
            &accounts,
            &account.email,
            account.username.as_deref(),
            account.phone.as_deref(),
        ) {
            return Ok(InsertOutcome::Conflict(field));
        }
        accounts.insert(account.id, account.clone());
        Ok(InsertOutcome::Created)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>> {
        Ok(self.accounts.lock().await.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>> {
        let accounts = self.accounts.lock().await;
        Ok(accounts.values().find(|a| a.email == email).cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Account>> {
        let accounts = self.accounts.lock().await;
        Ok(accounts
            .values()
            .find(|a| a.username.as_deref() == Some(username))
            .cloned())
    }

    async fn find_conflict(
        &self,
        email: &str,
        username: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Option<AccountField>> {
        let accounts = self.accounts.lock().await;
        Ok(conflict_in(&accounts, email, username, phone))
    }

    async fn update(&self, read: &Account, account: &Account) -> Result<bool> {
        let mut accounts = self.accounts.lock().await;
        let Some(stored) = accounts.get_mut(&account.id) else {
            return Ok(false);
        };
        if !same_state(stored, read) {
            return Ok(false);
        }
        stored.role = account.role;
        stored.status = account.status;
        stored.archived = account.archived;
        stored.email_verified = account.email_verified;
        stored.phone_verified = account.phone_verified;
        stored.updated_at = account.updated_at;
        Ok(true)
    }

    async fn record_login_success(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(account) = self.accounts.lock().await.get_mut(&id) {
            account.failed_login_count = 0;
            account.login_count += 1;
            account.last_login_at = Some(at);
        }
        Ok(())
    }

    async fn record_login_failure(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(account) = self.accounts.lock().await.get_mut(&id) {
            account.failed_login_count += 1;
            account.last_failed_login_at = Some(at);
        }
        Ok(())
    }

    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut accounts = self.accounts.lock().await;
        let Some(account) = accounts.get_mut(&id) else {
            return Ok(false);
        };
        account.password_hash = password_hash.to_string();
        account.password_changed_at = Some(at);
        account.failed_login_count = 0;
        account.updated_at = at;
        Ok(true)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.accounts.lock().await.remove(&id).is_some())
    }

    async fn list(&self, include_archived: bool) -> Result<Vec<Account>> {
        let accounts = self.accounts.lock().await;
        let mut listed: Vec<Account> = accounts
            .values()
            .filter(|a| include_archived || !a.archived)
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(listed)
    }
}

#[derive(Default)]
struct TokenTables {
    tokens: HashMap<Uuid, TokenRecord>,
    by_hash: HashMap<Vec<u8>, Uuid>,
    revoked: HashMap<String, DateTime<Utc>>,
    epochs: HashMap<Uuid, i64>,
}

impl TokenTables {
    fn remove(&mut self, id: Uuid) {
        if let Some(record) = self.tokens.remove(&id) {
            self.by_hash.remove(&record.secret_hash);
        }
    }
}

#[derive(Default)]
pub struct MemoryTokenRepository {
    tables: Mutex<TokenTables>,
}

impl MemoryTokenRepository {
    /// Live single-use tokens of `kind` held by `account_id`.
    pub async fn count_live(&self, account_id: Uuid, kind: TokenKind, now: DateTime<Utc>) -> usize {
        let tables = self.tables.lock().await;
        tables
            .tokens
            .values()
            .filter(|r| r.account_id == account_id && r.kind == kind && r.is_live(now))
            .count()
    }

    /// Stored single-use tokens, live or not.
    pub async fn stored(&self) -> usize {
        self.tables.lock().await.tokens.len()
    }
}

#[async_trait]
impl TokenRepository for MemoryTokenRepository {
    async fn insert_single_use(&self, record: &TokenRecord) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let superseded: Vec<Uuid> = tables
            .tokens
            .values()
            .filter(|r| {
                r.account_id == record.account_id && r.kind == record.kind && r.consumed_at.is_none()
            })
            .map(|r| r.id)
            .collect();
        for id in &superseded {
            tables.remove(*id);
        }
        tables.by_hash.insert(record.secret_hash.clone(), record.id);
        tables.tokens.insert(record.id, record.clone());
        Ok(superseded.len() as u64)
    }

    async fn find_by_secret_hash(&self, secret_hash: &[u8]) -> Result<Option<TokenRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .by_hash
            .get(secret_hash)
            .and_then(|id| tables.tokens.get(id))
            .cloned())
    }

    async fn mark_consumed(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.tokens.get_mut(&id) {
            Some(record) if record.consumed_at.is_none() => {
                record.consumed_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn latest_issued_at(
        &self,
        account_id: Uuid,
        kind: TokenKind,
    ) -> Result<Option<DateTime<Utc>>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .tokens
            .values()
            .filter(|r| r.account_id == account_id && r.kind == kind)
            .map(|r| r.issued_at)
            .max())
    }

    async fn delete_for_account(&self, account_id: Uuid) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let owned: Vec<Uuid> = tables
            .tokens
            .values()
            .filter(|r| r.account_id == account_id)
            .map(|r| r.id)
            .collect();
        for id in &owned {
            tables.remove(*id);
        }
        Ok(owned.len() as u64)
    }

    async fn purge_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let dead: Vec<Uuid> = tables
            .tokens
            .values()
            .filter(|r| !r.is_live(now))
            .map(|r| r.id)
            .collect();
        for id in &dead {
            tables.remove(*id);
        }
        Ok(dead.len() as u64)
    }

    async fn revoke_session(&self, token_id: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        if tables.revoked.contains_key(token_id) {
            return Ok(false);
        }
        tables.revoked.insert(token_id.to_string(), expires_at);
        Ok(true)
    }

    async fn is_session_revoked(&self, token_id: &str) -> Result<bool> {
        Ok(self.tables.lock().await.revoked.contains_key(token_id))
    }

    async fn purge_revocations(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let before = tables.revoked.len();
        tables.revoked.retain(|_, expires_at| *expires_at > now);
        Ok((before - tables.revoked.len()) as u64)
    }

    async fn session_epoch(&self, account_id: Uuid) -> Result<i64> {
        let tables = self.tables.lock().await;
        Ok(tables.epochs.get(&account_id).copied().unwrap_or(0))
    }

    async fn bump_session_epoch(&self, account_id: Uuid) -> Result<i64> {
        let mut tables = self.tables.lock().await;
        let epoch = tables.epochs.entry(account_id).or_insert(0);
        *epoch += 1;
        Ok(*epoch)
    }
}

struct Counter {
    count: u32,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, Counter>>,
}

impl MemoryCounterStore {
    pub async fn count(&self, key: &str) -> Option<u32> {
        self.counters.lock().await.get(key).map(|c| c.count)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_with_ceiling(
        &self,
        key: &str,
        ceiling: u32,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<u32>> {
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            expires_at,
        });
        if counter.expires_at <= now {
            counter.count = 0;
            counter.expires_at = expires_at;
        }
        if counter.count >= ceiling {
            return Ok(None);
        }
        counter.count += 1;
        Ok(Some(counter.count))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut counters = self.counters.lock().await;
        let before = counters.len();
        counters.retain(|_, counter| counter.expires_at > now);
        Ok((before - counters.len()) as u64)
    }
}
