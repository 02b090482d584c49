//! `PostgreSQL` storage via `sqlx`. Table layout lives in `sql/schema.sql`.
//!
//! Atomicity comes from the database:
//! - unique constraints decide signup races;
//! - single-use issuance locks the owning account row so concurrent issues
//!   for the same account serialize;
//! - consumption is a conditional `UPDATE ... WHERE consumed_at IS NULL`;
//! - account updates only match the row if status, role and flags are still
//!   what the caller read;
//! - counters use `INSERT ... ON CONFLICT DO UPDATE ... WHERE count < ceiling`.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Error as SqlxError, Row};
use tracing::{Instrument, Span, info_span};
use uuid::Uuid;

use super::{AccountRepository, CounterStore, InsertOutcome, TokenRecord, TokenRepository};
use crate::auth::account::Account;
use crate::auth::error::AccountField;
use crate::auth::tokens::TokenKind;

const UNIQUE_VIOLATION: &str = "23505";

fn query_span(operation: &'static str, statement: &'static str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

const ACCOUNT_COLUMNS: &str = "id, email, username, phone, password_hash, role, status, archived, \
     email_verified, phone_verified, failed_login_count, login_count, last_login_at, \
     last_failed_login_at, password_changed_at, created_at, updated_at";

fn account_from_row(row: &PgRow) -> Result<Account> {
    let role: String = row.try_get("role")?;
    let status: String = row.try_get("status")?;
    Ok(Account {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        username: row.try_get("username")?,
        phone: row.try_get("phone")?,
        password_hash: row.try_get("password_hash")?,
        role: role.parse()?,
        status: status.parse()?,
        archived: row.try_get("archived")?,
        email_verified: row.try_get("email_verified")?,
        phone_verified: row.try_get("phone_verified")?,
        failed_login_count: row.try_get("failed_login_count")?,
        login_count: row.try_get("login_count")?,
        last_login_at: row.try_get("last_login_at")?,
        last_failed_login_at: row.try_get("last_failed_login_at")?,
        password_changed_at: row.try_get("password_changed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn token_from_row(row: &PgRow) -> Result<TokenRecord> {
    let kind: String = row.try_get("kind")?;
    Ok(TokenRecord {
        id: row.try_get("id")?,
        secret_hash: row.try_get("secret_hash")?,
        account_id: row.try_get("account_id")?,
        kind: kind.parse()?,
        issued_at: row.try_get("issued_at")?,
        expires_at: row.try_get("expires_at")?,
        consumed_at: row.try_get("consumed_at")?,
    })
}

/// Map a unique violation to the field its constraint guards.
fn conflicting_field(err: &SqlxError) -> Option<AccountField> {
    let SqlxError::Database(db_err) = err else {
        return None;
    };
    if db_err.code().as_deref() != Some(UNIQUE_VIOLATION) {
        return None;
    }
    match db_err.constraint() {
        Some("accounts_email_key") => Some(AccountField::Email),
        Some("accounts_username_key") => Some(AccountField::Username),
        Some("accounts_phone_key") => Some(AccountField::Phone),
        _ => None,
    }
}

#[derive(Clone)]
pub struct PgAccountRepository {
    pool: PgPool,
}

impl PgAccountRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_one(&self, column: &'static str, value: &str) -> Result<Option<Account>> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE {column} = $1");
        let row = sqlx::query(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", "SELECT FROM accounts BY unique key"))
            .await
            .with_context(|| format!("Failed to look up account by {column}"))?;
        row.as_ref().map(account_from_row).transpose()
    }
}

#[async_trait]
impl AccountRepository for PgAccountRepository {
    async fn insert(&self, account: &Account) -> Result<InsertOutcome> {
        let query = r"
            INSERT INTO accounts
            (id, email, username, phone, password_hash, role, status, archived,
             email_verified, phone_verified, failed_login_count, login_count,
             created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, 0, $11, $12)
        ";
        let result = sqlx::query(query)
            .bind(account.id)
            .bind(&account.email)
            .bind(account.username.as_deref())
            .bind(account.phone.as_deref())
            .bind(&account.password_hash)
            .bind(account.role.as_str())
            .bind(account.status.as_str())
            .bind(account.archived)
            .bind(account.email_verified)
            .bind(account.phone_verified)
            .bind(account.created_at)
            .bind(account.updated_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Created),
            Err(err) => match conflicting_field(&err) {
                Some(field) => Ok(InsertOutcome::Conflict(field)),
                None => Err(anyhow!(err).context("Failed to insert account")),
            },
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", "SELECT FROM accounts BY id"))
            .await
            .context("Failed to look up account by id")?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>> {
        self.find_one("email", email).await
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Account>> {
        self.find_one("username", username).await
    }

    async fn find_conflict(
        &self,
        email: &str,
        username: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Option<AccountField>> {
        let query = r"
            SELECT
                EXISTS (SELECT 1 FROM accounts WHERE email = $1) AS email_taken,
                EXISTS (SELECT 1 FROM accounts WHERE username = $2) AS username_taken,
                EXISTS (SELECT 1 FROM accounts WHERE phone = $3) AS phone_taken
        ";
        let row = sqlx::query(query)
            .bind(email)
            .bind(username)
            .bind(phone)
            .fetch_one(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("Failed to check account uniqueness")?;

        if row.try_get::<bool, _>("email_taken")? {
            return Ok(Some(AccountField::Email));
        }
        if row.try_get::<bool, _>("username_taken")? {
            return Ok(Some(AccountField::Username));
        }
        if row.try_get::<bool, _>("phone_taken")? {
            return Ok(Some(AccountField::Phone));
        }
        Ok(None)
    }

    async fn update(&self, read: &Account, account: &Account) -> Result<bool> {
        let query = r"
            UPDATE accounts
            SET role = $2, status = $3, archived = $4, email_verified = $5,
                phone_verified = $6, updated_at = $7
            WHERE id = $1
              AND role = $8 AND status = $9 AND archived = $10
              AND email_verified = $11 AND phone_verified = $12
        ";
        let result = sqlx::query(query)
            .bind(account.id)
            .bind(account.role.as_str())
            .bind(account.status.as_str())
            .bind(account.archived)
            .bind(account.email_verified)
            .bind(account.phone_verified)
            .bind(account.updated_at)
            .bind(read.role.as_str())
            .bind(read.status.as_str())
            .bind(read.archived)
            .bind(read.email_verified)
            .bind(read.phone_verified)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("Failed to update account")?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_login_success(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let query = r"
            UPDATE accounts
            SET failed_login_count = 0, login_count = login_count + 1, last_login_at = $2
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("Failed to record login")?;
        Ok(())
    }

    async fn record_login_failure(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let query = r"
            UPDATE accounts
            SET failed_login_count = failed_login_count + 1, last_failed_login_at = $2
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("Failed to record login failure")?;
        Ok(())
    }

    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let query = r"
            UPDATE accounts
            SET password_hash = $2, password_changed_at = $3, failed_login_count = 0,
                updated_at = $3
            WHERE id = $1
        ";
        let result = sqlx::query(query)
            .bind(id)
            .bind(password_hash)
            .bind(at)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("Failed to update password")?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let query = "DELETE FROM accounts WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("Failed to delete account")?;
        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, include_archived: bool) -> Result<Vec<Account>> {
        let query = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE ($1 OR NOT archived) \
             ORDER BY created_at, id"
        );
        let rows = sqlx::query(&query)
            .bind(include_archived)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", "SELECT FROM accounts ORDER BY created_at"))
            .await
            .context("Failed to list accounts")?;
        rows.iter().map(account_from_row).collect()
    }
}

#[derive(Clone)]
pub struct PgTokenRepository {
    pool: PgPool,
}

impl PgTokenRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenRepository for PgTokenRepository {
    async fn insert_single_use(&self, record: &TokenRecord) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent issues for the same account.
        sqlx::query("SELECT id FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(record.account_id)
            .fetch_optional(&mut *tx)
            .instrument(query_span("SELECT", "SELECT FROM accounts FOR UPDATE"))
            .await
            .context("Failed to lock account for token issuance")?;

        let delete = r"
            DELETE FROM single_use_tokens
            WHERE account_id = $1 AND kind = $2 AND consumed_at IS NULL
        ";
        let superseded = sqlx::query(delete)
            .bind(record.account_id)
            .bind(record.kind.as_str())
            .execute(&mut *tx)
            .instrument(query_span("DELETE", delete))
            .await
            .context("Failed to invalidate previous tokens")?
            .rows_affected();

        let insert = r"
            INSERT INTO single_use_tokens
            (id, secret_hash, account_id, kind, issued_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
        ";
        sqlx::query(insert)
            .bind(record.id)
            .bind(&record.secret_hash)
            .bind(record.account_id)
            .bind(record.kind.as_str())
            .bind(record.issued_at)
            .bind(record.expires_at)
            .execute(&mut *tx)
            .instrument(query_span("INSERT", insert))
            .await
            .context("Failed to insert token")?;

        tx.commit().await?;
        Ok(superseded)
    }

    async fn find_by_secret_hash(&self, secret_hash: &[u8]) -> Result<Option<TokenRecord>> {
        let query = r"
            SELECT id, secret_hash, account_id, kind, issued_at, expires_at, consumed_at
            FROM single_use_tokens
            WHERE secret_hash = $1
        ";
        let row = sqlx::query(query)
            .bind(secret_hash)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("Failed to look up token")?;
        row.as_ref().map(token_from_row).transpose()
    }

    async fn mark_consumed(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let query =
            "UPDATE single_use_tokens SET consumed_at = $2 WHERE id = $1 AND consumed_at IS NULL";
        let result = sqlx::query(query)
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("Failed to consume token")?;
        Ok(result.rows_affected() == 1)
    }

    async fn latest_issued_at(
        &self,
        account_id: Uuid,
        kind: TokenKind,
    ) -> Result<Option<DateTime<Utc>>> {
        let query = r"
            SELECT MAX(issued_at) AS latest
            FROM single_use_tokens
            WHERE account_id = $1 AND kind = $2
        ";
        let row = sqlx::query(query)
            .bind(account_id)
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("Failed to read latest token issue time")?;
        Ok(row.try_get("latest")?)
    }

    async fn delete_for_account(&self, account_id: Uuid) -> Result<u64> {
        let query = "DELETE FROM single_use_tokens WHERE account_id = $1";
        let result = sqlx::query(query)
            .bind(account_id)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("Failed to delete account tokens")?;
        Ok(result.rows_affected())
    }

    async fn purge_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let query =
            "DELETE FROM single_use_tokens WHERE consumed_at IS NOT NULL OR expires_at <= $1";
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("Failed to purge tokens")?;
        Ok(result.rows_affected())
    }

    async fn revoke_session(&self, token_id: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let query = r"
            INSERT INTO session_revocations (token_id, expires_at)
            VALUES ($1, $2)
            ON CONFLICT (token_id) DO NOTHING
        ";
        let result = sqlx::query(query)
            .bind(token_id)
            .bind(expires_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("Failed to revoke session")?;
        Ok(result.rows_affected() == 1)
    }

    async fn is_session_revoked(&self, token_id: &str) -> Result<bool> {
        let query = "SELECT EXISTS (SELECT 1 FROM session_revocations WHERE token_id = $1)";
        let revoked: bool = sqlx::query_scalar(query)
            .bind(token_id)
            .fetch_one(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("Failed to check session revocation")?;
        Ok(revoked)
    }

    async fn purge_revocations(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM session_revocations WHERE expires_at <= $1";
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("Failed to purge session revocations")?;
        Ok(result.rows_affected())
    }

    async fn session_epoch(&self, account_id: Uuid) -> Result<i64> {
        let query = "SELECT epoch FROM session_epochs WHERE account_id = $1";
        let epoch: Option<i64> = sqlx::query_scalar(query)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("Failed to read session epoch")?;
        Ok(epoch.unwrap_or(0))
    }

    async fn bump_session_epoch(&self, account_id: Uuid) -> Result<i64> {
        let query = r"
            INSERT INTO session_epochs (account_id, epoch)
            VALUES ($1, 1)
            ON CONFLICT (account_id) DO UPDATE SET epoch = session_epochs.epoch + 1
            RETURNING epoch
        ";
        let epoch: i64 = sqlx::query_scalar(query)
            .bind(account_id)
            .fetch_one(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("Failed to bump session epoch")?;
        Ok(epoch)
    }
}

#[derive(Clone)]
pub struct PgCounterStore {
    pool: PgPool,
}

impl PgCounterStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn increment_with_ceiling(
        &self,
        key: &str,
        ceiling: u32,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<u32>> {
        if ceiling == 0 {
            return Ok(None);
        }
        let query = r"
            INSERT INTO rate_limit_counters (key, count, expires_at)
            VALUES ($1, 1, $4)
            ON CONFLICT (key) DO UPDATE
            SET count = CASE WHEN rate_limit_counters.expires_at <= $3 THEN 1
                             ELSE rate_limit_counters.count + 1 END,
                expires_at = CASE WHEN rate_limit_counters.expires_at <= $3 THEN $4
                                  ELSE rate_limit_counters.expires_at END
            WHERE rate_limit_counters.count < $2 OR rate_limit_counters.expires_at <= $3
            RETURNING count
        ";
        let count: Option<i32> = sqlx::query_scalar(query)
            .bind(key)
            .bind(i64::from(ceiling))
            .bind(now)
            .bind(expires_at)
            .fetch_optional(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("Failed to increment rate limit counter")?;
        count
            .map(|count| u32::try_from(count).context("negative rate limit counter"))
            .transpose()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM rate_limit_counters WHERE expires_at <= $1";
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("Failed to purge rate limit counters")?;
        Ok(result.rows_affected())
    }
}
