//! Token ledger: single-use secrets and signed session tokens.
//!
//! Flow Overview:
//! - `issue` mints an opaque 256-bit secret for email verification or password
//!   reset, stores only its SHA-256, and supersedes the previous live token of
//!   the same kind for the account.
//! - `consume` looks the secret up and flips `consumed_at` with a
//!   compare-and-set, so at most one caller ever wins.
//! - `issue_session` signs an access/refresh pair; `verify_session` checks the
//!   signature, kind, expiry, revocation list and the account's session epoch.
//! - `revoke` puts one token id on the revocation list; `revoke_all` bumps the
//!   epoch, which ends every session issued before it.

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::account::Role;
use super::clock::{Clock, RandomSource, new_secret, new_token_id, new_uuid};
use super::error::AuthError;
use super::storage::{TokenRecord, TokenRepository, bounded};
use super::sweep::{SweepReport, purge_expired};
use super::utils::hash_secret;

pub mod session;

pub use session::SessionClaims;
use session::{SessionSigner, TOKEN_VERSION};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    EmailVerification,
    PasswordReset,
    Access,
    Refresh,
}

impl TokenKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmailVerification => "email_verification",
            Self::PasswordReset => "password_reset",
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }

    /// Kinds stored in the ledger and spent exactly once.
    #[must_use]
    pub fn is_single_use(self) -> bool {
        matches!(self, Self::EmailVerification | Self::PasswordReset)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "email_verification" => Ok(Self::EmailVerification),
            "password_reset" => Ok(Self::PasswordReset),
            "access" => Ok(Self::Access),
            "refresh" => Ok(Self::Refresh),
            other => Err(anyhow::anyhow!("unknown token kind: {other}")),
        }
    }
}

/// A freshly issued single-use token. `secret` is the only copy of the raw
/// value and must go straight to the email collaborator.
#[derive(Clone)]
pub struct IssuedToken {
    pub id: Uuid,
    pub secret: String,
    pub account_id: Uuid,
    pub kind: TokenKind,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .field("account_id", &self.account_id)
            .field("kind", &self.kind)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Access/refresh pair handed to the caller after login or refresh.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token_type", &self.token_type)
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .finish_non_exhaustive()
    }
}

pub struct TokenLedger {
    repository: Arc<dyn TokenRepository>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    signer: SessionSigner,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    timeout: std::time::Duration,
}

pub struct TokenLedgerSettings<'a> {
    pub signing_key: &'a [u8],
    pub issuer: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub timeout: std::time::Duration,
}

impl TokenLedger {
    /// # Errors
    /// Returns an error if the signing key is rejected by HMAC.
    pub fn new(
        repository: Arc<dyn TokenRepository>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
        settings: TokenLedgerSettings<'_>,
    ) -> anyhow::Result<Self> {
        let signer =
            SessionSigner::new(settings.signing_key).context("invalid session signing key")?;
        Ok(Self {
            repository,
            clock,
            random,
            signer,
            issuer: settings.issuer,
            access_ttl: settings.access_ttl,
            refresh_ttl: settings.refresh_ttl,
            timeout: settings.timeout,
        })
    }

    /// Mint a single-use token, superseding the previous live one of the same
    /// kind for the account.
    ///
    /// Not idempotent: every call invalidates the token handed out before.
    ///
    /// # Errors
    /// - `TokenKindMismatch` for session kinds, which are never stored.
    /// - `Unavailable` on entropy or storage failure.
    pub async fn issue(
        &self,
        account_id: Uuid,
        kind: TokenKind,
        ttl: Duration,
    ) -> Result<IssuedToken, AuthError> {
        if !kind.is_single_use() {
            return Err(AuthError::TokenKindMismatch);
        }
        let (id, secret) = self.fresh_secret()?;
        let issued_at = self.clock.now();
        let record = TokenRecord {
            id,
            secret_hash: hash_secret(&secret),
            account_id,
            kind,
            issued_at,
            expires_at: issued_at + ttl,
            consumed_at: None,
        };

        let superseded = bounded(
            self.timeout,
            "token issue",
            self.repository.insert_single_use(&record),
        )
        .await?;
        debug!(%account_id, %kind, superseded, "Issued single-use token");

        Ok(IssuedToken {
            id,
            secret,
            account_id,
            kind,
            issued_at,
            expires_at: record.expires_at,
        })
    }

    fn fresh_secret(&self) -> Result<(Uuid, String), AuthError> {
        let id = new_uuid(self.random.as_ref());
        let secret = new_secret(self.random.as_ref());
        match (id, secret) {
            (Ok(id), Ok(secret)) => Ok((id, secret)),
            (Err(err), _) | (_, Err(err)) => {
                error!("Failed to generate token material: {err:#}");
                Err(AuthError::Unavailable("entropy"))
            }
        }
    }

    /// Spend a single-use token and return its subject.
    ///
    /// Checks run in order: existence, kind, expiry, prior use. The final
    /// compare-and-set decides concurrent attempts.
    ///
    /// # Errors
    /// `TokenNotFound`, `TokenKindMismatch`, `TokenExpired`,
    /// `TokenAlreadyUsed`, or `Unavailable`.
    pub async fn consume(&self, secret: &str, expected: TokenKind) -> Result<Uuid, AuthError> {
        let secret_hash = hash_secret(secret);
        let record = bounded(
            self.timeout,
            "token lookup",
            self.repository.find_by_secret_hash(&secret_hash),
        )
        .await?
        .ok_or(AuthError::TokenNotFound)?;

        if record.kind != expected {
            return Err(AuthError::TokenKindMismatch);
        }
        let now = self.clock.now();
        if now >= record.expires_at {
            return Err(AuthError::TokenExpired);
        }
        if record.consumed_at.is_some() {
            return Err(AuthError::TokenAlreadyUsed);
        }

        let won = bounded(
            self.timeout,
            "token consume",
            self.repository.mark_consumed(record.id, now),
        )
        .await?;
        if !won {
            return Err(AuthError::TokenAlreadyUsed);
        }
        debug!(account_id = %record.account_id, kind = %expected, "Consumed single-use token");
        Ok(record.account_id)
    }

    /// Issue time of the newest single-use token of `kind` for the account.
    ///
    /// # Errors
    /// Returns `Unavailable` on storage failure.
    pub async fn latest_issued_at(
        &self,
        account_id: Uuid,
        kind: TokenKind,
    ) -> Result<Option<DateTime<Utc>>, AuthError> {
        bounded(
            self.timeout,
            "token lookup",
            self.repository.latest_issued_at(account_id, kind),
        )
        .await
    }

    /// Sign a fresh access/refresh pair at the account's current epoch.
    ///
    /// # Errors
    /// Returns `Unavailable` on storage, entropy or signing failure.
    pub async fn issue_session(&self, account_id: Uuid, role: Role) -> Result<Session, AuthError> {
        let epoch = bounded(
            self.timeout,
            "session epoch",
            self.repository.session_epoch(account_id),
        )
        .await?;

        let now = self.clock.now();
        let access_expires_at = now + self.access_ttl;
        let refresh_expires_at = now + self.refresh_ttl;
        let access_token =
            self.sign_session(account_id, role, TokenKind::Access, now, access_expires_at, epoch)?;
        let refresh_token = self.sign_session(
            account_id,
            role,
            TokenKind::Refresh,
            now,
            refresh_expires_at,
            epoch,
        )?;

        Ok(Session {
            access_token,
            refresh_token,
            token_type: "Bearer",
            access_expires_at,
            refresh_expires_at,
        })
    }

    fn sign_session(
        &self,
        account_id: Uuid,
        role: Role,
        kind: TokenKind,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        epoch: i64,
    ) -> Result<String, AuthError> {
        let jti = new_token_id(self.clock.as_ref(), self.random.as_ref()).map_err(|err| {
            error!("Failed to generate session token id: {err:#}");
            AuthError::Unavailable("entropy")
        })?;
        let claims = SessionClaims {
            v: TOKEN_VERSION,
            iss: self.issuer.clone(),
            sub: account_id,
            role,
            kind,
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            jti,
            sev: epoch,
        };
        self.signer.sign(&claims).map_err(|err| {
            error!("Failed to sign session token: {err}");
            AuthError::Unavailable("session signing")
        })
    }

    /// Verify a session token of the expected kind.
    ///
    /// Fails closed: any defect is `Unauthorized`.
    ///
    /// # Errors
    /// `Unauthorized`, or `Unavailable` when the revocation state cannot be read.
    pub async fn verify_session(
        &self,
        token: &str,
        expected: TokenKind,
    ) -> Result<SessionClaims, AuthError> {
        let now = self.clock.now().timestamp();
        let claims = self
            .signer
            .verify(token, &self.issuer, expected, now)
            .map_err(|err| {
                debug!("Rejected session token: {err}");
                AuthError::Unauthorized
            })?;

        let revoked = bounded(
            self.timeout,
            "revocation lookup",
            self.repository.is_session_revoked(&claims.jti),
        )
        .await?;
        if revoked {
            debug!("Rejected revoked session token");
            return Err(AuthError::Unauthorized);
        }

        let epoch = bounded(
            self.timeout,
            "session epoch",
            self.repository.session_epoch(claims.sub),
        )
        .await?;
        if claims.sev != epoch {
            debug!("Rejected session token from a previous epoch");
            return Err(AuthError::Unauthorized);
        }
        Ok(claims)
    }

    /// Verify a refresh token and revoke it in the same step.
    ///
    /// Of two concurrent rotations of one refresh token only one succeeds.
    ///
    /// # Errors
    /// `Unauthorized` for invalid, revoked or replayed tokens; `Unavailable`
    /// on storage failure.
    pub async fn rotate_refresh(&self, refresh_token: &str) -> Result<SessionClaims, AuthError> {
        let claims = self
            .verify_session(refresh_token, TokenKind::Refresh)
            .await?;
        let expires_at = DateTime::from_timestamp(claims.exp, 0).unwrap_or_else(|| self.clock.now());
        let first = bounded(
            self.timeout,
            "session revoke",
            self.repository.revoke_session(&claims.jti, expires_at),
        )
        .await?;
        if !first {
            warn!(account_id = %claims.sub, "Refresh token replayed");
            return Err(AuthError::Unauthorized);
        }
        Ok(claims)
    }

    /// Put a session token on the revocation list until it would expire.
    ///
    /// Expired tokens need no entry and return `Ok(false)`.
    ///
    /// # Errors
    /// `Unauthorized` when the token is not one of ours; `Unavailable` on
    /// storage failure.
    pub async fn revoke(&self, token: &str) -> Result<bool, AuthError> {
        let claims = self.signer.decode(token, &self.issuer).map_err(|err| {
            debug!("Refused to revoke session token: {err}");
            AuthError::Unauthorized
        })?;
        if claims.kind.is_single_use() {
            return Err(AuthError::Unauthorized);
        }
        let now = self.clock.now();
        let Some(expires_at) = DateTime::from_timestamp(claims.exp, 0) else {
            return Ok(false);
        };
        if now >= expires_at {
            return Ok(false);
        }
        bounded(
            self.timeout,
            "session revoke",
            self.repository.revoke_session(&claims.jti, expires_at),
        )
        .await
    }

    /// End every session issued so far for the account.
    ///
    /// # Errors
    /// Returns `Unavailable` on storage failure.
    pub async fn revoke_all(&self, account_id: Uuid) -> Result<(), AuthError> {
        let epoch = bounded(
            self.timeout,
            "session revoke",
            self.repository.bump_session_epoch(account_id),
        )
        .await?;
        info!(%account_id, epoch, "Revoked all sessions");
        Ok(())
    }

    /// Forget every token belonging to a deleted account.
    ///
    /// # Errors
    /// Returns `Unavailable` on storage failure.
    pub async fn forget_account(&self, account_id: Uuid) -> Result<(), AuthError> {
        bounded(
            self.timeout,
            "token delete",
            self.repository.delete_for_account(account_id),
        )
        .await?;
        Ok(())
    }

    /// Delete consumed or expired single-use tokens and stale revocations.
    ///
    /// # Errors
    /// Returns `Unavailable` on storage failure.
    pub async fn sweep(&self) -> Result<SweepReport, AuthError> {
        bounded(
            self.timeout,
            "token sweep",
            purge_expired(self.repository.as_ref(), None, self.clock.now()),
        )
        .await
    }
}
