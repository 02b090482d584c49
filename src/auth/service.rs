//! `AuthCore`: request orchestration over the ledger, limiter, credential
//! store and account state machine.
//!
//! The core keeps no per-request state. Every entry point receives its caller
//! context explicitly: a `RequestContext` for anonymous flows, or the caller's
//! access token for authenticated ones.
//!
//! Argon2 work runs on the blocking pool so slow hashes never stall the
//! async workers.

use anyhow::{Context, bail};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::account::{Account, AccountStatus, AccountSummary, Role};
use super::clock::{Clock, RandomSource, new_uuid};
use super::config::{AuthConfig, MIN_SIGNING_KEY_BYTES};
use super::credential::CredentialStore;
use super::email::{EmailDispatcher, EmailMessage, EmailTemplate, Notifier};
use super::error::{AccountField, AuthError};
use super::rate_limit::{RateLimitAction, RateLimitDecision, RateLimiter};
use super::state::{self, Capability, TransitionOrigin};
use super::storage::{AccountRepository, InsertOutcome, TokenRepository, bounded};
use super::sweep::SweepReport;
use super::tokens::{Session, SessionClaims, TokenKind, TokenLedger, TokenLedgerSettings};
use super::types::{LoginOutcome, LoginRequest, RequestContext, SignupOutcome, SignupRequest};
use super::utils::{
    build_action_url, normalize_email, normalize_phone, normalize_username, resolve_client_ip,
    valid_email, valid_phone, valid_username,
};

/// Read-modify-write rounds before an account write under contention gives up.
const ACCOUNT_WRITE_ATTEMPTS: usize = 3;

/// External dependencies injected into the core.
#[derive(Clone)]
pub struct Collaborators {
    pub accounts: Arc<dyn AccountRepository>,
    pub tokens: Arc<dyn TokenRepository>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub email: Arc<dyn EmailDispatcher>,
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSource>,
}

pub struct AuthCore {
    config: AuthConfig,
    accounts: Arc<dyn AccountRepository>,
    ledger: TokenLedger,
    credentials: Arc<CredentialStore>,
    rate_limiter: Arc<dyn RateLimiter>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
}

impl AuthCore {
    /// # Errors
    /// Returns an error if the signing key is shorter than
    /// [`MIN_SIGNING_KEY_BYTES`], the frontend base URL does not parse, or the
    /// password hashing parameters are rejected.
    pub fn new(config: AuthConfig, collaborators: Collaborators) -> anyhow::Result<Self> {
        if config.signing_key().len() < MIN_SIGNING_KEY_BYTES {
            bail!("session signing key must be at least {MIN_SIGNING_KEY_BYTES} bytes");
        }
        Url::parse(config.frontend_base_url()).context("invalid frontend base URL")?;

        let credentials = CredentialStore::new(
            config.password_hash_cost(),
            config.password_policy(),
            collaborators.random.clone(),
        )?;
        let ledger = TokenLedger::new(
            collaborators.tokens,
            collaborators.clock.clone(),
            collaborators.random.clone(),
            TokenLedgerSettings {
                signing_key: config.signing_key(),
                issuer: config.issuer().to_string(),
                access_ttl: config.access_ttl(),
                refresh_ttl: config.refresh_ttl(),
                timeout: config.storage_timeout(),
            },
        )?;
        let notifier = Notifier::new(collaborators.email, config.email_timeout());

        Ok(Self {
            config,
            accounts: collaborators.accounts,
            ledger,
            credentials: Arc::new(credentials),
            rate_limiter: collaborators.rate_limiter,
            notifier,
            clock: collaborators.clock,
            random: collaborators.random,
        })
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn ledger(&self) -> &TokenLedger {
        &self.ledger
    }

    /// Build a request context from the transport peer and its
    /// `X-Forwarded-For` header, honoring the configured trusted proxies.
    #[must_use]
    pub fn request_context(&self, peer: IpAddr, forwarded_for: Option<&str>) -> RequestContext {
        RequestContext::from_ip(resolve_client_ip(
            peer,
            forwarded_for,
            self.config.trusted_proxies(),
        ))
    }

    /// Register a `PENDING` account and mail its verification link.
    ///
    /// Only end-user roles may sign themselves up. No session is issued; the
    /// address must be verified first.
    ///
    /// # Errors
    /// `Forbidden`, `RateLimited`, `InvalidField`, `PasswordPolicyViolation`,
    /// `DuplicateField`, or `Unavailable`.
    #[instrument(skip_all, fields(role = %request.role))]
    pub async fn signup(
        &self,
        request: SignupRequest,
        context: RequestContext,
    ) -> Result<SignupOutcome, AuthError> {
        if !request.role.is_self_service() {
            return Err(AuthError::Forbidden);
        }

        let email = normalize_email(&request.email);
        let limit_key = context
            .client_ip
            .map_or_else(|| email.clone(), |ip| ip.to_string());
        self.enforce_limit(RateLimitAction::Signup, &limit_key)
            .await?;

        if !valid_email(&email) {
            return Err(AuthError::InvalidField(AccountField::Email));
        }
        let username = optional_field(request.username.as_deref(), normalize_username);
        if username.as_deref().is_some_and(|u| !valid_username(u)) {
            return Err(AuthError::InvalidField(AccountField::Username));
        }
        let phone = optional_field(request.phone.as_deref(), normalize_phone);
        if phone.as_deref().is_some_and(|p| !valid_phone(p)) {
            return Err(AuthError::InvalidField(AccountField::Phone));
        }
        self.credentials
            .check_policy(request.password.expose_secret())?;

        let conflict = bounded(
            self.config.storage_timeout(),
            "account lookup",
            self.accounts
                .find_conflict(&email, username.as_deref(), phone.as_deref()),
        )
        .await?;
        if let Some(field) = conflict {
            return Err(AuthError::DuplicateField(field));
        }

        let password_hash = self.hash_password(request.password).await?;
        let account_id = new_uuid(self.random.as_ref()).map_err(|err| {
            error!("Failed to generate account id: {err:#}");
            AuthError::Unavailable("entropy")
        })?;
        let account = Account::pending(
            account_id,
            email,
            username,
            phone,
            password_hash,
            request.role,
            self.clock.now(),
        );

        let outcome = bounded(
            self.config.storage_timeout(),
            "account insert",
            self.accounts.insert(&account),
        )
        .await?;
        if let InsertOutcome::Conflict(field) = outcome {
            return Err(AuthError::DuplicateField(field));
        }
        info!(%account_id, "Account created");

        // The account stands even if the token cannot be issued; the user can
        // ask for a new link through resend.
        if let Err(err) = self.send_verification(&account).await {
            warn!(%account_id, "Verification token not issued at signup: {err}");
        }

        Ok(SignupOutcome {
            account_id,
            verification_required: true,
        })
    }

    /// Authenticate with email-or-username and password.
    ///
    /// Unknown identifiers and wrong passwords both yield
    /// `InvalidCredentials`; a correct password on an account that may not log
    /// in yields `AccountNotEligible` and leaves the failure counter alone.
    ///
    /// # Errors
    /// `RateLimited`, `InvalidCredentials`, `AccountNotEligible`, or
    /// `Unavailable`.
    #[instrument(skip_all)]
    pub async fn login(
        &self,
        request: LoginRequest,
        _context: RequestContext,
    ) -> Result<LoginOutcome, AuthError> {
        let identifier = request.identifier.trim().to_lowercase();
        if identifier.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }
        self.enforce_limit(RateLimitAction::Login, &identifier)
            .await?;

        let lookup = if identifier.contains('@') {
            self.accounts.find_by_email(&identifier)
        } else {
            self.accounts.find_by_username(&identifier)
        };
        let found = bounded(self.config.storage_timeout(), "account lookup", lookup).await?;

        let Some(mut account) = found else {
            self.burn_decoy(request.password).await?;
            return Err(AuthError::InvalidCredentials);
        };

        if !self
            .verify_password(request.password, account.password_hash.clone())
            .await?
        {
            bounded(
                self.config.storage_timeout(),
                "login failure",
                self.accounts
                    .record_login_failure(account.id, self.clock.now()),
            )
            .await?;
            info!(account_id = %account.id, "Login failed");
            return Err(AuthError::InvalidCredentials);
        }

        state::ensure_login_eligible(&account)?;

        let now = self.clock.now();
        bounded(
            self.config.storage_timeout(),
            "login success",
            self.accounts.record_login_success(account.id, now),
        )
        .await?;
        let session = self.ledger.issue_session(account.id, account.role).await?;

        account.failed_login_count = 0;
        account.login_count += 1;
        account.last_login_at = Some(now);
        info!(account_id = %account.id, "Login succeeded");

        Ok(LoginOutcome {
            account: AccountSummary::from(&account),
            session,
        })
    }

    /// Consume an email verification token and activate the account.
    ///
    /// # Errors
    /// `RateLimited`, `TokenNotFound`, `TokenKindMismatch`, `TokenExpired`,
    /// `TokenAlreadyUsed`, or `Unavailable`.
    #[instrument(skip_all)]
    pub async fn verify_email(
        &self,
        token: &str,
        context: RequestContext,
    ) -> Result<AccountSummary, AuthError> {
        if let Some(ip) = context.client_ip {
            self.enforce_limit(RateLimitAction::VerifyEmail, &ip.to_string())
                .await?;
        }

        let account_id = self
            .ledger
            .consume(token.trim(), TokenKind::EmailVerification)
            .await?;
        let now = self.clock.now();
        let (_, account) = self
            .modify_account(account_id, |account| {
                state::apply_email_verified(account, now);
                Ok(())
            })
            .await
            .map_err(|err| match err {
                AuthError::AccountNotFound => AuthError::TokenNotFound,
                other => other,
            })?;
        info!(%account_id, status = %account.status, "Email verified");
        Ok(AccountSummary::from(&account))
    }

    /// Send a fresh verification link to a `PENDING` account.
    ///
    /// Always `Ok(())` for unknown addresses, verified accounts, callers
    /// inside the cooldown and rate-limited callers.
    ///
    /// # Errors
    /// Only `Unavailable`.
    #[instrument(skip_all)]
    pub async fn resend_verification(
        &self,
        email: &str,
        _context: RequestContext,
    ) -> Result<(), AuthError> {
        let email = normalize_email(email);
        if !valid_email(&email)
            || !self
                .allow_quietly(RateLimitAction::ResendVerification, &email)
                .await?
        {
            return Ok(());
        }

        let Some(account) = self.find_by_email(&email).await? else {
            return Ok(());
        };
        if account.status != AccountStatus::Pending || account.email_verified {
            return Ok(());
        }

        let last = self
            .ledger
            .latest_issued_at(account.id, TokenKind::EmailVerification)
            .await?;
        if last.is_some_and(|issued| self.clock.now() - issued < self.config.resend_cooldown()) {
            return Ok(());
        }

        self.send_verification(&account).await
    }

    /// Mail a password reset link to an `ACTIVE` account.
    ///
    /// The result is the same whether or not the address belongs to anyone.
    ///
    /// # Errors
    /// Only `Unavailable`.
    #[instrument(skip_all)]
    pub async fn request_password_reset(
        &self,
        email: &str,
        _context: RequestContext,
    ) -> Result<(), AuthError> {
        let email = normalize_email(email);
        if !valid_email(&email)
            || !self
                .allow_quietly(RateLimitAction::PasswordResetRequest, &email)
                .await?
        {
            return Ok(());
        }

        let Some(account) = self.find_by_email(&email).await? else {
            return Ok(());
        };
        if !state::is_login_eligible(&account) {
            return Ok(());
        }

        let issued = self
            .ledger
            .issue(account.id, TokenKind::PasswordReset, self.config.reset_ttl())
            .await?;
        let reset_url = build_action_url(
            self.config.frontend_base_url(),
            "reset-password",
            &issued.secret,
        );
        self.notify(
            &account.email,
            EmailTemplate::PasswordReset,
            json!({
                "reset_url": reset_url,
                "expires_at": issued.expires_at.to_rfc3339(),
            }),
        );
        info!(account_id = %account.id, "Password reset requested");
        Ok(())
    }

    /// Consume a reset token, store the new password and end every session.
    ///
    /// The policy is checked before the token is spent, so a weak password
    /// does not burn the link.
    ///
    /// # Errors
    /// `RateLimited`, `PasswordPolicyViolation`, the token errors, or
    /// `Unavailable`.
    #[instrument(skip_all)]
    pub async fn reset_password(
        &self,
        token: &str,
        new_password: SecretString,
        context: RequestContext,
    ) -> Result<(), AuthError> {
        if let Some(ip) = context.client_ip {
            self.enforce_limit(RateLimitAction::PasswordReset, &ip.to_string())
                .await?;
        }
        self.credentials
            .check_policy(new_password.expose_secret())?;

        let account_id = self
            .ledger
            .consume(token.trim(), TokenKind::PasswordReset)
            .await?;
        let account = self
            .load_account(account_id)
            .await?
            .ok_or(AuthError::TokenNotFound)?;

        let password_hash = self.hash_password(new_password).await?;
        self.store_password(&account, &password_hash).await?;
        info!(%account_id, "Password reset");
        Ok(())
    }

    /// Rotate the caller's password, end every session, and hand back a
    /// fresh one for the caller.
    ///
    /// # Errors
    /// `Unauthorized`, `InvalidCredentials`, `PasswordPolicyViolation`,
    /// `AccountNotEligible`, or `Unavailable`.
    #[instrument(skip_all)]
    pub async fn change_password(
        &self,
        access_token: &str,
        current_password: SecretString,
        new_password: SecretString,
    ) -> Result<Session, AuthError> {
        let claims = self
            .authorize(access_token, Capability::ManageOwnCredentials)
            .await?;
        let account = self
            .load_account(claims.sub)
            .await?
            .ok_or(AuthError::Unauthorized)?;
        state::ensure_login_eligible(&account)?;

        let current_hash = account.password_hash.clone();
        let password_hash = self
            .blocking("password hashing", move |credentials| {
                credentials.rotate(
                    current_password.expose_secret(),
                    new_password.expose_secret(),
                    &current_hash,
                )
            })
            .await??;

        self.store_password(&account, &password_hash).await?;
        info!(account_id = %account.id, "Password changed");
        self.ledger.issue_session(account.id, account.role).await
    }

    /// Exchange a refresh token for a new session pair. The presented refresh
    /// token is revoked; replaying it fails.
    ///
    /// # Errors
    /// `Unauthorized` or `Unavailable`.
    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> Result<Session, AuthError> {
        let claims = self.ledger.rotate_refresh(refresh_token).await?;
        let account = self
            .load_account(claims.sub)
            .await?
            .ok_or(AuthError::Unauthorized)?;
        if !state::is_login_eligible(&account) {
            return Err(AuthError::Unauthorized);
        }
        self.ledger.issue_session(account.id, account.role).await
    }

    /// Revoke the presented session tokens. Invalid or expired tokens are
    /// ignored, so logging out twice is fine.
    ///
    /// # Errors
    /// Only `Unavailable`.
    #[instrument(skip_all)]
    pub async fn logout(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), AuthError> {
        for token in std::iter::once(access_token).chain(refresh_token) {
            match self.ledger.revoke(token).await {
                Ok(_) | Err(AuthError::Unauthorized) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Verify an access token for a protected call.
    ///
    /// # Errors
    /// `Unauthorized` or `Unavailable`.
    pub async fn authenticate(&self, access_token: &str) -> Result<SessionClaims, AuthError> {
        self.ledger
            .verify_session(access_token, TokenKind::Access)
            .await
    }

    /// # Errors
    /// `Unauthorized`, `Forbidden`, `AccountNotFound`, or `Unavailable`.
    pub async fn get_account(
        &self,
        actor_token: &str,
        account_id: Uuid,
    ) -> Result<AccountSummary, AuthError> {
        self.authorize(actor_token, Capability::ViewAccounts)
            .await?;
        let account = self.require_account(account_id).await?;
        Ok(AccountSummary::from(&account))
    }

    /// Accounts in creation order. Archived ones are hidden unless asked for.
    ///
    /// # Errors
    /// `Unauthorized`, `Forbidden`, or `Unavailable`.
    pub async fn list_accounts(
        &self,
        actor_token: &str,
        include_archived: bool,
    ) -> Result<Vec<AccountSummary>, AuthError> {
        self.authorize(actor_token, Capability::ViewAccounts)
            .await?;
        let accounts = bounded(
            self.config.storage_timeout(),
            "account list",
            self.accounts.list(include_archived),
        )
        .await?;
        Ok(accounts.iter().map(AccountSummary::from).collect())
    }

    /// Administrative status change. Entering `SUSPENDED`, `BLOCKED` or
    /// `DEACTIVATED` ends every session of the account.
    ///
    /// # Errors
    /// `Unauthorized`, `Forbidden` (including acting on oneself),
    /// `AccountNotFound`, `AccountNotEligible` for a rejected transition, or
    /// `Unavailable`.
    #[instrument(skip_all, fields(account_id = %account_id, status = %status))]
    pub async fn set_status(
        &self,
        actor_token: &str,
        account_id: Uuid,
        status: AccountStatus,
    ) -> Result<AccountSummary, AuthError> {
        let actor = self
            .authorize(actor_token, Capability::ChangeAccountStatus)
            .await?;
        forbid_self(&actor, account_id)?;
        let now = self.clock.now();
        let (read, account) = self
            .modify_account(account_id, |account| {
                state::apply_transition(account, status, TransitionOrigin::Administrative, now)
            })
            .await?;
        if account.status != read.status {
            if state::revokes_sessions(account.status) {
                self.ledger.revoke_all(account.id).await?;
            }
            info!(actor = %actor.sub, from = %read.status, to = %account.status, "Account status changed");
        }
        Ok(AccountSummary::from(&account))
    }

    /// Lift `SUSPENDED`, `BLOCKED` or `DEACTIVATED`. Accounts that never
    /// verified their email go back to `PENDING`.
    ///
    /// # Errors
    /// `Unauthorized`, `Forbidden`, `AccountNotFound`, `AccountNotEligible`
    /// when the account is not in a reactivatable state, or `Unavailable`.
    #[instrument(skip_all, fields(account_id = %account_id))]
    pub async fn reactivate(
        &self,
        actor_token: &str,
        account_id: Uuid,
    ) -> Result<AccountSummary, AuthError> {
        let actor = self
            .authorize(actor_token, Capability::ChangeAccountStatus)
            .await?;
        forbid_self(&actor, account_id)?;
        let now = self.clock.now();
        let (_, account) = self
            .modify_account(account_id, |account| {
                let target = state::reactivation_target(account);
                state::apply_transition(account, target, TransitionOrigin::Reactivation, now)
            })
            .await?;
        info!(actor = %actor.sub, status = %account.status, "Account reactivated");
        Ok(AccountSummary::from(&account))
    }

    /// Hide an account from default listings. Status is untouched.
    ///
    /// # Errors
    /// `Unauthorized`, `Forbidden`, `AccountNotFound`, or `Unavailable`.
    pub async fn archive(
        &self,
        actor_token: &str,
        account_id: Uuid,
    ) -> Result<AccountSummary, AuthError> {
        self.set_archived(actor_token, account_id, true).await
    }

    /// # Errors
    /// `Unauthorized`, `Forbidden`, `AccountNotFound`, or `Unavailable`.
    pub async fn unarchive(
        &self,
        actor_token: &str,
        account_id: Uuid,
    ) -> Result<AccountSummary, AuthError> {
        self.set_archived(actor_token, account_id, false).await
    }

    async fn set_archived(
        &self,
        actor_token: &str,
        account_id: Uuid,
        archived: bool,
    ) -> Result<AccountSummary, AuthError> {
        self.authorize(actor_token, Capability::ArchiveAccounts)
            .await?;
        let now = self.clock.now();
        let (read, account) = self
            .modify_account(account_id, |account| {
                state::set_archived(account, archived, now);
                Ok(())
            })
            .await?;
        if read.archived != archived {
            info!(%account_id, archived, "Account archival changed");
        }
        Ok(AccountSummary::from(&account))
    }

    /// Change an account's role. Existing sessions carry the old role, so
    /// they are all ended.
    ///
    /// # Errors
    /// `Unauthorized`, `Forbidden`, `AccountNotFound`, or `Unavailable`.
    #[instrument(skip_all, fields(account_id = %account_id, role = %role))]
    pub async fn assign_role(
        &self,
        actor_token: &str,
        account_id: Uuid,
        role: Role,
    ) -> Result<AccountSummary, AuthError> {
        let actor = self
            .authorize(actor_token, Capability::AssignRoles)
            .await?;
        forbid_self(&actor, account_id)?;
        let now = self.clock.now();
        let (read, account) = self
            .modify_account(account_id, |account| {
                if account.role != role {
                    account.role = role;
                    account.updated_at = now;
                }
                Ok(())
            })
            .await?;
        if read.role != role {
            self.ledger.revoke_all(account.id).await?;
            info!(actor = %actor.sub, from = %read.role, "Account role changed");
        }
        Ok(AccountSummary::from(&account))
    }

    /// Hard delete: the account, its single-use tokens and every session.
    ///
    /// # Errors
    /// `Unauthorized`, `Forbidden`, `AccountNotFound`, or `Unavailable`.
    #[instrument(skip_all, fields(account_id = %account_id))]
    pub async fn delete_account(&self, actor_token: &str, account_id: Uuid) -> Result<(), AuthError> {
        let actor = self
            .authorize(actor_token, Capability::DeleteAccounts)
            .await?;
        forbid_self(&actor, account_id)?;
        let account = self.require_account(account_id).await?;

        self.ledger.revoke_all(account.id).await?;
        self.ledger.forget_account(account.id).await?;
        let deleted = bounded(
            self.config.storage_timeout(),
            "account delete",
            self.accounts.delete(account.id),
        )
        .await?;
        if !deleted {
            return Err(AuthError::AccountNotFound);
        }
        info!(actor = %actor.sub, "Account deleted");
        Ok(())
    }

    /// One expiry sweep over the token ledger.
    ///
    /// # Errors
    /// Only `Unavailable`.
    pub async fn sweep_expired(&self) -> Result<SweepReport, AuthError> {
        self.ledger.sweep().await
    }

    async fn authorize(
        &self,
        access_token: &str,
        capability: Capability,
    ) -> Result<SessionClaims, AuthError> {
        let claims = self.authenticate(access_token).await?;
        state::require(claims.role, capability)?;
        Ok(claims)
    }

    async fn enforce_limit(
        &self,
        action: RateLimitAction,
        identifier: &str,
    ) -> Result<(), AuthError> {
        match self
            .rate_limiter
            .check_and_increment(action, identifier)
            .await?
        {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Limited => Err(AuthError::RateLimited),
        }
    }

    /// Like `enforce_limit`, but a refusal is reported as `false` so the
    /// caller can answer exactly as it would on success.
    async fn allow_quietly(
        &self,
        action: RateLimitAction,
        identifier: &str,
    ) -> Result<bool, AuthError> {
        match self.enforce_limit(action, identifier).await {
            Ok(()) => Ok(true),
            Err(AuthError::RateLimited) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn load_account(&self, account_id: Uuid) -> Result<Option<Account>, AuthError> {
        bounded(
            self.config.storage_timeout(),
            "account lookup",
            self.accounts.find_by_id(account_id),
        )
        .await
    }

    async fn require_account(&self, account_id: Uuid) -> Result<Account, AuthError> {
        self.load_account(account_id)
            .await?
            .ok_or(AuthError::AccountNotFound)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, AuthError> {
        bounded(
            self.config.storage_timeout(),
            "account lookup",
            self.accounts.find_by_email(email),
        )
        .await
    }

    /// Read-modify-write of one account under the repository's
    /// compare-and-set.
    ///
    /// When another writer gets in between the read and the write, `change`
    /// runs again on a fresh read, so every rule is checked against the state
    /// actually stored. Returns the account as read and as written.
    async fn modify_account<F>(
        &self,
        account_id: Uuid,
        mut change: F,
    ) -> Result<(Account, Account), AuthError>
    where
        F: FnMut(&mut Account) -> Result<(), AuthError>,
    {
        for attempt in 1..=ACCOUNT_WRITE_ATTEMPTS {
            let read = self.require_account(account_id).await?;
            let mut account = read.clone();
            change(&mut account)?;
            if account == read {
                return Ok((read, account));
            }
            let saved = bounded(
                self.config.storage_timeout(),
                "account update",
                self.accounts.update(&read, &account),
            )
            .await?;
            if saved {
                return Ok((read, account));
            }
            debug!(%account_id, attempt, "Account changed concurrently, retrying");
        }
        warn!(%account_id, "Account update kept losing to concurrent writers");
        Err(AuthError::Unavailable("account update"))
    }

    async fn store_password(&self, account: &Account, password_hash: &str) -> Result<(), AuthError> {
        let now = self.clock.now();
        let stored = bounded(
            self.config.storage_timeout(),
            "password update",
            self.accounts
                .update_password(account.id, password_hash, now),
        )
        .await?;
        if !stored {
            return Err(AuthError::AccountNotFound);
        }
        self.ledger.revoke_all(account.id).await?;
        self.notify(
            &account.email,
            EmailTemplate::PasswordChanged,
            json!({ "changed_at": now.to_rfc3339() }),
        );
        Ok(())
    }

    async fn send_verification(&self, account: &Account) -> Result<(), AuthError> {
        let issued = self
            .ledger
            .issue(
                account.id,
                TokenKind::EmailVerification,
                self.config.verification_ttl(),
            )
            .await?;
        let verify_url = build_action_url(
            self.config.frontend_base_url(),
            "verify-email",
            &issued.secret,
        );
        self.notify(
            &account.email,
            EmailTemplate::VerifyEmail,
            json!({
                "verify_url": verify_url,
                "expires_at": issued.expires_at.to_rfc3339(),
            }),
        );
        Ok(())
    }

    fn notify(&self, to_email: &str, template: EmailTemplate, parameters: serde_json::Value) {
        // Detached on purpose; delivery problems are logged by the notifier.
        drop(self.notifier.dispatch(EmailMessage {
            to_email: to_email.to_string(),
            template,
            parameters,
        }));
    }

    async fn blocking<T, F>(&self, operation: &'static str, work: F) -> Result<T, AuthError>
    where
        F: FnOnce(&CredentialStore) -> T + Send + 'static,
        T: Send + 'static,
    {
        let credentials = self.credentials.clone();
        tokio::task::spawn_blocking(move || work(&credentials))
            .await
            .map_err(|err| {
                error!("Blocking {operation} task failed: {err}");
                AuthError::Unavailable(operation)
            })
    }

    async fn hash_password(&self, password: SecretString) -> Result<String, AuthError> {
        self.blocking("password hashing", move |credentials| {
            credentials.hash(password.expose_secret())
        })
        .await?
        .map_err(|err| {
            error!("Failed to hash password: {err:#}");
            AuthError::Unavailable("password hashing")
        })
    }

    async fn verify_password(
        &self,
        password: SecretString,
        password_hash: String,
    ) -> Result<bool, AuthError> {
        self.blocking("password verification", move |credentials| {
            credentials.verify(password.expose_secret(), &password_hash)
        })
        .await
    }

    async fn burn_decoy(&self, password: SecretString) -> Result<(), AuthError> {
        self.blocking("password verification", move |credentials| {
            credentials.verify_decoy(password.expose_secret());
        })
        .await
    }
}

fn optional_field(value: Option<&str>, normalize: fn(&str) -> String) -> Option<String> {
    value.map(normalize).filter(|v| !v.is_empty())
}

fn forbid_self(actor: &SessionClaims, account_id: Uuid) -> Result<(), AuthError> {
    if actor.sub == account_id {
        Err(AuthError::Forbidden)
    } else {
        Ok(())
    }
}
