use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use secrecy::SecretString;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use super::account::{Account, AccountStatus, Role};
use super::clock::{Clock, ManualClock, SeededRandom};
use super::config::{AuthConfig, PasswordHashCost};
use super::email::{ChannelEmailDispatcher, EmailMessage, EmailTemplate};
use super::error::{AccountField, AuthError, PolicyViolation};
use super::rate_limit::FixedWindowRateLimiter;
use super::service::{AuthCore, Collaborators};
use super::storage::memory::{MemoryAccountRepository, MemoryCounterStore, MemoryTokenRepository};
use super::storage::{AccountRepository, CounterStore, InsertOutcome};
use super::tokens::{Session, TokenKind};
use super::types::{LoginRequest, RequestContext, SignupRequest};

const PASSWORD: &str = "Str0ng!Pass";
const NEW_PASSWORD: &str = "NewPass1!";

struct Harness {
    core: AuthCore,
    accounts: Arc<MemoryAccountRepository>,
    tokens: Arc<MemoryTokenRepository>,
    clock: Arc<ManualClock>,
    mail: UnboundedReceiver<EmailMessage>,
}

fn test_config() -> AuthConfig {
    AuthConfig::new(SecretString::from("k".repeat(32)))
        .with_frontend_base_url("https://app.garbigo.test".to_string())
        .with_password_hash_cost(PasswordHashCost {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        })
}

fn harness() -> Result<Harness> {
    harness_with(test_config())
}

fn harness_with(config: AuthConfig) -> Result<Harness> {
    harness_with_counters(config, Arc::new(MemoryCounterStore::default()))
}

fn harness_with_counters(config: AuthConfig, counters: Arc<dyn CounterStore>) -> Result<Harness> {
    let accounts = Arc::new(MemoryAccountRepository::default());
    harness_with_stores(config, counters, accounts.clone(), accounts)
}

/// `accounts` is what assertions inspect; `account_repository` is what the
/// core talks to. They differ when a test wraps the repository.
fn harness_with_stores(
    config: AuthConfig,
    counters: Arc<dyn CounterStore>,
    accounts: Arc<MemoryAccountRepository>,
    account_repository: Arc<dyn AccountRepository>,
) -> Result<Harness> {
    let tokens = Arc::new(MemoryTokenRepository::default());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let (email, mail) = ChannelEmailDispatcher::new();
    let rate_limiter = FixedWindowRateLimiter::new(
        counters,
        clock.clone(),
        config.rate_limit(),
        config.storage_timeout(),
    );
    let core = AuthCore::new(
        config,
        Collaborators {
            accounts: account_repository,
            tokens: tokens.clone(),
            rate_limiter: Arc::new(rate_limiter),
            email: Arc::new(email),
            clock: clock.clone(),
            random: Arc::new(SeededRandom::from_seed([7; 32])),
        },
    )?;
    Ok(Harness {
        core,
        accounts,
        tokens,
        clock,
        mail,
    })
}

fn signup_request(email: &str, username: Option<&str>, role: Role) -> SignupRequest {
    SignupRequest {
        email: email.to_string(),
        username: username.map(str::to_string),
        phone: None,
        password: SecretString::from(PASSWORD),
        role,
    }
}

fn login_request(identifier: &str, password: &str) -> LoginRequest {
    LoginRequest {
        identifier: identifier.to_string(),
        password: SecretString::from(password),
    }
}

fn from_ip(last_octet: u8) -> RequestContext {
    RequestContext::from_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)))
}

impl Harness {
    /// Next delivered message with `template`, skipping any others.
    async fn next_mail(&mut self, template: EmailTemplate) -> Result<EmailMessage> {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), self.mail.recv())
                .await
                .context("no email delivered")?
                .context("email channel closed")?;
            if message.template == template {
                return Ok(message);
            }
        }
    }

    async fn assert_no_mail(&mut self) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Ok(message) = self.mail.try_recv() {
            bail!("unexpected email: {}", message.template);
        }
        Ok(())
    }

    /// Secret carried in the fragment of an action link.
    async fn next_secret(&mut self, template: EmailTemplate) -> Result<String> {
        let message = self.next_mail(template).await?;
        let key = match template {
            EmailTemplate::VerifyEmail => "verify_url",
            EmailTemplate::PasswordReset => "reset_url",
            EmailTemplate::PasswordChanged => bail!("password_changed carries no link"),
        };
        let url = message.parameters[key]
            .as_str()
            .ok_or_else(|| anyhow!("missing {key}"))?;
        let (_, secret) = url
            .split_once("#token=")
            .ok_or_else(|| anyhow!("no token in {url}"))?;
        Ok(secret.to_string())
    }

    async fn account(&self, id: Uuid) -> Result<Account> {
        self.accounts
            .find_by_id(id)
            .await?
            .ok_or_else(|| anyhow!("account {id} missing"))
    }

    /// Sign up, verify and optionally promote an account, then log it in.
    async fn active_account(
        &mut self,
        email: &str,
        username: &str,
        role: Role,
    ) -> Result<(Uuid, Session)> {
        let outcome = self
            .core
            .signup(
                signup_request(email, Some(username), Role::Client),
                RequestContext::default(),
            )
            .await?;
        let secret = self.next_secret(EmailTemplate::VerifyEmail).await?;
        self.core
            .verify_email(&secret, RequestContext::default())
            .await?;

        if role != Role::Client {
            let read = self.account(outcome.account_id).await?;
            let mut account = read.clone();
            account.role = role;
            self.accounts.update(&read, &account).await?;
        }

        let login = self
            .core
            .login(login_request(email, PASSWORD), RequestContext::default())
            .await?;
        Ok((outcome.account_id, login.session))
    }
}

#[tokio::test]
async fn signup_creates_pending_account_with_one_live_token() -> Result<()> {
    let mut h = harness()?;
    let outcome = h
        .core
        .signup(
            signup_request("A@X.com ", None, Role::Collector),
            RequestContext::default(),
        )
        .await?;
    assert!(outcome.verification_required);

    let account = h.account(outcome.account_id).await?;
    assert_eq!(account.email, "a@x.com");
    assert_eq!(account.status, AccountStatus::Pending);
    assert!(!account.email_verified);
    assert!(account.password_hash.starts_with("$argon2id$"));
    assert_eq!(
        h.tokens
            .count_live(account.id, TokenKind::EmailVerification, h.clock.now())
            .await,
        1
    );

    let message = h.next_mail(EmailTemplate::VerifyEmail).await?;
    assert_eq!(message.to_email, "a@x.com");
    let url = message.parameters["verify_url"].as_str().unwrap_or_default();
    assert!(url.starts_with("https://app.garbigo.test/verify-email#token="));
    Ok(())
}

#[tokio::test]
async fn signup_reports_the_colliding_field() -> Result<()> {
    let h = harness()?;
    let mut first = signup_request("a@x.com", Some("alice"), Role::Client);
    first.phone = Some("+254 712 345 678".to_string());
    h.core.signup(first, RequestContext::default()).await?;

    let same_email = h
        .core
        .signup(
            signup_request("A@x.com", None, Role::Client),
            RequestContext::default(),
        )
        .await;
    assert_eq!(
        same_email,
        Err(AuthError::DuplicateField(AccountField::Email))
    );

    let same_username = h
        .core
        .signup(
            signup_request("b@x.com", Some("Alice"), Role::Client),
            RequestContext::default(),
        )
        .await;
    assert_eq!(
        same_username,
        Err(AuthError::DuplicateField(AccountField::Username))
    );

    let mut same_phone = signup_request("c@x.com", None, Role::Client);
    same_phone.phone = Some("+254712345678".to_string());
    assert_eq!(
        h.core.signup(same_phone, RequestContext::default()).await,
        Err(AuthError::DuplicateField(AccountField::Phone))
    );
    Ok(())
}

#[tokio::test]
async fn signup_rejects_staff_roles_and_bad_input() -> Result<()> {
    let h = harness()?;
    for role in [Role::Admin, Role::Operations, Role::Support, Role::Finance] {
        let result = h
            .core
            .signup(signup_request("a@x.com", None, role), RequestContext::default())
            .await;
        assert_eq!(result, Err(AuthError::Forbidden));
    }

    let result = h
        .core
        .signup(
            signup_request("not-an-email", None, Role::Client),
            RequestContext::default(),
        )
        .await;
    assert_eq!(result, Err(AuthError::InvalidField(AccountField::Email)));

    let result = h
        .core
        .signup(
            signup_request("a@x.com", Some("x"), Role::Client),
            RequestContext::default(),
        )
        .await;
    assert_eq!(result, Err(AuthError::InvalidField(AccountField::Username)));

    let mut weak = signup_request("a@x.com", None, Role::Client);
    weak.password = SecretString::from("short");
    assert!(matches!(
        h.core.signup(weak, RequestContext::default()).await,
        Err(AuthError::PasswordPolicyViolation(
            PolicyViolation::TooShort { .. }
        ))
    ));
    Ok(())
}

#[tokio::test]
async fn signup_survives_a_broken_mail_path() -> Result<()> {
    let Harness {
        core,
        accounts,
        mail,
        ..
    } = harness()?;
    drop(mail);

    let outcome = core
        .signup(
            signup_request("a@x.com", None, Role::Client),
            RequestContext::default(),
        )
        .await?;
    assert!(accounts.find_by_id(outcome.account_id).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn login_on_pending_account_is_not_eligible() -> Result<()> {
    let h = harness()?;
    let outcome = h
        .core
        .signup(
            signup_request("a@x.com", None, Role::Client),
            RequestContext::default(),
        )
        .await?;

    let result = h
        .core
        .login(login_request("a@x.com", PASSWORD), RequestContext::default())
        .await;
    assert_eq!(
        result,
        Err(AuthError::AccountNotEligible(AccountStatus::Pending))
    );
    assert_eq!(h.account(outcome.account_id).await?.failed_login_count, 0);
    Ok(())
}

#[tokio::test]
async fn wrong_password_counts_a_failure() -> Result<()> {
    let mut h = harness()?;
    let (id, _) = h.active_account("a@x.com", "alice", Role::Client).await?;

    let result = h
        .core
        .login(login_request("alice", "Wr0ng!Pass"), RequestContext::default())
        .await;
    assert_eq!(result, Err(AuthError::InvalidCredentials));
    let account = h.account(id).await?;
    assert_eq!(account.failed_login_count, 1);
    assert!(account.last_failed_login_at.is_some());

    let unknown = h
        .core
        .login(login_request("nobody@x.com", PASSWORD), RequestContext::default())
        .await;
    assert_eq!(unknown, Err(AuthError::InvalidCredentials));

    let outcome = h
        .core
        .login(login_request("ALICE", PASSWORD), RequestContext::default())
        .await?;
    assert_eq!(outcome.account.login_count, 2);
    assert_eq!(h.account(id).await?.failed_login_count, 0);
    Ok(())
}

#[tokio::test]
async fn sixth_login_in_a_window_is_rate_limited() -> Result<()> {
    let mut h = harness()?;
    h.active_account("a@x.com", "alice", Role::Client).await?;

    // active_account already spent one attempt on this identifier.
    for _ in 0..4 {
        let result = h
            .core
            .login(login_request("a@x.com", "Wr0ng!Pass"), from_ip(1))
            .await;
        assert_eq!(result, Err(AuthError::InvalidCredentials));
    }
    let result = h
        .core
        .login(login_request("a@x.com", PASSWORD), from_ip(1))
        .await;
    assert_eq!(result, Err(AuthError::RateLimited));

    h.clock.advance(ChronoDuration::minutes(10));
    h.core
        .login(login_request("a@x.com", PASSWORD), from_ip(1))
        .await?;
    Ok(())
}

#[tokio::test]
async fn verification_token_works_once() -> Result<()> {
    let mut h = harness()?;
    let outcome = h
        .core
        .signup(
            signup_request("a@x.com", None, Role::Client),
            RequestContext::default(),
        )
        .await?;
    let secret = h.next_secret(EmailTemplate::VerifyEmail).await?;

    let summary = h
        .core
        .verify_email(&secret, RequestContext::default())
        .await?;
    assert_eq!(summary.status, AccountStatus::Active);
    assert!(summary.email_verified);
    assert_eq!(
        h.account(outcome.account_id).await?.status,
        AccountStatus::Active
    );

    let again = h
        .core
        .verify_email(&secret, RequestContext::default())
        .await;
    assert_eq!(again, Err(AuthError::TokenAlreadyUsed));
    Ok(())
}

#[tokio::test]
async fn expired_verification_token_never_activates() -> Result<()> {
    let mut h = harness()?;
    let outcome = h
        .core
        .signup(
            signup_request("a@x.com", None, Role::Client),
            RequestContext::default(),
        )
        .await?;
    let secret = h.next_secret(EmailTemplate::VerifyEmail).await?;

    h.clock.advance(ChronoDuration::hours(24));
    for _ in 0..3 {
        let result = h
            .core
            .verify_email(&secret, RequestContext::default())
            .await;
        assert_eq!(result, Err(AuthError::TokenExpired));
    }
    assert_eq!(
        h.account(outcome.account_id).await?.status,
        AccountStatus::Pending
    );
    Ok(())
}

#[tokio::test]
async fn resend_supersedes_the_previous_link() -> Result<()> {
    let mut h = harness()?;
    let outcome = h
        .core
        .signup(
            signup_request("a@x.com", None, Role::Client),
            RequestContext::default(),
        )
        .await?;
    let first = h.next_secret(EmailTemplate::VerifyEmail).await?;

    // Inside the cooldown nothing is sent.
    h.core
        .resend_verification("a@x.com", RequestContext::default())
        .await?;
    h.assert_no_mail().await?;

    h.clock.advance(ChronoDuration::seconds(61));
    h.core
        .resend_verification("a@x.com", RequestContext::default())
        .await?;
    let second = h.next_secret(EmailTemplate::VerifyEmail).await?;
    assert_ne!(first, second);
    assert_eq!(
        h.tokens
            .count_live(
                outcome.account_id,
                TokenKind::EmailVerification,
                h.clock.now()
            )
            .await,
        1
    );

    assert_eq!(
        h.core
            .verify_email(&first, RequestContext::default())
            .await,
        Err(AuthError::TokenNotFound)
    );
    h.core
        .verify_email(&second, RequestContext::default())
        .await?;

    // Verified accounts and unknown addresses are answered the same way.
    h.clock.advance(ChronoDuration::seconds(61));
    h.core
        .resend_verification("a@x.com", RequestContext::default())
        .await?;
    h.core
        .resend_verification("ghost@x.com", RequestContext::default())
        .await?;
    h.assert_no_mail().await?;
    Ok(())
}

#[tokio::test]
async fn password_reset_replaces_the_password_and_ends_sessions() -> Result<()> {
    let mut h = harness()?;
    let (id, session) = h.active_account("a@x.com", "alice", Role::Client).await?;

    h.core
        .request_password_reset("a@x.com", RequestContext::default())
        .await?;
    let secret = h.next_secret(EmailTemplate::PasswordReset).await?;

    h.core
        .reset_password(
            &secret,
            SecretString::from(NEW_PASSWORD),
            RequestContext::default(),
        )
        .await?;
    h.next_mail(EmailTemplate::PasswordChanged).await?;
    assert!(h.account(id).await?.password_changed_at.is_some());

    assert_eq!(
        h.core.authenticate(&session.access_token).await,
        Err(AuthError::Unauthorized)
    );
    assert_eq!(
        h.core.refresh(&session.refresh_token).await,
        Err(AuthError::Unauthorized)
    );

    let old = h
        .core
        .login(login_request("a@x.com", PASSWORD), RequestContext::default())
        .await;
    assert_eq!(old, Err(AuthError::InvalidCredentials));
    h.core
        .login(login_request("a@x.com", NEW_PASSWORD), RequestContext::default())
        .await?;
    Ok(())
}

#[tokio::test]
async fn reset_request_does_not_reveal_accounts() -> Result<()> {
    let mut h = harness()?;
    h.core
        .signup(
            signup_request("pending@x.com", None, Role::Client),
            RequestContext::default(),
        )
        .await?;
    h.next_mail(EmailTemplate::VerifyEmail).await?;

    assert_eq!(
        h.core
            .request_password_reset("ghost@x.com", RequestContext::default())
            .await,
        Ok(())
    );
    assert_eq!(
        h.core
            .request_password_reset("pending@x.com", RequestContext::default())
            .await,
        Ok(())
    );
    assert_eq!(
        h.core
            .request_password_reset("not an email", RequestContext::default())
            .await,
        Ok(())
    );
    h.assert_no_mail().await?;

    // Rate limited callers get the same answer.
    for _ in 0..7 {
        assert_eq!(
            h.core
                .request_password_reset("ghost@x.com", RequestContext::default())
                .await,
            Ok(())
        );
    }
    Ok(())
}

#[tokio::test]
async fn weak_reset_password_keeps_the_link() -> Result<()> {
    let mut h = harness()?;
    h.active_account("a@x.com", "alice", Role::Client).await?;
    h.core
        .request_password_reset("a@x.com", RequestContext::default())
        .await?;
    let secret = h.next_secret(EmailTemplate::PasswordReset).await?;

    let weak = h
        .core
        .reset_password(&secret, SecretString::from("weak"), RequestContext::default())
        .await;
    assert!(matches!(weak, Err(AuthError::PasswordPolicyViolation(_))));

    h.core
        .reset_password(
            &secret,
            SecretString::from(NEW_PASSWORD),
            RequestContext::default(),
        )
        .await?;

    let wrong_kind = h
        .core
        .verify_email(&secret, RequestContext::default())
        .await;
    assert_eq!(wrong_kind, Err(AuthError::TokenKindMismatch));
    Ok(())
}

#[tokio::test]
async fn change_password_hands_back_a_fresh_session() -> Result<()> {
    let mut h = harness()?;
    let (_, session) = h.active_account("a@x.com", "alice", Role::Client).await?;

    let wrong = h
        .core
        .change_password(
            &session.access_token,
            SecretString::from("Wr0ng!Pass"),
            SecretString::from(NEW_PASSWORD),
        )
        .await;
    assert_eq!(wrong, Err(AuthError::InvalidCredentials));

    let reused = h
        .core
        .change_password(
            &session.access_token,
            SecretString::from(PASSWORD),
            SecretString::from(PASSWORD),
        )
        .await;
    assert_eq!(
        reused,
        Err(AuthError::PasswordPolicyViolation(
            PolicyViolation::SameAsCurrent
        ))
    );

    let fresh = h
        .core
        .change_password(
            &session.access_token,
            SecretString::from(PASSWORD),
            SecretString::from(NEW_PASSWORD),
        )
        .await?;
    h.next_mail(EmailTemplate::PasswordChanged).await?;

    assert_eq!(
        h.core.authenticate(&session.access_token).await,
        Err(AuthError::Unauthorized)
    );
    h.core.authenticate(&fresh.access_token).await?;
    Ok(())
}

#[tokio::test]
async fn refresh_rotates_and_rejects_replay() -> Result<()> {
    let mut h = harness()?;
    let (id, session) = h.active_account("a@x.com", "alice", Role::Client).await?;

    let rotated = h.core.refresh(&session.refresh_token).await?;
    let claims = h.core.authenticate(&rotated.access_token).await?;
    assert_eq!(claims.sub, id);

    assert_eq!(
        h.core.refresh(&session.refresh_token).await,
        Err(AuthError::Unauthorized)
    );
    assert_eq!(
        h.core.refresh(&rotated.access_token).await,
        Err(AuthError::Unauthorized)
    );
    assert_eq!(
        h.core.authenticate(&rotated.refresh_token).await,
        Err(AuthError::Unauthorized)
    );
    Ok(())
}

#[tokio::test]
async fn access_tokens_expire() -> Result<()> {
    let mut h = harness()?;
    let (_, session) = h.active_account("a@x.com", "alice", Role::Client).await?;

    h.clock.advance(ChronoDuration::hours(1));
    assert_eq!(
        h.core.authenticate(&session.access_token).await,
        Err(AuthError::Unauthorized)
    );
    h.core.refresh(&session.refresh_token).await?;
    Ok(())
}

#[tokio::test]
async fn logout_is_idempotent() -> Result<()> {
    let mut h = harness()?;
    let (_, session) = h.active_account("a@x.com", "alice", Role::Client).await?;

    h.core
        .logout(&session.access_token, Some(&session.refresh_token))
        .await?;
    assert_eq!(
        h.core.authenticate(&session.access_token).await,
        Err(AuthError::Unauthorized)
    );
    assert_eq!(
        h.core.refresh(&session.refresh_token).await,
        Err(AuthError::Unauthorized)
    );

    h.core
        .logout(&session.access_token, Some(&session.refresh_token))
        .await?;
    h.core.logout("garbage", None).await?;
    Ok(())
}

#[tokio::test]
async fn suspension_ends_sessions_and_blocks_login() -> Result<()> {
    let mut h = harness()?;
    let (_, admin) = h.active_account("root@x.com", "root", Role::Admin).await?;
    let (user, session) = h.active_account("a@x.com", "alice", Role::Client).await?;

    let summary = h
        .core
        .set_status(&admin.access_token, user, AccountStatus::Suspended)
        .await?;
    assert_eq!(summary.status, AccountStatus::Suspended);
    assert_eq!(
        h.core.authenticate(&session.access_token).await,
        Err(AuthError::Unauthorized)
    );
    assert_eq!(
        h.core
            .login(login_request("a@x.com", PASSWORD), RequestContext::default())
            .await,
        Err(AuthError::AccountNotEligible(AccountStatus::Suspended))
    );

    h.core
        .set_status(&admin.access_token, user, AccountStatus::Active)
        .await?;
    h.core
        .login(login_request("a@x.com", PASSWORD), RequestContext::default())
        .await?;
    Ok(())
}

#[tokio::test]
async fn blocked_accounts_need_reactivation() -> Result<()> {
    let mut h = harness()?;
    let (_, admin) = h.active_account("root@x.com", "root", Role::Admin).await?;
    let (user, _) = h.active_account("a@x.com", "alice", Role::Client).await?;

    h.core
        .set_status(&admin.access_token, user, AccountStatus::Blocked)
        .await?;
    assert_eq!(
        h.core
            .set_status(&admin.access_token, user, AccountStatus::Active)
            .await,
        Err(AuthError::AccountNotEligible(AccountStatus::Blocked))
    );

    let summary = h.core.reactivate(&admin.access_token, user).await?;
    assert_eq!(summary.status, AccountStatus::Active);
    assert_eq!(
        h.core.reactivate(&admin.access_token, user).await,
        Err(AuthError::AccountNotEligible(AccountStatus::Active))
    );
    Ok(())
}

#[tokio::test]
async fn reactivating_an_unverified_account_returns_it_to_pending() -> Result<()> {
    let mut h = harness()?;
    let (_, admin) = h.active_account("root@x.com", "root", Role::Admin).await?;
    let outcome = h
        .core
        .signup(
            signup_request("a@x.com", None, Role::Client),
            RequestContext::default(),
        )
        .await?;

    h.core
        .set_status(
            &admin.access_token,
            outcome.account_id,
            AccountStatus::Deactivated,
        )
        .await?;
    let summary = h
        .core
        .reactivate(&admin.access_token, outcome.account_id)
        .await?;
    assert_eq!(summary.status, AccountStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn unverified_accounts_cannot_be_activated_by_detour() -> Result<()> {
    let mut h = harness()?;
    let (_, admin) = h.active_account("root@x.com", "root", Role::Admin).await?;
    let outcome = h
        .core
        .signup(
            signup_request("a@x.com", None, Role::Client),
            RequestContext::default(),
        )
        .await?;
    let user = outcome.account_id;

    for detour in [AccountStatus::Suspended, AccountStatus::Deactivated] {
        h.core
            .set_status(&admin.access_token, user, detour)
            .await?;
        assert_eq!(
            h.core
                .set_status(&admin.access_token, user, AccountStatus::Active)
                .await,
            Err(AuthError::AccountNotEligible(detour))
        );
        let account = h.account(user).await?;
        assert_eq!(account.status, detour);
        assert!(!account.email_verified);
    }
    assert_eq!(
        h.core
            .login(login_request("a@x.com", PASSWORD), RequestContext::default())
            .await
            .map(|_| ()),
        Err(AuthError::AccountNotEligible(AccountStatus::Deactivated))
    );

    // Verifying while deactivated records the address but keeps the status;
    // only then may an administrator lift it.
    let secret = h.next_secret(EmailTemplate::VerifyEmail).await?;
    let summary = h
        .core
        .verify_email(&secret, RequestContext::default())
        .await?;
    assert_eq!(summary.status, AccountStatus::Deactivated);
    h.core
        .set_status(&admin.access_token, user, AccountStatus::Active)
        .await?;
    h.core
        .login(login_request("a@x.com", PASSWORD), RequestContext::default())
        .await?;
    Ok(())
}

#[tokio::test]
async fn verification_does_not_undo_a_concurrent_suspension() -> Result<()> {
    let accounts = Arc::new(MemoryAccountRepository::default());
    let interleaved = Arc::new(InterleavedAccounts::new(accounts.clone()));
    let mut h = harness_with_stores(
        test_config(),
        Arc::new(MemoryCounterStore::default()),
        accounts,
        interleaved.clone(),
    )?;
    let outcome = h
        .core
        .signup(
            signup_request("a@x.com", None, Role::Client),
            RequestContext::default(),
        )
        .await?;
    let secret = h.next_secret(EmailTemplate::VerifyEmail).await?;

    interleaved.after_next_read(AccountStatus::Suspended).await;
    let summary = h
        .core
        .verify_email(&secret, RequestContext::default())
        .await?;
    assert_eq!(summary.status, AccountStatus::Suspended);

    let account = h.account(outcome.account_id).await?;
    assert_eq!(account.status, AccountStatus::Suspended);
    assert!(account.email_verified);
    assert_eq!(
        h.core
            .login(login_request("a@x.com", PASSWORD), RequestContext::default())
            .await
            .map(|_| ()),
        Err(AuthError::AccountNotEligible(AccountStatus::Suspended))
    );
    Ok(())
}

#[tokio::test]
async fn status_change_is_rechecked_after_losing_a_race() -> Result<()> {
    let accounts = Arc::new(MemoryAccountRepository::default());
    let interleaved = Arc::new(InterleavedAccounts::new(accounts.clone()));
    let mut h = harness_with_stores(
        test_config(),
        Arc::new(MemoryCounterStore::default()),
        accounts,
        interleaved.clone(),
    )?;
    let (_, admin) = h.active_account("root@x.com", "root", Role::Admin).await?;
    let (user, _) = h.active_account("a@x.com", "alice", Role::Client).await?;
    h.core
        .set_status(&admin.access_token, user, AccountStatus::Suspended)
        .await?;

    // Another administrator blocks the account while this one lifts the
    // suspension; the retry sees BLOCKED and refuses.
    interleaved.after_next_read(AccountStatus::Blocked).await;
    assert_eq!(
        h.core
            .set_status(&admin.access_token, user, AccountStatus::Active)
            .await,
        Err(AuthError::AccountNotEligible(AccountStatus::Blocked))
    );
    assert_eq!(h.account(user).await?.status, AccountStatus::Blocked);
    Ok(())
}

#[tokio::test]
async fn capabilities_gate_administration() -> Result<()> {
    let mut h = harness()?;
    let (admin_id, admin) = h.active_account("root@x.com", "root", Role::Admin).await?;
    let (support_id, support) = h
        .active_account("help@x.com", "helpdesk", Role::Support)
        .await?;
    let (user, client) = h.active_account("a@x.com", "alice", Role::Client).await?;

    assert_eq!(
        h.core.list_accounts(&client.access_token, false).await,
        Err(AuthError::Forbidden)
    );
    assert_eq!(h.core.list_accounts(&support.access_token, false).await?.len(), 3);
    assert_eq!(
        h.core
            .set_status(&support.access_token, user, AccountStatus::Suspended)
            .await,
        Err(AuthError::Forbidden)
    );
    assert_eq!(
        h.core
            .assign_role(&support.access_token, support_id, Role::Admin)
            .await,
        Err(AuthError::Forbidden)
    );
    assert_eq!(
        h.core
            .set_status(&admin.access_token, admin_id, AccountStatus::Suspended)
            .await,
        Err(AuthError::Forbidden)
    );
    assert_eq!(
        h.core
            .get_account(&admin.access_token, Uuid::nil())
            .await,
        Err(AuthError::AccountNotFound)
    );
    assert_eq!(
        h.core.get_account("not-a-token", user).await,
        Err(AuthError::Unauthorized)
    );
    Ok(())
}

#[tokio::test]
async fn archival_hides_without_touching_status() -> Result<()> {
    let mut h = harness()?;
    let (_, admin) = h.active_account("root@x.com", "root", Role::Admin).await?;
    let (user, _) = h.active_account("a@x.com", "alice", Role::Client).await?;

    let summary = h.core.archive(&admin.access_token, user).await?;
    assert!(summary.archived);
    assert_eq!(summary.status, AccountStatus::Active);

    let visible = h.core.list_accounts(&admin.access_token, false).await?;
    assert!(visible.iter().all(|a| a.id != user));
    let all = h.core.list_accounts(&admin.access_token, true).await?;
    assert!(all.iter().any(|a| a.id == user));

    let summary = h.core.unarchive(&admin.access_token, user).await?;
    assert!(!summary.archived);
    assert_eq!(summary.status, AccountStatus::Active);
    Ok(())
}

#[tokio::test]
async fn role_change_forces_a_new_login() -> Result<()> {
    let mut h = harness()?;
    let (_, admin) = h.active_account("root@x.com", "root", Role::Admin).await?;
    let (user, session) = h.active_account("a@x.com", "alice", Role::Client).await?;

    let summary = h
        .core
        .assign_role(&admin.access_token, user, Role::Operations)
        .await?;
    assert_eq!(summary.role, Role::Operations);
    assert_eq!(
        h.core.authenticate(&session.access_token).await,
        Err(AuthError::Unauthorized)
    );

    let login = h
        .core
        .login(login_request("alice", PASSWORD), RequestContext::default())
        .await?;
    let claims = h.core.authenticate(&login.session.access_token).await?;
    assert_eq!(claims.role, Role::Operations);
    Ok(())
}

#[tokio::test]
async fn deleted_accounts_are_gone() -> Result<()> {
    let mut h = harness()?;
    let (_, admin) = h.active_account("root@x.com", "root", Role::Admin).await?;
    let (user, session) = h.active_account("a@x.com", "alice", Role::Client).await?;
    h.core
        .request_password_reset("a@x.com", RequestContext::default())
        .await?;
    let secret = h.next_secret(EmailTemplate::PasswordReset).await?;

    h.core.delete_account(&admin.access_token, user).await?;

    assert_eq!(
        h.core.get_account(&admin.access_token, user).await,
        Err(AuthError::AccountNotFound)
    );
    assert_eq!(
        h.core.authenticate(&session.access_token).await,
        Err(AuthError::Unauthorized)
    );
    assert_eq!(
        h.core
            .login(login_request("a@x.com", PASSWORD), RequestContext::default())
            .await,
        Err(AuthError::InvalidCredentials)
    );
    assert_eq!(
        h.core
            .reset_password(
                &secret,
                SecretString::from(NEW_PASSWORD),
                RequestContext::default()
            )
            .await,
        Err(AuthError::TokenNotFound)
    );

    // The address is free again.
    h.core
        .signup(
            signup_request("a@x.com", Some("alice"), Role::Client),
            RequestContext::default(),
        )
        .await?;
    Ok(())
}

#[tokio::test]
async fn signup_is_limited_per_client_ip() -> Result<()> {
    let h = harness()?;
    for n in 0..5 {
        h.core
            .signup(
                signup_request(&format!("user{n}@x.com"), None, Role::Client),
                from_ip(9),
            )
            .await?;
    }
    let result = h
        .core
        .signup(signup_request("late@x.com", None, Role::Client), from_ip(9))
        .await;
    assert_eq!(result, Err(AuthError::RateLimited));

    h.core
        .signup(signup_request("late@x.com", None, Role::Client), from_ip(10))
        .await?;
    Ok(())
}

#[test]
fn short_signing_keys_are_rejected() {
    let config = AuthConfig::new(SecretString::from("too-short"));
    assert!(harness_with(config).is_err());
}

#[test]
fn invalid_frontend_url_is_rejected() {
    let config = test_config().with_frontend_base_url("not a url".to_string());
    assert!(harness_with(config).is_err());
}

#[test]
fn request_context_honors_trusted_proxies() -> Result<()> {
    let proxy = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    let h = harness_with(test_config().with_trusted_proxies(vec![proxy]))?;

    let context = h.core.request_context(proxy, Some("203.0.113.7, 10.0.0.1"));
    assert_eq!(context.client_ip, Some("203.0.113.7".parse()?));

    let direct = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 2));
    let context = h.core.request_context(direct, Some("203.0.113.7"));
    assert_eq!(context.client_ip, Some(direct));
    Ok(())
}

/// Lets a second writer change an account's status right after the core
/// has read it, before the core writes.
struct InterleavedAccounts {
    inner: Arc<MemoryAccountRepository>,
    pending: Mutex<Option<AccountStatus>>,
}

impl InterleavedAccounts {
    fn new(inner: Arc<MemoryAccountRepository>) -> Self {
        Self {
            inner,
            pending: Mutex::new(None),
        }
    }

    async fn after_next_read(&self, status: AccountStatus) {
        *self.pending.lock().await = Some(status);
    }
}

#[async_trait]
impl AccountRepository for InterleavedAccounts {
    async fn insert(&self, account: &Account) -> Result<InsertOutcome> {
        self.inner.insert(account).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>> {
        let read = self.inner.find_by_id(id).await?;
        if let Some(account) = &read {
            if let Some(status) = self.pending.lock().await.take() {
                let mut changed = account.clone();
                changed.status = status;
                self.inner.update(account, &changed).await?;
            }
        }
        Ok(read)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>> {
        self.inner.find_by_email(email).await
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Account>> {
        self.inner.find_by_username(username).await
    }

    async fn find_conflict(
        &self,
        email: &str,
        username: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Option<AccountField>> {
        self.inner.find_conflict(email, username, phone).await
    }

    async fn update(&self, read: &Account, account: &Account) -> Result<bool> {
        self.inner.update(read, account).await
    }

    async fn record_login_success(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.inner.record_login_success(id, at).await
    }

    async fn record_login_failure(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.inner.record_login_failure(id, at).await
    }

    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner.update_password(id, password_hash, at).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn list(&self, include_archived: bool) -> Result<Vec<Account>> {
        self.inner.list(include_archived).await
    }
}

struct BrokenCounters;

#[async_trait]
impl CounterStore for BrokenCounters {
    async fn increment_with_ceiling(
        &self,
        _key: &str,
        _ceiling: u32,
        _now: DateTime<Utc>,
        _expires_at: DateTime<Utc>,
    ) -> Result<Option<u32>> {
        Err(anyhow!("connection reset"))
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<u64> {
        Err(anyhow!("connection reset"))
    }
}

#[tokio::test]
async fn limiter_outage_fails_closed() -> Result<()> {
    let h = harness_with_counters(test_config(), Arc::new(BrokenCounters))?;
    let result = h
        .core
        .login(login_request("a@x.com", PASSWORD), RequestContext::default())
        .await;
    assert!(matches!(result, Err(err) if err.is_unavailable()));

    // Enumeration-safe flows still report infrastructure faults.
    let result = h
        .core
        .request_password_reset("a@x.com", RequestContext::default())
        .await;
    assert!(matches!(result, Err(err) if err.is_unavailable()));
    Ok(())
}

#[tokio::test]
async fn sweep_removes_spent_tokens() -> Result<()> {
    let mut h = harness()?;
    h.active_account("a@x.com", "alice", Role::Client).await?;
    assert_eq!(h.tokens.stored().await, 1);

    let report = h.core.sweep_expired().await?;
    assert_eq!(report.tokens, 1);
    assert_eq!(h.tokens.stored().await, 0);
    Ok(())
}
