//! Configuration surface consumed by the auth core.

use chrono::Duration;
use secrecy::{ExposeSecret, SecretString};
use std::net::IpAddr;

const DEFAULT_VERIFICATION_TTL_SECONDS: i64 = 24 * 60 * 60;
const DEFAULT_RESET_TTL_SECONDS: i64 = 30 * 60;
const DEFAULT_ACCESS_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_REFRESH_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;
const DEFAULT_RATE_LIMIT_CEILING: u32 = 5;
const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: i64 = 10 * 60;
const DEFAULT_RESEND_COOLDOWN_SECONDS: i64 = 60;
const DEFAULT_PASSWORD_MIN_LENGTH: usize = 8;
const DEFAULT_STORAGE_TIMEOUT_MILLIS: u64 = 5_000;
const DEFAULT_EMAIL_TIMEOUT_MILLIS: u64 = 10_000;
const DEFAULT_ISSUER: &str = "garbigo-auth";
const DEFAULT_FRONTEND_BASE_URL: &str = "http://localhost:3000";

/// Minimum signing key length in bytes for HMAC-SHA256 session tokens.
pub const MIN_SIGNING_KEY_BYTES: usize = 32;

/// Minimum strength predicate for new passwords.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub require_lowercase: bool,
    pub require_uppercase: bool,
    pub require_digit: bool,
    pub require_symbol: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: DEFAULT_PASSWORD_MIN_LENGTH,
            require_lowercase: true,
            require_uppercase: true,
            require_digit: true,
            require_symbol: true,
        }
    }
}

/// Argon2id cost parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PasswordHashCost {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for PasswordHashCost {
    fn default() -> Self {
        Self {
            memory_kib: argon2::Params::DEFAULT_M_COST,
            iterations: argon2::Params::DEFAULT_T_COST,
            parallelism: argon2::Params::DEFAULT_P_COST,
        }
    }
}

/// Fixed-window limiter settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub ceiling: u32,
    pub window: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_RATE_LIMIT_CEILING,
            window: Duration::seconds(DEFAULT_RATE_LIMIT_WINDOW_SECONDS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    signing_key: SecretString,
    issuer: String,
    frontend_base_url: String,
    verification_ttl: Duration,
    reset_ttl: Duration,
    access_ttl: Duration,
    refresh_ttl: Duration,
    resend_cooldown: Duration,
    rate_limit: RateLimitPolicy,
    password_policy: PasswordPolicy,
    password_hash_cost: PasswordHashCost,
    storage_timeout: std::time::Duration,
    email_timeout: std::time::Duration,
    trusted_proxies: Vec<IpAddr>,
}

impl AuthConfig {
    #[must_use]
    pub fn new(signing_key: SecretString) -> Self {
        Self {
            signing_key,
            issuer: DEFAULT_ISSUER.to_string(),
            frontend_base_url: DEFAULT_FRONTEND_BASE_URL.to_string(),
            verification_ttl: Duration::seconds(DEFAULT_VERIFICATION_TTL_SECONDS),
            reset_ttl: Duration::seconds(DEFAULT_RESET_TTL_SECONDS),
            access_ttl: Duration::seconds(DEFAULT_ACCESS_TTL_SECONDS),
            refresh_ttl: Duration::seconds(DEFAULT_REFRESH_TTL_SECONDS),
            resend_cooldown: Duration::seconds(DEFAULT_RESEND_COOLDOWN_SECONDS),
            rate_limit: RateLimitPolicy::default(),
            password_policy: PasswordPolicy::default(),
            password_hash_cost: PasswordHashCost::default(),
            storage_timeout: std::time::Duration::from_millis(DEFAULT_STORAGE_TIMEOUT_MILLIS),
            email_timeout: std::time::Duration::from_millis(DEFAULT_EMAIL_TIMEOUT_MILLIS),
            trusted_proxies: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_frontend_base_url(mut self, url: String) -> Self {
        self.frontend_base_url = url;
        self
    }

    #[must_use]
    pub fn with_verification_ttl(mut self, ttl: Duration) -> Self {
        self.verification_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_reset_ttl(mut self, ttl: Duration) -> Self {
        self.reset_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_resend_cooldown(mut self, cooldown: Duration) -> Self {
        self.resend_cooldown = cooldown;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = policy;
        self
    }

    #[must_use]
    pub fn with_password_policy(mut self, policy: PasswordPolicy) -> Self {
        self.password_policy = policy;
        self
    }

    #[must_use]
    pub fn with_password_hash_cost(mut self, cost: PasswordHashCost) -> Self {
        self.password_hash_cost = cost;
        self
    }

    #[must_use]
    pub fn with_storage_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.storage_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_email_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.email_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_trusted_proxies(mut self, proxies: Vec<IpAddr>) -> Self {
        self.trusted_proxies = proxies;
        self
    }

    pub(crate) fn signing_key(&self) -> &[u8] {
        self.signing_key.expose_secret().as_bytes()
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    #[must_use]
    pub fn verification_ttl(&self) -> Duration {
        self.verification_ttl
    }

    #[must_use]
    pub fn reset_ttl(&self) -> Duration {
        self.reset_ttl
    }

    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    #[must_use]
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    #[must_use]
    pub fn resend_cooldown(&self) -> Duration {
        self.resend_cooldown
    }

    #[must_use]
    pub fn rate_limit(&self) -> RateLimitPolicy {
        self.rate_limit
    }

    #[must_use]
    pub fn password_policy(&self) -> PasswordPolicy {
        self.password_policy
    }

    #[must_use]
    pub fn password_hash_cost(&self) -> PasswordHashCost {
        self.password_hash_cost
    }

    #[must_use]
    pub fn storage_timeout(&self) -> std::time::Duration {
        self.storage_timeout
    }

    #[must_use]
    pub fn email_timeout(&self) -> std::time::Duration {
        self.email_timeout
    }

    #[must_use]
    pub fn trusted_proxies(&self) -> &[IpAddr] {
        &self.trusted_proxies
    }
}
