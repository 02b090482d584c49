//! Rate limiting primitives for auth flows.
//!
//! The fixed-window limiter keys counters by `{action}:{identifier}:{window}`
//! where the window index is `floor(now / window)`. A counter never grows past
//! the ceiling, so a rejected attempt does not extend anyone's lockout.

use async_trait::async_trait;
use chrono::Duration;
use std::fmt;
use std::sync::Arc;
use tracing::{error, warn};

use super::clock::Clock;
use super::config::RateLimitPolicy;
use super::error::AuthError;
use super::storage::CounterStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    Signup,
    Login,
    VerifyEmail,
    ResendVerification,
    PasswordResetRequest,
    PasswordReset,
}

impl RateLimitAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Signup => "signup",
            Self::Login => "login",
            Self::VerifyEmail => "verify_email",
            Self::ResendVerification => "resend_verification",
            Self::PasswordResetRequest => "password_reset_request",
            Self::PasswordReset => "password_reset",
        }
    }
}

impl fmt::Display for RateLimitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one attempt for `(action, identifier)` and decide.
    ///
    /// # Errors
    /// Returns `AuthError::Unavailable` when the counter store fails; callers
    /// treat that as a refusal.
    async fn check_and_increment(
        &self,
        action: RateLimitAction,
        identifier: &str,
    ) -> Result<RateLimitDecision, AuthError>;
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn check_and_increment(
        &self,
        _action: RateLimitAction,
        _identifier: &str,
    ) -> Result<RateLimitDecision, AuthError> {
        Ok(RateLimitDecision::Allowed)
    }
}

pub struct FixedWindowRateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    policy: RateLimitPolicy,
    timeout: std::time::Duration,
}

impl FixedWindowRateLimiter {
    #[must_use]
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        policy: RateLimitPolicy,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            store,
            clock,
            policy,
            timeout,
        }
    }

    fn window_millis(&self) -> i64 {
        self.policy.window.num_milliseconds().max(1)
    }
}

pub(crate) fn counter_key(action: RateLimitAction, identifier: &str, window_index: i64) -> String {
    format!("{}:{identifier}:{window_index}", action.as_str())
}

#[async_trait]
impl RateLimiter for FixedWindowRateLimiter {
    async fn check_and_increment(
        &self,
        action: RateLimitAction,
        identifier: &str,
    ) -> Result<RateLimitDecision, AuthError> {
        let now = self.clock.now();
        let window_ms = self.window_millis();
        let window_index = now.timestamp_millis().div_euclid(window_ms);
        let window_end = chrono::DateTime::from_timestamp_millis((window_index + 1) * window_ms)
            .unwrap_or(now + Duration::milliseconds(window_ms));
        let key = counter_key(action, identifier, window_index);

        let result = tokio::time::timeout(
            self.timeout,
            self.store
                .increment_with_ceiling(&key, self.policy.ceiling, now, window_end),
        )
        .await;

        match result {
            Ok(Ok(Some(_))) => Ok(RateLimitDecision::Allowed),
            Ok(Ok(None)) => {
                warn!("Rate limit reached for {action}");
                Ok(RateLimitDecision::Limited)
            }
            Ok(Err(err)) => {
                error!("Rate limit counter failed for {action}: {err:#}");
                Err(AuthError::Unavailable("rate limit"))
            }
            Err(_) => {
                error!("Rate limit counter timed out for {action}");
                Err(AuthError::Unavailable("rate limit"))
            }
        }
    }
}
