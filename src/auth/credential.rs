//! One-way password hashing, verification and rotation.
//!
//! Hashes are Argon2id PHC strings with a per-call random salt. Verification
//! never fails loudly: a malformed stored hash simply does not match.

use anyhow::{Result, anyhow};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use std::sync::Arc;

use super::clock::RandomSource;
use super::config::{PasswordHashCost, PasswordPolicy};
use super::error::{AuthError, PolicyViolation};

const SALT_BYTES: usize = 16;
// Only used to burn the same work as a real verification.
const TIMING_DECOY_PASSWORD: &str = "garbigo-timing-decoy";

pub struct CredentialStore {
    argon2: Argon2<'static>,
    policy: PasswordPolicy,
    random: Arc<dyn RandomSource>,
    decoy_hash: String,
}

impl CredentialStore {
    /// # Errors
    /// Returns an error if the cost parameters are rejected by Argon2 or the
    /// entropy source fails while preparing the timing decoy.
    pub fn new(
        cost: PasswordHashCost,
        policy: PasswordPolicy,
        random: Arc<dyn RandomSource>,
    ) -> Result<Self> {
        let params = Params::new(cost.memory_kib, cost.iterations, cost.parallelism, None)
            .map_err(|err| anyhow!("invalid argon2 parameters: {err}"))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut store = Self {
            argon2,
            policy,
            random,
            decoy_hash: String::new(),
        };
        store.decoy_hash = store.hash(TIMING_DECOY_PASSWORD)?;
        Ok(store)
    }

    /// Hash a password with a fresh random salt.
    ///
    /// # Errors
    /// Returns an error if the entropy source or the hasher fails.
    pub fn hash(&self, password: &str) -> Result<String> {
        let mut salt = [0u8; SALT_BYTES];
        self.random.fill(&mut salt)?;
        let salt =
            SaltString::encode_b64(&salt).map_err(|err| anyhow!("failed to encode salt: {err}"))?;
        let hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|err| anyhow!("failed to hash password: {err}"))?;
        Ok(hash.to_string())
    }

    /// Check a password against a stored PHC string.
    ///
    /// The Argon2 tag comparison is constant time; unparseable hashes return
    /// `false` instead of an error.
    #[must_use]
    pub fn verify(&self, password: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        self.argon2
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }

    /// Spend one verification worth of work against a decoy hash.
    ///
    /// Used when no account matches a login identifier so the response time
    /// does not reveal whether the account exists.
    pub fn verify_decoy(&self, password: &str) {
        let _ = self.verify(password, &self.decoy_hash);
    }

    /// Evaluate the minimum-strength predicate.
    ///
    /// # Errors
    /// Returns the first violated rule.
    pub fn check_policy(&self, password: &str) -> Result<(), PolicyViolation> {
        check_policy(&self.policy, password)
    }

    /// Verify the current password and hash a replacement.
    ///
    /// The old password is verified and the policy evaluated before either
    /// result is inspected, so a wrong password costs the same as a policy
    /// rejection.
    ///
    /// # Errors
    /// - `InvalidCredentials` when `old_password` does not match.
    /// - `PasswordPolicyViolation` when the new password equals the old one or
    ///   fails the strength policy.
    /// - `Unavailable` when hashing fails.
    pub fn rotate(
        &self,
        old_password: &str,
        new_password: &str,
        current_hash: &str,
    ) -> Result<String, AuthError> {
        let verified = self.verify(old_password, current_hash);
        let reused = old_password == new_password;
        let policy = self.check_policy(new_password);

        if !verified {
            return Err(AuthError::InvalidCredentials);
        }
        if reused {
            return Err(PolicyViolation::SameAsCurrent.into());
        }
        policy?;

        self.hash(new_password).map_err(|err| {
            tracing::error!("Failed to hash rotated password: {err:#}");
            AuthError::Unavailable("password hashing")
        })
    }
}

pub(crate) fn check_policy(policy: &PasswordPolicy, password: &str) -> Result<(), PolicyViolation> {
    if password.chars().count() < policy.min_length {
        return Err(PolicyViolation::TooShort {
            min_length: policy.min_length,
        });
    }
    if password.chars().any(char::is_whitespace) {
        return Err(PolicyViolation::ContainsWhitespace);
    }
    if policy.require_lowercase && !password.chars().any(char::is_lowercase) {
        return Err(PolicyViolation::MissingLowercase);
    }
    if policy.require_uppercase && !password.chars().any(char::is_uppercase) {
        return Err(PolicyViolation::MissingUppercase);
    }
    if policy.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(PolicyViolation::MissingDigit);
    }
    if policy.require_symbol && !password.chars().any(|c| !c.is_alphanumeric()) {
        return Err(PolicyViolation::MissingSymbol);
    }
    Ok(())
}
