//! Typed outcomes for every credential, token, and account operation.
//!
//! Everything except `Unavailable` is an expected result the caller can act
//! on. `Unavailable` covers storage faults and elapsed I/O timeouts and is
//! never used for a credential decision.

use std::fmt;

use thiserror::Error;

use super::account::AccountStatus;

/// Account attributes that carry a uniqueness or format constraint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccountField {
    Email,
    Username,
    Phone,
}

impl AccountField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Username => "username",
            Self::Phone => "phone",
        }
    }
}

impl fmt::Display for AccountField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason a candidate password was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyViolation {
    TooShort { min_length: usize },
    MissingLowercase,
    MissingUppercase,
    MissingDigit,
    MissingSymbol,
    ContainsWhitespace,
    SameAsCurrent,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { min_length } => {
                write!(f, "password must be at least {min_length} characters")
            }
            Self::MissingLowercase => f.write_str("password must contain a lowercase letter"),
            Self::MissingUppercase => f.write_str("password must contain an uppercase letter"),
            Self::MissingDigit => f.write_str("password must contain a digit"),
            Self::MissingSymbol => f.write_str("password must contain a symbol"),
            Self::ContainsWhitespace => f.write_str("password must not contain whitespace"),
            Self::SameAsCurrent => f.write_str("new password must differ from the current one"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("{0} is already in use")]
    DuplicateField(AccountField),
    #[error("invalid {0}")]
    InvalidField(AccountField),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account is not eligible for this action (status: {0})")]
    AccountNotEligible(AccountStatus),
    #[error("token not found")]
    TokenNotFound,
    #[error("token expired")]
    TokenExpired,
    #[error("token already used")]
    TokenAlreadyUsed,
    #[error("token kind mismatch")]
    TokenKindMismatch,
    #[error("rate limited")]
    RateLimited,
    #[error("{0}")]
    PasswordPolicyViolation(PolicyViolation),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("account not found")]
    AccountNotFound,
    #[error("service unavailable: {0}")]
    Unavailable(&'static str),
}

impl AuthError {
    /// Infrastructure faults are fatal for the request; everything else is a
    /// decision the caller may surface to the user.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<PolicyViolation> for AuthError {
    fn from(violation: PolicyViolation) -> Self {
        Self::PasswordPolicyViolation(violation)
    }
}
