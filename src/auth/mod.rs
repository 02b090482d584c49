//! Credential and session lifecycle engine.
//!
//! Flow Overview:
//! 1) `signup` stores a `PENDING` account and mails a single-use email
//!    verification link. No session is issued yet.
//! 2) `verify_email` consumes the link and activates the account.
//! 3) `login` verifies the Argon2id hash and issues an HS256 access/refresh
//!    pair. Only `ACTIVE` accounts get a session.
//! 4) `refresh` rotates the pair; the presented refresh token is revoked.
//! 5) `request_password_reset` / `reset_password` run the reset link flow and
//!    end every session of the account.
//!
//! Security & Design Notes:
//! - Single-use secrets are 256-bit random values; only their SHA-256 is
//!   stored, and consumption is a compare-and-set so each link works once.
//! - Login answers `InvalidCredentials` for unknown identifiers and wrong
//!   passwords alike, spending a decoy Argon2 verification on the former.
//! - Reset requests and verification resends always succeed from the
//!   caller's point of view.
//! - Session revocation is either per token (logout, refresh rotation) or per
//!   account (a session epoch bump on password change, suspension, role
//!   change and deletion).
//! - Storage and entropy faults surface as `AuthError::Unavailable`, never as
//!   a credential decision.

pub mod account;
pub mod clock;
pub mod config;
pub mod credential;
pub mod email;
pub mod error;
pub mod rate_limit;
pub mod service;
pub mod state;
pub mod storage;
pub mod sweep;
pub mod tokens;
pub mod types;
pub mod utils;

#[cfg(test)]
mod tests;

pub use account::{Account, AccountStatus, AccountSummary, Role};
pub use clock::{Clock, ManualClock, OsRandom, RandomSource, SeededRandom, SystemClock};
pub use config::{AuthConfig, PasswordHashCost, PasswordPolicy, RateLimitPolicy};
pub use credential::CredentialStore;
pub use email::{
    ChannelEmailDispatcher, EmailDispatcher, EmailMessage, EmailTemplate, LogEmailDispatcher,
};
pub use error::{AccountField, AuthError, PolicyViolation};
pub use rate_limit::{
    FixedWindowRateLimiter, NoopRateLimiter, RateLimitAction, RateLimitDecision, RateLimiter,
};
pub use service::{AuthCore, Collaborators};
pub use state::Capability;
pub use sweep::{SweepReport, Sweeper, spawn_expiry_sweeper};
pub use tokens::{IssuedToken, Session, SessionClaims, TokenKind, TokenLedger};
pub use types::{LoginOutcome, LoginRequest, RequestContext, SignupOutcome, SignupRequest};
