//! # Garbigo Auth (credential and session lifecycle)
//!
//! `garbigo-auth` owns the account identity lifecycle for the Garbigo
//! platform: signup, email verification, password login, password reset and
//! change, session issuance with refresh rotation, forced logout, and the
//! administrative status/role changes that sit around them.
//!
//! ## Accounts
//!
//! Accounts start `PENDING` and become `ACTIVE` once their email is verified.
//! Administrators may move them between `ACTIVE`, `SUSPENDED`, `BLOCKED` and
//! `DEACTIVATED`; archival is a separate flag that hides an account from
//! default listings without touching its status.
//!
//! ## Tokens
//!
//! - **Single-use tokens** (email verification, password reset) are opaque
//!   256-bit secrets. Only their SHA-256 is stored and each one can be spent
//!   exactly once.
//! - **Session tokens** (access, refresh) are HS256-signed and verified without
//!   a lookup, apart from the revocation list and the per-account session
//!   epoch used for forced logout.
//!
//! ## Embedding
//!
//! [`auth::AuthCore`] is transport-agnostic. Controllers resolve the client
//! address, pass a [`auth::RequestContext`] or the caller's access token, and
//! map [`auth::AuthError`] onto their own responses. Storage, email delivery,
//! time and entropy are injected through traits.

pub mod auth;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
