//! Account lifecycle rules and role capabilities.
//!
//! Flow Overview:
//! - Signup creates `PENDING` accounts.
//! - Consuming an email verification token moves `PENDING` to `ACTIVE`.
//! - Administrators move accounts between `ACTIVE`, `SUSPENDED`, `BLOCKED`
//!   and `DEACTIVATED`; leaving `BLOCKED` requires an explicit reactivation.
//! - Archival is a separate flag and never changes the status.
//!
//! Everything here is pure; callers persist the resulting record.

use chrono::{DateTime, Utc};

use super::account::{Account, AccountStatus, Role};
use super::error::AuthError;

/// Actions gated by role. Evaluated by the caller against verified claims.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    ManageOwnCredentials,
    ViewAccounts,
    ChangeAccountStatus,
    ArchiveAccounts,
    AssignRoles,
    DeleteAccounts,
}

const ADMIN_CAPABILITIES: &[Capability] = &[
    Capability::ManageOwnCredentials,
    Capability::ViewAccounts,
    Capability::ChangeAccountStatus,
    Capability::ArchiveAccounts,
    Capability::AssignRoles,
    Capability::DeleteAccounts,
];

const OPERATIONS_CAPABILITIES: &[Capability] = &[
    Capability::ManageOwnCredentials,
    Capability::ViewAccounts,
    Capability::ChangeAccountStatus,
    Capability::ArchiveAccounts,
];

const STAFF_CAPABILITIES: &[Capability] =
    &[Capability::ManageOwnCredentials, Capability::ViewAccounts];

const END_USER_CAPABILITIES: &[Capability] = &[Capability::ManageOwnCredentials];

#[must_use]
pub fn capabilities(role: Role) -> &'static [Capability] {
    match role {
        Role::Admin => ADMIN_CAPABILITIES,
        Role::Operations => OPERATIONS_CAPABILITIES,
        Role::Support | Role::Finance => STAFF_CAPABILITIES,
        Role::Client | Role::Collector => END_USER_CAPABILITIES,
    }
}

#[must_use]
pub fn permits(role: Role, capability: Capability) -> bool {
    capabilities(role).contains(&capability)
}

/// # Errors
/// Returns `AuthError::Forbidden` when `role` lacks `capability`.
pub fn require(role: Role, capability: Capability) -> Result<(), AuthError> {
    if permits(role, capability) {
        Ok(())
    } else {
        Err(AuthError::Forbidden)
    }
}

/// Only `ACTIVE` accounts may receive a session.
#[must_use]
pub fn is_login_eligible(account: &Account) -> bool {
    account.status == AccountStatus::Active
}

/// # Errors
/// Returns `AuthError::AccountNotEligible` carrying the current status.
pub fn ensure_login_eligible(account: &Account) -> Result<(), AuthError> {
    if is_login_eligible(account) {
        Ok(())
    } else {
        Err(AuthError::AccountNotEligible(account.status))
    }
}

/// Who is asking for a status change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionOrigin {
    /// Ordinary administrative status change.
    Administrative,
    /// Explicit reactivation, the only way out of `BLOCKED`.
    Reactivation,
}

/// Validate a status change and return the resulting status.
///
/// # Errors
/// Returns `AuthError::AccountNotEligible` with the current status when the
/// transition is not allowed.
pub fn transition(
    from: AccountStatus,
    to: AccountStatus,
    origin: TransitionOrigin,
) -> Result<AccountStatus, AuthError> {
    match origin {
        TransitionOrigin::Administrative => {
            if from == to {
                return Ok(to);
            }
            match (from, to) {
                // PENDING is only ever the initial state.
                (_, AccountStatus::Pending) => Err(AuthError::AccountNotEligible(from)),
                (AccountStatus::Blocked, _) => Err(AuthError::AccountNotEligible(from)),
                // Activation of an unverified account goes through email verification.
                (AccountStatus::Pending, AccountStatus::Active) => {
                    Err(AuthError::AccountNotEligible(from))
                }
                _ => Ok(to),
            }
        }
        TransitionOrigin::Reactivation => match (from, to) {
            (
                AccountStatus::Suspended | AccountStatus::Blocked | AccountStatus::Deactivated,
                AccountStatus::Active | AccountStatus::Pending,
            ) => Ok(to),
            _ => Err(AuthError::AccountNotEligible(from)),
        },
    }
}

/// Status a reactivated account lands in: unverified accounts go back to
/// `PENDING` so they still have to verify their email.
#[must_use]
pub fn reactivation_target(account: &Account) -> AccountStatus {
    if account.email_verified {
        AccountStatus::Active
    } else {
        AccountStatus::Pending
    }
}

/// Apply a successful email verification.
///
/// `PENDING` becomes `ACTIVE`; administrative states keep their status and
/// only record the verified address.
pub fn apply_email_verified(account: &mut Account, now: DateTime<Utc>) {
    account.email_verified = true;
    if account.status == AccountStatus::Pending {
        account.status = AccountStatus::Active;
    }
    account.updated_at = now;
}

/// Apply a validated status change.
///
/// An account that never verified its email cannot become `ACTIVE` by any
/// route, however many intermediate states it passes through.
///
/// # Errors
/// Propagates the rejection from [`transition`], and returns
/// `AuthError::AccountNotEligible` for activation of an unverified account.
pub fn apply_transition(
    account: &mut Account,
    to: AccountStatus,
    origin: TransitionOrigin,
    now: DateTime<Utc>,
) -> Result<(), AuthError> {
    let next = transition(account.status, to, origin)?;
    if next == AccountStatus::Active && !account.email_verified {
        return Err(AuthError::AccountNotEligible(account.status));
    }
    if next != account.status {
        account.status = next;
        account.updated_at = now;
    }
    Ok(())
}

pub fn set_archived(account: &mut Account, archived: bool, now: DateTime<Utc>) {
    if account.archived != archived {
        account.archived = archived;
        account.updated_at = now;
    }
}

/// Statuses whose entry forces every outstanding session to end.
#[must_use]
pub fn revokes_sessions(status: AccountStatus) -> bool {
    matches!(
        status,
        AccountStatus::Suspended | AccountStatus::Blocked | AccountStatus::Deactivated
    )
}
