//! Request/response value objects for the auth core.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

use super::account::{AccountSummary, Role};
use super::tokens::Session;

#[derive(Deserialize, Debug)]
pub struct SignupRequest {
    pub email: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    pub password: SecretString,
    pub role: Role,
}

#[derive(Deserialize, Debug)]
pub struct LoginRequest {
    /// Email or username.
    pub identifier: String,
    pub password: SecretString,
}

/// Caller metadata resolved at the transport boundary.
///
/// `client_ip` must already be resolved with
/// [`resolve_client_ip`](super::utils::resolve_client_ip); the core never
/// reads forwarding headers itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub client_ip: Option<IpAddr>,
}

impl RequestContext {
    #[must_use]
    pub fn from_ip(client_ip: IpAddr) -> Self {
        Self {
            client_ip: Some(client_ip),
        }
    }
}

/// Signup never yields a session; the address has to be verified first.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignupOutcome {
    pub account_id: Uuid,
    pub verification_required: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub account: AccountSummary,
    pub session: Session,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use secrecy::ExposeSecret;
    use serde_json::json;

    #[test]
    fn signup_request_parses_optional_fields() -> Result<()> {
        let request: SignupRequest = serde_json::from_value(json!({
            "email": "a@x.com",
            "password": "Str0ng!Pass",
            "role": "COLLECTOR"
        }))?;
        assert_eq!(request.role, Role::Collector);
        assert!(request.username.is_none());
        assert_eq!(request.password.expose_secret(), "Str0ng!Pass");
        Ok(())
    }

    #[test]
    fn login_request_debug_hides_password() -> Result<()> {
        let request: LoginRequest = serde_json::from_value(json!({
            "identifier": "alice",
            "password": "Str0ng!Pass"
        }))?;
        assert!(!format!("{request:?}").contains("Str0ng!Pass"));
        Ok(())
    }

    #[test]
    fn signup_outcome_serializes() -> Result<()> {
        let outcome = SignupOutcome {
            account_id: Uuid::nil(),
            verification_required: true,
        };
        let value = serde_json::to_value(outcome)?;
        assert_eq!(value["verification_required"], json!(true));
        Ok(())
    }
}
