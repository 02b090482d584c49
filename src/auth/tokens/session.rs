//! HS256 session tokens (JWT compact form).
//!
//! The signer keeps a keyed HMAC state, never the raw key. Verification
//! compares tags in constant time and rejects anything that is not exactly
//! `header.claims.signature` with the expected algorithm, version, issuer,
//! kind and an `exp` in the future.

use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use super::TokenKind;
use crate::auth::account::Role;

pub const TOKEN_VERSION: u8 = 1;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct SessionTokenHeader {
    alg: String,
    typ: String,
}

impl SessionTokenHeader {
    fn hs256() -> Self {
        Self {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        }
    }
}

/// Claims carried by access and refresh tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    pub v: u8,
    pub iss: String,
    pub sub: Uuid,
    pub role: Role,
    pub kind: TokenKind,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    /// Session epoch of the subject at issue time.
    pub sev: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json,
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("invalid signing key")]
    Key,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid token version")]
    InvalidVersion,
    #[error("unexpected token kind: {0}")]
    KindMismatch(TokenKind),
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, Error> {
    let json = serde_json::to_vec(value).map_err(|_| Error::Json)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, Error> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| Error::Base64)?;
    serde_json::from_slice(&bytes).map_err(|_| Error::Json)
}

#[derive(Clone)]
pub(crate) struct SessionSigner {
    mac: HmacSha256,
}

impl SessionSigner {
    pub(crate) fn new(key: &[u8]) -> Result<Self, Error> {
        let mac = HmacSha256::new_from_slice(key).map_err(|_| Error::Key)?;
        Ok(Self { mac })
    }

    pub(crate) fn sign(&self, claims: &SessionClaims) -> Result<String, Error> {
        let header_b64 = b64e_json(&SessionTokenHeader::hs256())?;
        let claims_b64 = b64e_json(claims)?;
        let signing_input = format!("{header_b64}.{claims_b64}");

        let mut mac = self.mac.clone();
        mac.update(signing_input.as_bytes());
        let signature_b64 = Base64UrlUnpadded::encode_string(&mac.finalize().into_bytes());

        Ok(format!("{signing_input}.{signature_b64}"))
    }

    /// Check structure, signature and issuer only. Expiry and kind are left
    /// to the caller so expired tokens can still be inspected for logout.
    pub(crate) fn decode(&self, token: &str, expected_issuer: &str) -> Result<SessionClaims, Error> {
        let mut parts = token.split('.');
        let header_b64 = parts.next().ok_or(Error::TokenFormat)?;
        let claims_b64 = parts.next().ok_or(Error::TokenFormat)?;
        let sig_b64 = parts.next().ok_or(Error::TokenFormat)?;
        if parts.next().is_some() {
            return Err(Error::TokenFormat);
        }

        let header: SessionTokenHeader = b64d_json(header_b64)?;
        if header.alg != "HS256" {
            return Err(Error::UnsupportedAlg(header.alg));
        }

        let signature = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| Error::Base64)?;
        let mut mac = self.mac.clone();
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| Error::InvalidSignature)?;

        let claims: SessionClaims = b64d_json(claims_b64)?;
        if claims.v != TOKEN_VERSION {
            return Err(Error::InvalidVersion);
        }
        if claims.iss != expected_issuer {
            return Err(Error::InvalidIssuer);
        }
        Ok(claims)
    }

    pub(crate) fn verify(
        &self,
        token: &str,
        expected_issuer: &str,
        expected_kind: TokenKind,
        now_unix_seconds: i64,
    ) -> Result<SessionClaims, Error> {
        let claims = self.decode(token, expected_issuer)?;
        if claims.kind != expected_kind {
            return Err(Error::KindMismatch(claims.kind));
        }
        if now_unix_seconds >= claims.exp {
            return Err(Error::Expired);
        }
        Ok(claims)
    }
}
