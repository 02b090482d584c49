//! Small helpers for input normalization, validation, and secret hashing.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::net::IpAddr;

/// Normalize an email for lookup/uniqueness checks.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Usernames share the email's case folding so `Alice` and `alice` collide.
pub(crate) fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

/// Phones are compared without separators.
pub(crate) fn normalize_phone(phone: &str) -> String {
    phone
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect()
}

/// Basic email format check on already-normalized input.
pub(crate) fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

pub(crate) fn valid_username(username_normalized: &str) -> bool {
    Regex::new(r"^[a-z0-9_.-]{3,20}$").is_ok_and(|regex| regex.is_match(username_normalized))
}

pub(crate) fn valid_phone(phone_normalized: &str) -> bool {
    Regex::new(r"^\+?[0-9]{10,15}$").is_ok_and(|regex| regex.is_match(phone_normalized))
}

/// Hash a token secret so we never store the raw value.
pub(crate) fn hash_secret(secret: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().to_vec()
}

/// Build the frontend link included in outbound emails.
///
/// The token travels in the fragment so it never reaches server access logs.
pub(crate) fn build_action_url(frontend_base_url: &str, path: &str, token: &str) -> String {
    let base = frontend_base_url.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}#token={token}")
}

/// Resolve the client address used as a rate-limit identifier.
///
/// `X-Forwarded-For` is only honored when the direct peer is a trusted
/// proxy. The chain is walked right to left, skipping trusted hops, and the
/// first untrusted address wins. Anything unparseable stops the walk.
#[must_use]
pub fn resolve_client_ip(
    peer: IpAddr,
    forwarded_for: Option<&str>,
    trusted_proxies: &[IpAddr],
) -> IpAddr {
    if !trusted_proxies.contains(&peer) {
        return peer;
    }
    let Some(chain) = forwarded_for else {
        return peer;
    };

    let mut resolved = peer;
    for hop in chain.rsplit(',') {
        let Ok(addr) = hop.trim().parse::<IpAddr>() else {
            break;
        };
        resolved = addr;
        if !trusted_proxies.contains(&addr) {
            break;
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email(" Alice@Example.COM "), "alice@example.com");
        assert_eq!(normalize_username(" Alice_01 "), "alice_01");
    }

    #[test]
    fn normalize_phone_strips_separators() {
        assert_eq!(normalize_phone(" +254 (712) 345-678 "), "+254712345678");
    }

    #[test]
    fn valid_email_accepts_basic_format() {
        assert!(valid_email("a@example.com"));
        assert!(valid_email("name.surname@example.co"));
        assert!(!valid_email("not-an-email"));
        assert!(!valid_email("missing-domain@"));
    }

    #[test]
    fn valid_username_enforces_length_and_charset() {
        assert!(valid_username("collector_7"));
        assert!(!valid_username("ab"));
        assert!(!valid_username("has space"));
        assert!(!valid_username("a".repeat(21).as_str()));
    }

    #[test]
    fn valid_phone_accepts_international_digits() {
        assert!(valid_phone("+254712345678"));
        assert!(valid_phone("0712345678"));
        assert!(!valid_phone("12345"));
        assert!(!valid_phone("+2547abc45678"));
    }

    #[test]
    fn hash_secret_stable() {
        let first = hash_secret("token");
        assert_eq!(first, hash_secret("token"));
        assert_ne!(first, hash_secret("other"));
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn build_action_url_trims_slashes() {
        assert_eq!(
            build_action_url("https://garbigo.com/", "/verify-email", "abc"),
            "https://garbigo.com/verify-email#token=abc"
        );
    }

    #[test]
    fn forwarded_for_ignored_from_untrusted_peer() {
        let peer = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
        let resolved = resolve_client_ip(peer, Some("1.2.3.4"), &[]);
        assert_eq!(resolved, peer);
    }

    #[test]
    fn forwarded_for_walks_past_trusted_hops() {
        let proxy = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let inner = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let resolved = resolve_client_ip(
            proxy,
            Some("6.6.6.6, 198.51.100.7, 10.0.0.2"),
            &[proxy, inner],
        );
        assert_eq!(resolved, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)));
    }

    #[test]
    fn forwarded_for_garbage_falls_back() {
        let proxy = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(resolve_client_ip(proxy, Some("unknown"), &[proxy]), proxy);
        assert_eq!(resolve_client_ip(proxy, None, &[proxy]), proxy);
    }
}
