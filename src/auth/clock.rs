//! Injected time and entropy.
//!
//! Every component reads the wall clock and draws random bytes through these
//! traits so tests can pin both. Identifiers and secrets are derived here.

use anyhow::{Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use rand::{RngCore, SeedableRng, rngs::OsRng};
use rand_chacha::ChaCha20Rng;
use std::sync::{Mutex, PoisonError};
use ulid::Ulid;
use uuid::Uuid;

/// Bytes of entropy behind every single-use token secret (256 bits).
pub const SECRET_BYTES: usize = 32;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub trait RandomSource: Send + Sync {
    /// Fill `dest` with unpredictable bytes.
    ///
    /// # Errors
    /// Returns an error if the entropy source is unavailable.
    fn fill(&self, dest: &mut [u8]) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&self, dest: &mut [u8]) -> Result<()> {
        OsRng
            .try_fill_bytes(dest)
            .context("failed to read from the OS entropy source")
    }
}

/// A clock that only moves when told to. Used by tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deterministic entropy from a fixed `ChaCha20` seed.
pub struct SeededRandom {
    rng: Mutex<ChaCha20Rng>,
}

impl SeededRandom {
    #[must_use]
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::from_seed(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn fill(&self, dest: &mut [u8]) -> Result<()> {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fill_bytes(dest);
        Ok(())
    }
}

/// Random (v4) identifier for accounts and token records.
///
/// # Errors
/// Returns an error if the entropy source fails.
pub fn new_uuid(random: &dyn RandomSource) -> Result<Uuid> {
    let mut bytes = [0u8; 16];
    random.fill(&mut bytes)?;
    Ok(uuid::Builder::from_random_bytes(bytes).into_uuid())
}

/// Opaque, URL-safe secret for single-use tokens.
///
/// The raw value only ever leaves through the email collaborator; storage
/// keeps a hash of it.
///
/// # Errors
/// Returns an error if the entropy source fails.
pub fn new_secret(random: &dyn RandomSource) -> Result<String> {
    let mut bytes = [0u8; SECRET_BYTES];
    random
        .fill(&mut bytes)
        .context("failed to generate token secret")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Sortable unique identifier for signed session tokens (`jti`).
///
/// # Errors
/// Returns an error if the entropy source fails.
pub fn new_token_id(clock: &dyn Clock, random: &dyn RandomSource) -> Result<String> {
    let mut bytes = [0u8; 16];
    random.fill(&mut bytes)?;
    let millis = u64::try_from(clock.now().timestamp_millis()).unwrap_or(0);
    Ok(Ulid::from_parts(millis, u128::from_be_bytes(bytes)).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances_only_on_request() {
        let start = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_default();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), start + Duration::seconds(90));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn seeded_random_is_reproducible() -> Result<()> {
        let first = SeededRandom::from_seed([9u8; 32]);
        let second = SeededRandom::from_seed([9u8; 32]);
        assert_eq!(new_secret(&first)?, new_secret(&second)?);
        assert_eq!(new_uuid(&first)?, new_uuid(&second)?);
        Ok(())
    }

    #[test]
    fn secrets_carry_256_bits() -> Result<()> {
        let secret = new_secret(&OsRandom)?;
        let decoded = Base64UrlUnpadded::decode_vec(&secret).ok().map(|b| b.len());
        assert_eq!(decoded, Some(SECRET_BYTES));
        assert_ne!(secret, new_secret(&OsRandom)?);
        Ok(())
    }

    #[test]
    fn uuids_are_version_four() -> Result<()> {
        let id = new_uuid(&SeededRandom::from_seed([1u8; 32]))?;
        assert_eq!(id.get_version_num(), 4);
        Ok(())
    }

    #[test]
    fn token_ids_parse_as_ulids() -> Result<()> {
        let clock = SystemClock;
        let id = new_token_id(&clock, &OsRandom)?;
        assert!(Ulid::from_string(&id).is_ok());
        Ok(())
    }
}
