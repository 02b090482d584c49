//! Periodic expiry sweep.
//!
//! Deletes consumed or expired single-use tokens, revocation entries whose
//! tokens expired on their own, and stale rate-limit counters. Nothing depends
//! on the sweep for correctness; it only keeps the tables small.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

use super::clock::Clock;
use super::storage::{CounterStore, TokenRepository};

/// Rows removed by one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub tokens: u64,
    pub revocations: u64,
    pub counters: u64,
}

impl SweepReport {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.tokens + self.revocations + self.counters
    }
}

/// Run one sweep pass as of `now`.
///
/// # Errors
/// Returns the first storage error encountered.
pub async fn purge_expired(
    tokens: &dyn TokenRepository,
    counters: Option<&dyn CounterStore>,
    now: DateTime<Utc>,
) -> Result<SweepReport> {
    let mut report = SweepReport {
        tokens: tokens.purge_tokens(now).await?,
        revocations: tokens.purge_revocations(now).await?,
        counters: 0,
    };
    if let Some(counters) = counters {
        report.counters = counters.purge_expired(now).await?;
    }
    Ok(report)
}

#[derive(Clone)]
pub struct Sweeper {
    tokens: Arc<dyn TokenRepository>,
    counters: Option<Arc<dyn CounterStore>>,
    clock: Arc<dyn Clock>,
}

impl Sweeper {
    #[must_use]
    pub fn new(
        tokens: Arc<dyn TokenRepository>,
        counters: Option<Arc<dyn CounterStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tokens,
            counters,
            clock,
        }
    }

    /// # Errors
    /// Returns the first storage error encountered.
    pub async fn run_once(&self) -> Result<SweepReport> {
        purge_expired(
            self.tokens.as_ref(),
            self.counters.as_deref(),
            self.clock.now(),
        )
        .await
    }
}

/// Spawn a background task that sweeps on a fixed cadence.
pub fn spawn_expiry_sweeper(sweeper: Sweeper, interval: Duration) -> tokio::task::JoinHandle<()> {
    let interval = if interval.is_zero() {
        Duration::from_secs(1)
    } else {
        interval
    };
    tokio::spawn(async move {
        loop {
            match sweeper.run_once().await {
                Ok(report) if report.total() > 0 => info!(
                    tokens = report.tokens,
                    revocations = report.revocations,
                    counters = report.counters,
                    "expiry sweep removed rows"
                ),
                Ok(_) => {}
                Err(err) => error!("expiry sweep failed: {err:#}"),
            }

            sleep(interval).await;
        }
    })
}
