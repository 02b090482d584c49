use crate::auth::clock::SystemClock;
use crate::auth::storage::CounterStore;
use crate::auth::storage::postgres::{PgCounterStore, PgTokenRepository};
use crate::auth::sweep::{Sweeper, spawn_expiry_sweeper};
use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub dsn: String,
    pub interval: Duration,
    pub once: bool,
}

/// DSN with the password removed, safe to log.
fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<unparseable dsn>".to_string(),
    }
}

/// Execute the sweep action.
/// # Errors
/// Returns an error if the database is unreachable or a one-shot sweep fails.
pub async fn execute(args: Args) -> Result<()> {
    debug!(
        dsn = %redact_dsn(&args.dsn),
        interval = ?args.interval,
        once = args.once,
        "Sweep arguments"
    );

    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(2)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&args.dsn)
        .await
        .context("Failed to connect to database")?;

    let counters: Arc<dyn CounterStore> = Arc::new(PgCounterStore::new(pool.clone()));
    let sweeper = Sweeper::new(
        Arc::new(PgTokenRepository::new(pool.clone())),
        Some(counters),
        Arc::new(SystemClock),
    );

    if args.once {
        let report = sweeper.run_once().await.context("expiry sweep failed")?;
        println!(
            "removed {} tokens, {} revocations, {} counters",
            report.tokens, report.revocations, report.counters
        );
        pool.close().await;
        return Ok(());
    }

    info!(interval = ?args.interval, "Starting expiry sweeper");
    let handle = spawn_expiry_sweeper(sweeper, args.interval);
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down expiry sweeper");
    handle.abort();
    pool.close().await;
    Ok(())
}
