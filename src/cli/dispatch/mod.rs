//! Map parsed CLI arguments to an [`Action`].

use crate::cli::actions::{Action, hash_password, sweep};
use crate::cli::commands::{ARG_DSN, ARG_INTERVAL, ARG_ONCE, CMD_HASH_PASSWORD, CMD_SWEEP};
use anyhow::{Context, Result, bail};
use std::time::Duration;

/// # Errors
/// Returns an error if the subcommand is unknown or a required argument is missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    match matches.subcommand() {
        Some((CMD_SWEEP, sub_m)) => {
            let dsn = sub_m
                .get_one::<String>(ARG_DSN)
                .cloned()
                .context("missing required argument: --dsn")?;
            let interval = sub_m
                .get_one::<u64>(ARG_INTERVAL)
                .copied()
                .context("missing required argument: --interval")?;
            Ok(Action::Sweep(sweep::Args {
                dsn,
                interval: Duration::from_secs(interval),
                once: sub_m.get_flag(ARG_ONCE),
            }))
        }
        Some((CMD_HASH_PASSWORD, _)) => Ok(Action::HashPassword(hash_password::Args::default())),
        Some((other, _)) => bail!("unknown subcommand: {other}"),
        None => bail!("a subcommand is required"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;

    #[test]
    fn sweep_action_from_args() -> Result<()> {
        let matches = commands::new().try_get_matches_from(vec![
            "garbigo-auth",
            "sweep",
            "--dsn",
            "postgres://localhost/garbigo",
            "--interval",
            "30",
        ])?;
        let Action::Sweep(args) = handler(&matches)? else {
            bail!("expected a sweep action");
        };
        assert_eq!(args.dsn, "postgres://localhost/garbigo");
        assert_eq!(args.interval, Duration::from_secs(30));
        assert!(!args.once);
        Ok(())
    }

    #[test]
    fn hash_password_action_from_args() -> Result<()> {
        let matches = commands::new().try_get_matches_from(vec!["garbigo-auth", "hash-password"])?;
        assert!(matches!(handler(&matches)?, Action::HashPassword(_)));
        Ok(())
    }
}
