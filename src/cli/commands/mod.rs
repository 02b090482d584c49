pub mod logging;

use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub const CMD_SWEEP: &str = "sweep";
pub const CMD_HASH_PASSWORD: &str = "hash-password";

pub const ARG_DSN: &str = "dsn";
pub const ARG_INTERVAL: &str = "interval";
pub const ARG_ONCE: &str = "once";

const DEFAULT_SWEEP_INTERVAL_SECONDS: &str = "300";

fn sweep_command() -> Command {
    Command::new(CMD_SWEEP)
        .about("Purge spent tokens, expired revocations and stale rate-limit counters")
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long("dsn")
                .help("Database connection string")
                .env("GARBIGO_AUTH_DSN")
                .required(true),
        )
        .arg(
            Arg::new(ARG_INTERVAL)
                .long("interval")
                .help("Seconds between sweeps")
                .env("GARBIGO_AUTH_SWEEP_INTERVAL")
                .default_value(DEFAULT_SWEEP_INTERVAL_SECONDS)
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_ONCE)
                .long("once")
                .help("Run a single sweep and exit")
                .action(ArgAction::SetTrue),
        )
}

fn hash_password_command() -> Command {
    Command::new(CMD_HASH_PASSWORD)
        .about("Read a password from stdin and print its Argon2id hash")
}

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("garbigo-auth")
        .about("Garbigo account credential and session lifecycle")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(sweep_command())
        .subcommand(hash_password_command());

    logging::with_args(command)
}
