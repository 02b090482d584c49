use clap::{Arg, Command, builder::ValueParser};

pub const ARG_VERBOSITY: &str = "verbosity";
pub const ARG_LOG_FORMAT: &str = "log-format";

#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>() {
            if parsed <= 4 {
                return Ok(parsed);
            }
        }

        match level.to_lowercase().as_str() {
            "error" => Ok(0),
            "warn" => Ok(1),
            "info" => Ok(2),
            "debug" => Ok(3),
            "trace" => Ok(4),
            _ => Err("invalid log level".to_string()),
        }
    })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_VERBOSITY)
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
                .env("GARBIGO_AUTH_LOG_LEVEL")
                .global(true)
                .action(clap::ArgAction::Count)
                .value_parser(validator_log_level()),
        )
        .arg(
            Arg::new(ARG_LOG_FORMAT)
                .long("log-format")
                .help("Log output format")
                .env("GARBIGO_AUTH_LOG_FORMAT")
                .global(true)
                .default_value("pretty")
                .value_parser(["pretty", "json"]),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> Command {
        with_args(Command::new("garbigo-auth"))
    }

    #[test]
    fn log_level_names_and_numbers() {
        for (index, level) in ["error", "warn", "info", "debug", "trace"]
            .iter()
            .enumerate()
        {
            temp_env::with_vars([("GARBIGO_AUTH_LOG_LEVEL", Some(*level))], || {
                let matches = command().get_matches_from(vec!["garbigo-auth"]);
                assert_eq!(
                    matches.get_one::<u8>(ARG_VERBOSITY).copied(),
                    u8::try_from(index).ok()
                );
            });
        }

        temp_env::with_vars([("GARBIGO_AUTH_LOG_LEVEL", Some("3"))], || {
            let matches = command().get_matches_from(vec!["garbigo-auth"]);
            assert_eq!(matches.get_one::<u8>(ARG_VERBOSITY).copied(), Some(3));
        });
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        temp_env::with_vars([("GARBIGO_AUTH_LOG_LEVEL", Some("loud"))], || {
            assert!(command().try_get_matches_from(vec!["garbigo-auth"]).is_err());
        });
    }

    #[test]
    fn verbosity_counts_flags() {
        temp_env::with_vars([("GARBIGO_AUTH_LOG_LEVEL", None::<&str>)], || {
            let matches = command().get_matches_from(vec!["garbigo-auth", "-vv"]);
            assert_eq!(matches.get_one::<u8>(ARG_VERBOSITY).copied(), Some(2));
        });
    }

    #[test]
    fn log_format_defaults_to_pretty() {
        temp_env::with_vars([("GARBIGO_AUTH_LOG_FORMAT", None::<&str>)], || {
            let matches = command().get_matches_from(vec!["garbigo-auth"]);
            assert_eq!(
                matches.get_one::<String>(ARG_LOG_FORMAT).map(String::as_str),
                Some("pretty")
            );

            let matches =
                command().get_matches_from(vec!["garbigo-auth", "--log-format", "json"]);
            assert_eq!(
                matches.get_one::<String>(ARG_LOG_FORMAT).map(String::as_str),
                Some("json")
            );
        });
    }
}
