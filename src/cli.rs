//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::humantime_serde::parse_duration;

/// Inspect, validate and enroll the configured trust provider
#[derive(Parser, Debug)]
#[command(name = "trustctl")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TRUST_PROVIDER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "TRUST_PROVIDER_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TRUST_PROVIDER_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the provider kind, identity and caller name
    Identity,

    /// Check the configured material and list every problem found
    Validate,

    /// Obtain a signed certificate from the configured CA
    Enroll {
        /// Give up after this long (e.g. 30s, 5m); defaults to enrollment.max_wait
        #[arg(long, value_parser = parse_max_wait)]
        max_wait: Option<Duration>,
    },

    /// Verify a PEM certificate against the configured CA
    Verify {
        /// PEM certificate, optionally followed by intermediates
        #[arg(required = true)]
        certificate: PathBuf,

        /// Name the certificate must be valid for
        #[arg(short, long, default_value = "")]
        name: String,
    },
}

fn parse_max_wait(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| format!("invalid duration '{s}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enroll_with_max_wait() {
        let cli = Cli::try_parse_from([
            "trustctl",
            "--log-level",
            "debug",
            "enroll",
            "--max-wait",
            "5m",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(
            cli.command,
            Command::Enroll { max_wait: Some(d) } if d == Duration::from_secs(300)
        ));
    }

    #[test]
    fn verify_name_defaults_to_chain_only() {
        let cli = Cli::try_parse_from(["trustctl", "verify", "peer.pem"]).unwrap();
        match cli.command {
            Command::Verify { certificate, name } => {
                assert_eq!(certificate, PathBuf::from("peer.pem"));
                assert_eq!(name, "");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_duration() {
        assert!(Cli::try_parse_from(["trustctl", "enroll", "--max-wait", "soon"]).is_err());
    }

    #[test]
    fn config_is_global() {
        let cli =
            Cli::try_parse_from(["trustctl", "validate", "--config", "/etc/trust.yaml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/trust.yaml")));
    }
}
