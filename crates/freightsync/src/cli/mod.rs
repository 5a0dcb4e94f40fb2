//! Command-line interface for freightsync.
//!
//! This module provides the CLI structure for the `freightsync` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    AuthCommand, CompanyCommand, ConfigCommand, ListCommand, OfflineCommand, PageCommand,
    QueueCommand, RouteCommand, StatusArg, StatusCommand, SyncCommand,
};

use crate::logging::Verbosity;

/// freightsync - Offline-first route and fuel logging
///
/// Records route pages and routes locally and delivers them to the server
/// whenever a connection is available.
#[derive(Debug, Parser)]
#[command(name = "freightsync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show network, queue and session status
    Status(StatusCommand),

    /// Deliver queued operations
    #[command(subcommand)]
    Sync(SyncCommand),

    /// Inspect and maintain the operation queue
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Refresh locally mirrored data from the server
    Download,

    /// Control forced offline mode
    #[command(subcommand)]
    Offline(OfflineCommand),

    /// Sign in, sign out and manage the session
    #[command(subcommand)]
    Auth(AuthCommand),

    /// Look up companies
    #[command(subcommand)]
    Company(CompanyCommand),

    /// Trucks
    #[command(subcommand)]
    Trucks(ListCommand),

    /// Pickup and drop-off locations
    #[command(subcommand)]
    Objects(ListCommand),

    /// Route pages
    #[command(subcommand)]
    Pages(PageCommand),

    /// Routes
    #[command(subcommand)]
    Routes(RouteCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.quiet, self.verbose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn status_cli(quiet: bool, verbose: u8) -> Cli {
        Cli {
            config: None,
            verbose,
            quiet,
            command: Command::Status(StatusCommand { json: false }),
        }
    }

    #[test]
    fn test_cli_name() {
        let cli = Cli::command();
        assert_eq!(cli.get_name(), "freightsync");
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(status_cli(true, 0).verbosity(), Verbosity::Quiet);
        assert_eq!(status_cli(false, 0).verbosity(), Verbosity::Normal);
        assert_eq!(status_cli(false, 1).verbosity(), Verbosity::Verbose);
        assert_eq!(status_cli(false, 2).verbosity(), Verbosity::Trace);
        assert_eq!(status_cli(true, 2).verbosity(), Verbosity::Quiet);
    }

    #[test]
    fn test_cli_verify() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_sync_run_once() {
        let cli = Cli::try_parse_from(["freightsync", "sync", "run", "--once"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Sync(SyncCommand::Run { once: true })
        ));
    }

    #[test]
    fn test_parse_queue_list_filter() {
        let cli = Cli::try_parse_from([
            "freightsync",
            "queue",
            "list",
            "--status",
            "failed",
            "--limit",
            "5",
        ])
        .unwrap();
        match cli.command {
            Command::Queue(QueueCommand::List { status, limit, json }) => {
                assert_eq!(status, Some(StatusArg::Failed));
                assert_eq!(limit, 5);
                assert!(!json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_offline_on() {
        let cli = Cli::try_parse_from(["freightsync", "offline", "on"]).unwrap();
        assert!(matches!(cli.command, Command::Offline(OfflineCommand::On)));
    }

    #[test]
    fn test_parse_page_create_dates() {
        let cli = Cli::try_parse_from([
            "freightsync",
            "pages",
            "create",
            "--truck",
            "3",
            "--from",
            "2024-03-01",
            "--to",
            "2024-03-31",
            "--fuel",
            "120.5",
        ])
        .unwrap();
        match cli.command {
            Command::Pages(PageCommand::Create { truck, from, fuel, odometer, .. }) => {
                assert_eq!(truck, "3");
                assert_eq!(from.to_string(), "2024-03-01");
                assert!((fuel - 120.5).abs() < f64::EPSILON);
                assert!(odometer.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_bad_date() {
        let result = Cli::try_parse_from([
            "freightsync",
            "pages",
            "create",
            "--truck",
            "3",
            "--from",
            "March",
            "--to",
            "2024-03-31",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_route_finish() {
        let cli = Cli::try_parse_from([
            "freightsync",
            "routes",
            "finish",
            "tmp-1",
            "--odometer",
            "1500",
            "--fuel-consumed",
            "40",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Routes(RouteCommand::Finish { odometer: 1500, .. })
        ));
    }

    #[test]
    fn test_parse_with_config() {
        let cli = Cli::try_parse_from(["freightsync", "-c", "/custom/config.toml", "download"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/custom/config.toml")));
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["freightsync", "status", "-v", "-q"]).unwrap();
        assert_eq!(cli.verbose, 1);
        assert!(cli.quiet);
    }
}
