//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Subcommand, ValueEnum};

use crate::model::OperationStatus;

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Sync commands.
#[derive(Debug, Subcommand)]
pub enum SyncCommand {
    /// Run the sync worker until interrupted
    Run {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
}

/// Queue inspection and maintenance commands.
#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// Show operation counts
    Stats {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// List queued operations
    List {
        /// Only show operations in this state
        #[arg(short, long, value_enum)]
        status: Option<StatusArg>,

        /// Maximum number of operations
        #[arg(short, long, default_value = "50")]
        limit: usize,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Re-arm failed operations
    Retry,

    /// Delete completed operations older than the retention window
    Purge {
        /// Retention in hours (defaults to sync.completed_retention_hours)
        #[arg(long)]
        hours: Option<u64>,
    },
}

/// Forced offline mode commands.
#[derive(Debug, Subcommand)]
pub enum OfflineCommand {
    /// Stop all network use
    On,
    /// Resume network use
    Off,
    /// Show the current network state
    Status,
}

/// Authentication commands.
#[derive(Debug, Subcommand)]
pub enum AuthCommand {
    /// Sign in
    Login {
        /// Account email
        #[arg(short, long)]
        email: String,

        /// Account password
        #[arg(short, long)]
        password: String,
    },

    /// Create an account
    Register {
        /// Account email
        #[arg(short, long)]
        email: String,

        /// Account password
        #[arg(short, long)]
        password: String,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,

        /// Company code to join
        #[arg(long)]
        company: String,
    },

    /// Renew the access token
    Refresh,

    /// Sign out and forget the session
    Logout,

    /// Show the signed-in user
    Whoami,
}

/// Company commands.
#[derive(Debug, Subcommand)]
pub enum CompanyCommand {
    /// Check whether a company code exists
    Check {
        /// Company code
        code: String,
    },
}

/// Reference data commands.
#[derive(Debug, Subcommand)]
pub enum ListCommand {
    /// List entries
    List {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
}

/// Route page commands.
#[derive(Debug, Subcommand)]
pub enum PageCommand {
    /// List route pages
    List {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show one route page
    Show {
        /// Route page id
        id: String,
    },

    /// Create a route page
    Create {
        /// Truck id
        #[arg(short, long)]
        truck: String,

        /// First day covered (YYYY-MM-DD)
        #[arg(long)]
        from: NaiveDate,

        /// Last day covered (YYYY-MM-DD)
        #[arg(long)]
        to: NaiveDate,

        /// Fuel in the tank at the start
        #[arg(long, default_value = "0")]
        fuel: f64,

        /// Odometer at the start
        #[arg(long)]
        odometer: Option<i64>,
    },

    /// Delete a route page
    Delete {
        /// Route page id
        id: String,
    },
}

/// Route commands.
#[derive(Debug, Subcommand)]
pub enum RouteCommand {
    /// List routes of a page
    List {
        /// Route page id
        page: String,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Start a route
    Start {
        /// Route page id
        #[arg(short, long)]
        page: String,

        /// Odometer at departure
        #[arg(short, long)]
        odometer: i64,

        /// Origin object id
        #[arg(long)]
        from: Option<String>,

        /// Destination object id
        #[arg(long)]
        to: Option<String>,

        /// Fuel taken on at departure
        #[arg(long, default_value = "0")]
        fuel_received: f64,
    },

    /// Finish the active route
    Finish {
        /// Route id
        id: String,

        /// Odometer at arrival
        #[arg(short, long)]
        odometer: i64,

        /// Fuel used on the way
        #[arg(short, long)]
        fuel_consumed: f64,

        /// Fuel taken on during the route
        #[arg(long)]
        fuel_received: Option<f64>,

        /// Destination object id
        #[arg(long)]
        to: Option<String>,
    },

    /// Delete a route
    Delete {
        /// Route id
        id: String,
    },
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show configuration file path
    Path,

    /// Validate configuration file
    Validate {
        /// Path to config file to validate (uses default if not specified)
        file: Option<PathBuf>,
    },
}

/// Operation state filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    /// Waiting to be sent
    Pending,
    /// In flight
    Syncing,
    /// Gave up
    Failed,
    /// Delivered
    Completed,
}

impl From<StatusArg> for OperationStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => Self::Pending,
            StatusArg::Syncing => Self::Syncing,
            StatusArg::Failed => Self::Failed,
            StatusArg::Completed => Self::Completed,
        }
    }
}
