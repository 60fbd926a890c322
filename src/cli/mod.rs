pub mod app;

use chrono::NaiveDate;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tender_lifecycle::{ContractId, Registry};

/// Moves tender contracts between lifecycle stage tables.
#[derive(Debug, Parser)]
#[command(name = "tender-migrate", version, about)]
pub struct Cli {
    /// JSON config file, overlaid by `TENDER_*` environment variables.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, value_name = "URL")]
    pub database_url: Option<String>,

    /// Work on a MessagePack snapshot instead of PostgreSQL. The snapshot is
    /// rewritten after a run.
    #[arg(long, global = true, value_name = "PATH")]
    pub memory_store: Option<PathBuf>,

    /// More log output (-v debug, -vv trace). `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Snapshot if due, then run every transition pass.
    Run {
        #[arg(long)]
        force_backup: bool,

        #[arg(long, conflicts_with = "force_backup")]
        skip_backup: bool,

        /// Evaluate date rules as of this day (YYYY-MM-DD).
        #[arg(long)]
        today: Option<NaiveDate>,

        #[arg(long)]
        registry: Option<Registry>,
    },
    /// Count candidates per pass without writing.
    Plan {
        #[arg(long)]
        today: Option<NaiveDate>,

        #[arg(long)]
        registry: Option<Registry>,
    },
    /// Take a snapshot now if one is due.
    Backup {
        #[arg(long)]
        force: bool,
    },
    /// Print the stage table currently holding a contract.
    Locate {
        #[arg(long)]
        registry: Registry,

        #[arg(long)]
        id: ContractId,
    },
}
