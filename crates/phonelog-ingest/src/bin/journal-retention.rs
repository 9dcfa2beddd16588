//! Journal retention utility.
//!
//! Prunes old sealed segments (delete or archive) and merges runs of small
//! sealed segments. The active segment is never touched, so this is safe
//! to run from cron next to a live server.
//!
//! # Usage
//!
//! ```bash
//! # See what would be pruned
//! journal-retention prune --journal-dir /data/wal --keep-days 7 --dry-run
//!
//! # Archive instead of deleting
//! journal-retention prune --journal-dir /data/wal --keep-days 30 --archive-dir /mnt/cold/wal
//!
//! # Merge small segments and drop the originals
//! journal-retention compact --journal-dir /data/wal --max-input-size 5000000 --delete-originals
//! ```
//!
//! Each command prints a one-line JSON report on stdout.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use phonelog_ingest::{CompactConfig, PruneConfig, compact, prune};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "journal-retention")]
#[command(about = "Prune or compact sealed journal segments")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Delete or archive segments older than the retention window
    Prune {
        /// Journal directory
        #[arg(long, env = "WAL_DIR")]
        journal_dir: PathBuf,

        /// Keep segments modified within this many days
        #[arg(long, default_value = "7")]
        keep_days: u32,

        /// Move pruned segments here instead of deleting them
        #[arg(long)]
        archive_dir: Option<PathBuf>,

        /// Only report what would be pruned
        #[arg(long)]
        dry_run: bool,
    },

    /// Merge runs of consecutive small segments
    Compact {
        /// Journal directory
        #[arg(long, env = "WAL_DIR")]
        journal_dir: PathBuf,

        /// Only segments at or below this many (compressed) bytes are merged
        #[arg(long, default_value = "5000000")]
        max_input_size: u64,

        /// File name of the merged segment
        #[arg(long)]
        output_name: Option<String>,

        /// Remove inputs once they are fully contained in the output
        #[arg(long)]
        delete_originals: bool,

        /// Only report what would be compacted
        #[arg(long)]
        dry_run: bool,
    },
}

/// A parsed command, resolved into library options.
#[derive(Debug)]
enum Task {
    Prune(PruneConfig),
    Compact(CompactConfig),
}

impl From<Command> for Task {
    fn from(command: Command) -> Self {
        match command {
            Command::Prune {
                journal_dir,
                keep_days,
                archive_dir,
                dry_run,
            } => Task::Prune(PruneConfig {
                journal_dir,
                keep_days,
                archive_dir,
                dry_run,
            }),
            Command::Compact {
                journal_dir,
                max_input_size,
                output_name,
                delete_originals,
                dry_run,
            } => Task::Compact(CompactConfig {
                journal_dir,
                max_input_size,
                output_name,
                delete_originals,
                dry_run,
            }),
        }
    }
}

impl Task {
    /// Run the task and render its report as one line of JSON.
    fn run(&self) -> Result<String> {
        let report = match self {
            Task::Prune(config) => {
                let report = prune(config).with_context(|| {
                    format!("Failed to prune {}", config.journal_dir.display())
                })?;
                serde_json::to_string(&report)?
            }
            Task::Compact(config) => {
                let report = compact(config).with_context(|| {
                    format!("Failed to compact {}", config.journal_dir.display())
                })?;
                serde_json::to_string(&report)?
            }
        };
        Ok(report)
    }
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let report = Task::from(Args::parse().command).run()?;
    println!("{report}");
    Ok(())
}
