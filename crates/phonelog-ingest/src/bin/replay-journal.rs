//! Replay the request journal into the graph store.
//!
//! Reads every segment in creation order, normalizes each journaled request
//! again and merges the results. Merges are keyed by fingerprint, so running
//! this any number of times (even while the server is ingesting) never
//! duplicates nodes.
//!
//! # Pipeline
//!
//! ```text
//! [Journal segments] → [normalize_one] → [MERGE by fingerprint] → [Neo4j]
//! ```
//!
//! # Usage
//!
//! ```bash
//! # Count what would be ingested
//! replay-journal --journal-dir /data/wal --dry-run
//!
//! # Replay only batch entries, first 10k entries
//! NEO4J_URI=http://localhost:7474 NEO4J_USER=neo4j NEO4J_PASSWORD=secret \
//!     replay-journal --journal-dir /data/wal --only-v1 --limit 10000
//!
//! # Machine-readable summary
//! replay-journal --journal-dir /data/wal --json
//! ```

use anyhow::{Context, Result, bail};
use clap::Parser;
use phonelog_core::metrics::{init_metrics, start_metrics_server};
use phonelog_ingest::{MemoryStore, Neo4jConfig, Neo4jStore, ReplayConfig, ReplayEngine, ReplayStats};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Replay journaled requests into the graph store (idempotent).
#[derive(Parser, Debug)]
#[command(name = "replay-journal")]
#[command(about = "Replay the request journal into the graph store (idempotent)")]
struct Args {
    /// Journal directory
    #[arg(long, env = "WAL_DIR", default_value = "/data/wal")]
    journal_dir: PathBuf,

    /// Compute counts without touching the store
    #[arg(long)]
    dry_run: bool,

    /// Maximum number of entries to process
    #[arg(long)]
    limit: Option<usize>,

    /// Ignore legacy single-object entries
    #[arg(long)]
    only_v1: bool,

    /// Skip the active segment
    #[arg(long)]
    sealed_only: bool,

    /// User for records that carry none
    #[arg(long, env = "DEFAULT_USER_ID", default_value = "anonymous")]
    default_user_id: String,

    /// Neo4j HTTP endpoint
    #[arg(long, env = "NEO4J_URI")]
    neo4j_uri: Option<String>,

    /// Neo4j user
    #[arg(long, env = "NEO4J_USER", default_value = "neo4j")]
    neo4j_user: String,

    /// Neo4j password
    #[arg(long, env = "NEO4J_PASSWORD", default_value = "", hide_env_values = true)]
    neo4j_password: String,

    /// Neo4j database
    #[arg(long, env = "NEO4J_DATABASE", default_value = "neo4j")]
    neo4j_database: String,

    /// Store request timeout in seconds
    #[arg(long, env = "STORE_TIMEOUT_SECS", default_value = "10")]
    store_timeout_secs: u64,

    /// Print progress every N entries
    #[arg(long, default_value = "10000")]
    progress_interval: usize,

    /// Print the summary as a single JSON object
    #[arg(long)]
    json: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "0")]
    metrics_port: u16,
}

impl Args {
    fn replay_config(&self) -> ReplayConfig {
        ReplayConfig {
            journal_dir: self.journal_dir.clone(),
            dry_run: self.dry_run,
            limit: self.limit,
            legacy_excluded: self.only_v1,
            include_active: !self.sealed_only,
            default_user_id: self.default_user_id.clone(),
            store_timeout: Duration::from_secs(self.store_timeout_secs),
            progress_interval: self.progress_interval,
        }
    }

    /// Store settings; `None` for a dry run, an error if the URI is missing.
    fn neo4j_config(&self) -> Result<Option<Neo4jConfig>> {
        if self.dry_run {
            return Ok(None);
        }
        let Some(uri) = self.neo4j_uri.clone() else {
            bail!("NEO4J_URI (or --neo4j-uri) is required unless --dry-run is set");
        };
        Ok(Some(Neo4jConfig {
            uri,
            user: self.neo4j_user.clone(),
            password: self.neo4j_password.clone(),
            database: self.neo4j_database.clone(),
            timeout: Duration::from_secs(self.store_timeout_secs),
            ensure_constraints: true,
        }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.metrics_port > 0
        && let Some(handle) = init_metrics()
    {
        start_metrics_server(args.metrics_port, handle).await?;
    }

    let engine = ReplayEngine::new(args.replay_config());

    let start = Instant::now();
    let stats = match args.neo4j_config()? {
        None => engine.run::<MemoryStore>(None).await?,
        Some(config) => {
            let store = Neo4jStore::connect(config)
                .await
                .context("Failed to connect to Neo4j")?;
            info!("Connected to store, starting replay");
            let stats = engine.run(Some(&store)).await?;
            store.close();
            stats
        }
    };

    if args.json {
        println!("{}", serde_json::to_string(&stats)?);
    } else {
        print_summary(&args, &stats, start.elapsed());
    }

    Ok(())
}

fn print_summary(args: &Args, stats: &ReplayStats, elapsed: Duration) {
    println!("\n══════════════════════════════════════════════════════════════════");
    println!("REPLAY SUMMARY{}", if args.dry_run { " (dry run)" } else { "" });
    println!("══════════════════════════════════════════════════════════════════\n");

    println!("Journal:           {}", args.journal_dir.display());
    println!();
    println!("Segments read:     {:>12}", stats.segments);
    println!("Entries processed: {:>12}", stats.processed);
    println!("Records ingested:  {:>12}", stats.ingested);
    println!("Items dropped:     {:>12}", stats.dropped);
    println!("Merges failed:     {:>12}", stats.failed);
    println!("Legacy skipped:    {:>12}", stats.skipped_legacy);
    println!("Decode errors:     {:>12}", stats.decode_errors);
    println!();
    let secs = elapsed.as_secs_f64();
    println!("Elapsed:           {:>12.1}s", secs);
    if secs > 0.0 {
        println!(
            "Throughput:        {:>12.0} entries/s",
            stats.processed as f64 / secs
        );
    }
}
