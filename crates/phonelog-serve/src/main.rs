//! Phonelog Serve - HTTP ingestion server for phone location batches.
//!
//! Opens the journal, connects to Neo4j (failing fast if it is unreachable),
//! and serves the ingestion API until interrupted. On shutdown the active
//! journal segment is sealed.

use std::sync::Arc;

use anyhow::Context;
use axum::http::Request;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use phonelog_core::metrics::{init_metrics, start_metrics_server};
use phonelog_ingest::{IngestPipeline, JournalWriter, Neo4jStore};
use phonelog_serve::{AppState, Config, router};

/// Phonelog ingestion server.
#[derive(Parser, Debug)]
#[command(name = "phonelog-serve")]
#[command(about = "HTTP ingestion server for phone location batches", long_about = None)]
struct Args {
    /// Path to .env file (optional).
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load .env file if it exists
    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)?;
        eprintln!("Loaded environment from {}", args.dotenv);
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    if config.metrics_port > 0
        && let Some(handle) = init_metrics()
    {
        start_metrics_server(config.metrics_port, handle).await?;
    }

    let journal = JournalWriter::open(config.journal.clone()).with_context(|| {
        format!("Failed to open journal at {}", config.journal.dir.display())
    })?;
    let journal = Arc::new(journal);

    let store = Neo4jStore::connect(config.neo4j.clone())
        .await
        .context("Failed to connect to Neo4j")?;

    let pipeline = IngestPipeline::new(Arc::clone(&journal), Arc::new(store), config.pipeline.clone());
    let state = AppState::new(pipeline);

    // Build router with middleware
    let app = router(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                tracing::span!(
                    Level::INFO,
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    request_id = %request_id
                )
            }),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "starting server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(sealed) = journal.seal()? {
        tracing::info!(path = %sealed.path.display(), entries = sealed.entry_count, "journal sealed");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
