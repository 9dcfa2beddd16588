//! Prometheus metrics helpers for the phonelog system.
//!
//! This module provides centralized metrics initialization and the metric
//! descriptions used across phonelog components.
//!
//! # Usage
//!
//! ```rust,ignore
//! use phonelog_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     if let Some(handle) = init_metrics() {
//!         start_metrics_server(9091, handle).await.unwrap();
//!     }
//!
//!     metrics::counter!("ingest_points_total").increment(1);
//! }
//! ```
//!
//! Recording a metric without an installed recorder is a no-op, so library
//! code records unconditionally and binaries decide whether to export.
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`ingest_`, `journal_`, `replay_`)
//! - Suffix: unit or type (`_total`, `_bytes`)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Returns `None` if a recorder is already installed.
pub fn init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds `/metrics` on the given port and serves it from a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the metrics recorded by phonelog components.
fn register_common_metrics() {
    // =========================================================================
    // Ingestion
    // =========================================================================

    describe_counter!("ingest_requests_total", "Batch requests accepted into the journal");
    describe_counter!("ingest_legacy_requests_total", "Legacy requests accepted into the journal");
    describe_counter!("ingest_points_total", "Location points merged into the store");
    describe_counter!(
        "ingest_points_dropped_total",
        "Location points dropped (missing timestamp or coordinates)"
    );
    describe_counter!("ingest_store_failures_total", "Store upsert failures");
    describe_counter!("ingest_journal_failures_total", "Journal append failures");

    // =========================================================================
    // Journal
    // =========================================================================

    describe_counter!("journal_entries_written_total", "Entries appended to the journal");
    describe_counter!(
        "journal_bytes_written_total",
        "Uncompressed bytes appended to the journal"
    );
    describe_counter!("journal_segments_sealed_total", "Journal segments sealed");
    describe_gauge!("journal_current_bytes", "Compressed bytes in the active segment");

    // =========================================================================
    // Replay
    // =========================================================================

    describe_counter!("replay_entries_total", "Journal entries processed by replay");
    describe_counter!("replay_points_total", "Points merged by replay");
    describe_counter!("replay_points_dropped_total", "Points dropped during replay");
    describe_counter!("replay_decode_errors_total", "Journal lines that failed to decode");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = init_metrics();
        });
    }

    #[test]
    fn test_init_metrics_only_once() {
        let first = init_metrics();
        let second = init_metrics();
        assert!(first.is_none() || second.is_none());
    }

    #[test]
    fn test_recording_does_not_panic() {
        ensure_metrics_init();
        metrics::counter!("ingest_points_total").increment(1);
        metrics::gauge!("journal_current_bytes").set(42.0);
    }

    #[test]
    fn test_register_common_metrics_is_repeatable() {
        ensure_metrics_init();
        register_common_metrics();
        register_common_metrics();
    }
}
