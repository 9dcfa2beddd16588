//! API route definitions.

mod health;
mod locations;

use axum::Router;
use axum::routing::{get, post};
use phonelog_ingest::GraphStore;

use crate::state::AppState;

pub use locations::{AckResponse, IngestResponse, create_legacy, create_locations};

/// Build the complete API router.
///
/// # Route Structure
///
/// - `GET /healthz` - Liveness check
/// - `POST /api/v1/locations` - Batch ingestion
/// - `POST /api/v0` - Legacy single-object ingestion (journal only)
pub fn router<S: GraphStore>(state: AppState<S>) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/api/v1/locations", post(create_locations::<S>))
        .route("/api/v0", post(create_legacy::<S>))
        .with_state(state)
}
