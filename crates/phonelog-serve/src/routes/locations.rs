//! Location ingestion endpoints.

use axum::Json;
use axum::extract::State;
use phonelog_ingest::{GraphStore, IngestOutcome};
use serde::Serialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::state::AppState;

/// Response for an accepted batch.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    result: &'static str,
    ingested: usize,
    dropped: usize,
    uids: Vec<String>,
}

/// Response for a journaled legacy payload.
#[derive(Debug, Clone, Serialize)]
pub struct AckResponse {
    result: &'static str,
}

/// `POST /api/v1/locations`
///
/// Journals the body as received, normalizes every item and merges the
/// valid ones. Any JSON object is journaled; field types are only looked at
/// during normalization.
pub async fn create_locations<S: GraphStore>(
    State(state): State<AppState<S>>,
    Json(payload): Json<Value>,
) -> Result<Json<IngestResponse>, ApiError> {
    match state.pipeline.ingest(payload).await? {
        IngestOutcome::Accepted {
            ingested,
            dropped,
            uids,
        } => Ok(Json(IngestResponse {
            result: "ok",
            ingested,
            dropped,
            uids,
        })),
        IngestOutcome::NoValidPoints { dropped } => Err(ApiError::NoValidPoints { dropped }),
    }
}

/// `POST /api/v0`
///
/// Journals any JSON object verbatim and acknowledges. Replay normalizes it.
pub async fn create_legacy<S: GraphStore>(
    State(state): State<AppState<S>>,
    Json(payload): Json<Value>,
) -> Result<Json<AckResponse>, ApiError> {
    state.pipeline.ingest_legacy(payload).await?;
    Ok(Json(AckResponse { result: "ok" }))
}
