//! API error types and response formatting.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// API error type that converts to appropriate HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The batch was journaled but no item had a timestamp and coordinates.
    #[error("no valid points ({dropped} dropped)")]
    NoValidPoints { dropped: usize },

    /// Invalid request body.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The journal did not accept the request.
    #[error("journal failure: {0}")]
    Journal(phonelog_ingest::Error),

    /// A store merge failed or timed out.
    #[error("store failure: {0}")]
    Store(phonelog_ingest::Error),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(phonelog_ingest::Error),
}

impl From<phonelog_ingest::Error> for ApiError {
    fn from(err: phonelog_ingest::Error) -> Self {
        if err.is_journal_failure() {
            Self::Journal(err)
        } else if err.is_store_failure() {
            Self::Store(err)
        } else if let phonelog_ingest::Error::Core(core) = &err {
            Self::BadRequest(core.to_string())
        } else {
            Self::Internal(err)
        }
    }
}

/// JSON error response body.
#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    result: &'static str,
    reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    dropped: Option<usize>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason, dropped) = match &self {
            Self::NoValidPoints { dropped } => (
                StatusCode::BAD_REQUEST,
                "no valid points (need timestamp + coordinates)".to_string(),
                Some(*dropped),
            ),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            Self::Journal(err) => {
                tracing::error!(error = %err, "journal append failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "journal failure".to_string(),
                    None,
                )
            }
            Self::Store(err) => {
                tracing::error!(error = %err, "store merge failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "db failure".to_string(),
                    None,
                )
            }
            Self::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal".to_string(), None)
            }
        };

        let body = ErrorResponse {
            result: "error",
            reason,
            dropped,
        };

        (status, Json(body)).into_response()
    }
}
