//! Error types for the ingestion pipeline.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion, replay and retention.
#[derive(Error, Debug)]
pub enum Error {
    /// The journal could not durably record an entry. The request was not
    /// accepted.
    #[error("Journal error: {0}")]
    Journal(String),

    /// The graph store rejected or failed a merge.
    #[error("Store error: {0}")]
    Store(String),

    /// A store call exceeded its deadline.
    #[error("Store request timed out after {0:?}")]
    StoreTimeout(Duration),

    /// HTTP transport error talking to the store.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Core record error.
    #[error("Record error: {0}")]
    Core(#[from] phonelog_core::Error),

    /// Segment error.
    #[error("Segment error: {0}")]
    Segment(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error came from the graph store (connectivity,
    /// constraint violation, or timeout).
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::Store(_) | Self::StoreTimeout(_) | Self::Http(_))
    }

    /// Whether this error means the journal did not accept the entry.
    pub fn is_journal_failure(&self) -> bool {
        matches!(self, Self::Journal(_))
    }
}
