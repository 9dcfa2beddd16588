//! Phonelog Serve - HTTP front end for phone location ingestion
//!
//! A thin axum layer over [`phonelog_ingest::IngestPipeline`]: it decodes the
//! request, hands it to the pipeline, and maps the outcome to a response.
//! Everything that matters for durability and idempotency lives in the
//! pipeline; this crate only owns routing, status codes and startup.
//!
//! # Architecture
//!
//! - **Config**: Environment-driven configuration (journal, Neo4j, deadlines)
//! - **AppState**: Shared pipeline handle, generic over the graph store
//! - **Routes**: Ingestion endpoints and the liveness check

mod error;
mod routes;
mod state;

pub use self::error::ApiError;
pub use self::routes::{AckResponse, IngestResponse, create_legacy, create_locations, router};
pub use self::state::{AppState, Config};
