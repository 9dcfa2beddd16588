//! Phonelog ingestion pipeline components.
//!
//! This crate turns inbound location batches into graph-store nodes, with an
//! append-only journal in front so nothing accepted is ever lost.
//!
//! # Modules
//!
//! - [`journal`] - Rotating gzip NDJSON journal (writer, reader, listing)
//! - [`store`] - Graph store abstraction with Neo4j and in-memory backends
//! - [`pipeline`] - The per-request orchestrator
//! - [`replay`] - Re-drives the journal into the store
//! - [`retention`] - Prunes and compacts sealed segments
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  IngestEnvelope │  (HTTP batch or legacy single object)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  JournalWriter  │  fsync'd gzip NDJSON, seals on size threshold
//! └────────┬────────┘
//!          │ ◄──────────── ReplayEngine (reads segments back)
//!          ▼
//! ┌─────────────────┐
//! │  normalize_one  │  0..1 CanonicalRecord per item
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   GraphStore    │  MERGE by fingerprint (Neo4j)
//! └─────────────────┘
//! ```
//!
//! The pipeline is journal-first: the journal is the source of truth, and the
//! graph store can be rebuilt from it at any time.

pub mod error;
pub mod journal;
pub mod pipeline;
pub mod replay;
pub mod retention;
pub mod store;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use journal::{
    JournalConfig, JournalStats, JournalWriter, SealedSegment, SegmentEntries, SegmentFile,
    SegmentLine, SegmentState, list_segments,
};
pub use pipeline::{IngestOutcome, IngestPipeline, PipelineConfig, normalize_batch};
pub use replay::{ReplayConfig, ReplayEngine, ReplayStats};
pub use retention::{
    CompactConfig, CompactReport, PruneConfig, PruneReport, compact, prune, prune_at,
};
pub use store::{GraphStore, MemoryStore, Neo4jConfig, Neo4jStore, StoredNode};
