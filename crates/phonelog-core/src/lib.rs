//! Core types, normalization, and shared utilities for phone location ingestion.
//!
//! This crate provides:
//! - The inbound payload model ([`IngestEnvelope`], [`LocationItem`])
//! - Lenient parsing of stringified pseudo-JSON sub-objects
//! - Timestamp resolution (epoch seconds, epoch millis, ISO-8601)
//! - The [`normalize_one`] transformation and [`fingerprint`] derivation
//! - The journal line format ([`JournalEntry`])
//! - Prometheus metrics helpers
//! - Shared error types
//!
//! Everything here is pure: no I/O beyond the optional metrics listener.

mod entry;
mod error;
pub mod lenient;
pub mod metrics;
mod model;
mod normalize;
pub mod timestamp;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Numeric timestamps at or below this value are epoch seconds; larger values
/// are epoch milliseconds. 10 billion seconds is the year 2286, 10 billion
/// milliseconds is April 1970.
pub const SECONDS_THRESHOLD: i64 = 10_000_000_000;

pub use entry::{ApiVersion, JournalEntry, PayloadShape};
pub use error::{Error, Result};
pub use model::{CanonicalRecord, Fragment, IngestEnvelope, LocationItem};
pub use normalize::{fingerprint, normalize_one};
