//! Ingestion orchestrator.
//!
//! One call per inbound request:
//!
//! ```text
//! envelope ──► journal (durability barrier) ──► normalize items ──► merge each
//! ```
//!
//! The journal append must succeed before anything else happens. Once it has,
//! everything after it can be abandoned safely: the entry stays in the journal
//! and replay completes the work.

use crate::error::{Error, Result};
use crate::journal::JournalWriter;
use crate::store::{GraphStore, merge_with_timeout};
use phonelog_core::{
    ApiVersion, CanonicalRecord, IngestEnvelope, JournalEntry, LocationItem, normalize_one,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Configuration for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// User assigned to records that carry no user anywhere.
    /// Default: "anonymous"
    pub default_user_id: String,

    /// Deadline for one journal append (including fsync).
    /// Default: 5 seconds
    pub journal_timeout: Duration,

    /// Deadline for one store merge.
    /// Default: 10 seconds
    pub store_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_user_id: "anonymous".to_string(),
            journal_timeout: Duration::from_secs(5),
            store_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of ingesting one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// At least one item normalized and every normalized record was merged.
    Accepted {
        ingested: usize,
        dropped: usize,
        uids: Vec<String>,
    },
    /// The batch was journaled but no item normalized.
    NoValidPoints { dropped: usize },
}

/// Normalize every item of a batch.
///
/// Returns the records in item order and the number of dropped items. Items
/// that are not JSON objects count as dropped.
pub fn normalize_batch(
    envelope: &IngestEnvelope,
    default_user_id: &str,
) -> (Vec<CanonicalRecord>, usize) {
    let user = envelope.default_user(default_user_id);
    let device = envelope.default_device();

    let records: Vec<_> = envelope
        .locations
        .iter()
        .filter_map(|raw| {
            LocationItem::from_value(raw.clone())
                .ok()
                .and_then(|item| normalize_one(&item, &user, device.as_deref()))
        })
        .collect();
    let dropped = envelope.locations.len() - records.len();
    (records, dropped)
}

/// The ingestion orchestrator.
///
/// Holds the shared journal writer and store client; cheap to share behind an
/// `Arc` across request handlers.
pub struct IngestPipeline<S> {
    journal: Arc<JournalWriter>,
    store: Arc<S>,
    config: PipelineConfig,
}

impl<S: GraphStore> IngestPipeline<S> {
    /// Create a pipeline over an open journal and a connected store.
    pub fn new(journal: Arc<JournalWriter>, store: Arc<S>, config: PipelineConfig) -> Self {
        Self {
            journal,
            store,
            config,
        }
    }

    /// Get the journal writer.
    pub fn journal(&self) -> &Arc<JournalWriter> {
        &self.journal
    }

    /// Get the store client.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get the configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Ingest one batch.
    ///
    /// The payload is journaled exactly as received; only a non-object body is
    /// refused before the journal.
    ///
    /// # Errors
    ///
    /// - A core validation error if the payload is not a JSON object.
    /// - [`Error::Journal`] if the batch could not be journaled; nothing was
    ///   accepted and the store was not touched.
    /// - A store failure if any merge failed or timed out. Records merged
    ///   before the failure stay merged; the journaled batch lets replay
    ///   complete the rest.
    pub async fn ingest(&self, payload: Value) -> Result<IngestOutcome> {
        require_object(&payload)?;
        let envelope = IngestEnvelope::from_payload(&payload);
        self.append(JournalEntry::now(payload, ApiVersion::V1)).await?;
        metrics::counter!("ingest_requests_total").increment(1);

        let (records, dropped) = normalize_batch(&envelope, &self.config.default_user_id);
        metrics::counter!("ingest_points_dropped_total").increment(dropped as u64);

        if records.is_empty() {
            debug!("Batch of {} items had no valid points", envelope.locations.len());
            return Ok(IngestOutcome::NoValidPoints { dropped });
        }

        let mut uids = Vec::with_capacity(records.len());
        for record in &records {
            match merge_with_timeout(self.store.as_ref(), record, self.config.store_timeout).await
            {
                Ok(uid) => uids.push(uid),
                Err(e) => {
                    metrics::counter!("ingest_store_failures_total").increment(1);
                    error!(
                        "Store merge failed for {} ({} of {} merged): {}",
                        record.fingerprint,
                        uids.len(),
                        records.len(),
                        e
                    );
                    return Err(e);
                }
            }
        }

        metrics::counter!("ingest_points_total").increment(uids.len() as u64);
        Ok(IngestOutcome::Accepted {
            ingested: uids.len(),
            dropped,
            uids,
        })
    }

    /// Journal a legacy single-object payload. Never normalized or merged here;
    /// replay picks it up.
    pub async fn ingest_legacy(&self, payload: Value) -> Result<()> {
        require_object(&payload)?;
        self.append(JournalEntry::now(payload, ApiVersion::V0)).await?;
        metrics::counter!("ingest_legacy_requests_total").increment(1);
        Ok(())
    }

    /// Append on the blocking pool, bounded by the journal timeout.
    async fn append(&self, entry: JournalEntry) -> Result<()> {
        let journal = Arc::clone(&self.journal);
        let task = tokio::task::spawn_blocking(move || journal.append(&entry));

        match tokio::time::timeout(self.config.journal_timeout, task).await {
            Ok(Ok(Ok(_sealed))) => Ok(()),
            Ok(Ok(Err(e))) => Err(match e {
                Error::Journal(_) => e,
                other => Error::Journal(other.to_string()),
            }),
            Ok(Err(join_err)) => Err(Error::Journal(format!("append task failed: {join_err}"))),
            Err(_) => {
                warn!(
                    "Journal append exceeded {:?}; request not accepted",
                    self.config.journal_timeout
                );
                metrics::counter!("ingest_journal_failures_total").increment(1);
                Err(Error::Journal(format!(
                    "append timed out after {:?}",
                    self.config.journal_timeout
                )))
            }
        }
    }
}

fn require_object(payload: &Value) -> Result<()> {
    if payload.is_object() {
        Ok(())
    } else {
        Err(Error::Core(phonelog_core::Error::InvalidField {
            field: "payload",
            reason: "expected a JSON object".to_string(),
        }))
    }
}
