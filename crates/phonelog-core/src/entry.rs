//! Journal entry format.
//!
//! Every accepted request is journaled as one line of JSON:
//!
//! ```text
//! {"received_at_millis": 1704067200000, "payload": {...}, "api_version": "v1"}
//! ```
//!
//! Entries written by the earlier deployment used `received_at` and `api`;
//! both are still accepted when decoding.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Which ingress endpoint accepted the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiVersion {
    /// Legacy endpoint: payload journaled verbatim, never normalized live.
    V0,
    /// Batch endpoint.
    V1,
    /// A tag this build does not know.
    #[serde(other)]
    Unknown,
}

/// The shape of a journaled payload, as seen by replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// `{user_id?, device_id?, locations: [...]}`
    Batch,
    /// A single location object.
    Legacy,
}

/// One journaled request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// When the request was accepted (Unix milliseconds).
    #[serde(alias = "received_at")]
    pub received_at_millis: i64,

    /// The raw request payload.
    pub payload: Value,

    /// The accepting endpoint, if recorded.
    #[serde(default, alias = "api", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<ApiVersion>,
}

impl JournalEntry {
    /// Create an entry stamped with the current time.
    pub fn now(payload: Value, api_version: ApiVersion) -> Self {
        Self {
            received_at_millis: Utc::now().timestamp_millis(),
            payload,
            api_version: Some(api_version),
        }
    }

    /// Serialize to a single line (without the trailing newline).
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one journal line.
    ///
    /// Fails if the line is not JSON, lacks the required keys, or carries a
    /// payload that is not a JSON object.
    pub fn from_line(line: &str) -> Result<Self> {
        let entry: Self = serde_json::from_str(line)?;
        if !entry.payload.is_object() {
            return Err(Error::InvalidField {
                field: "payload",
                reason: "expected a JSON object".to_string(),
            });
        }
        Ok(entry)
    }

    /// Classify the payload: anything with a `locations` key is a batch.
    pub fn shape(&self) -> PayloadShape {
        if self.payload.get("locations").is_some() {
            PayloadShape::Batch
        } else {
            PayloadShape::Legacy
        }
    }
}
