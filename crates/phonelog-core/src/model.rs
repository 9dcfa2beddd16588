//! Inbound payload model and the canonical record.
//!
//! Inbound items are deliberately permissive: every item is a known set of
//! fields the normalizer looks at, plus an opaque remainder that is carried
//! verbatim so nothing a phone sent is lost when the item is journaled.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;

use crate::lenient::parse_lenient_object;
use crate::normalize::batch_identifier;

/// A `geometry` or `properties` sub-object as it arrives on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Fragment {
    /// A structured JSON object.
    Object(Map<String, Value>),

    /// A stringified pseudo-JSON object (see [`crate::lenient`]).
    Encoded(String),

    /// Anything else (numbers, arrays, booleans). Never usable.
    Other(Value),
}

impl Fragment {
    /// Resolve the fragment to an object, if possible.
    ///
    /// Encoded fragments are parsed leniently; a parse failure yields `None`.
    pub fn as_object(&self) -> Option<Cow<'_, Map<String, Value>>> {
        match self {
            Self::Object(map) => Some(Cow::Borrowed(map)),
            Self::Encoded(text) => parse_lenient_object(text).map(Cow::Owned),
            Self::Other(_) => None,
        }
    }
}

/// One location item, usually a GeoJSON-like feature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationItem {
    /// Point geometry (`{"type": "Point", "coordinates": [lon, lat]}`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Fragment>,

    /// Observation properties (timestamp, speed, battery, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Fragment>,

    /// Per-item user override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Value>,

    /// Per-item device override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<Value>,

    /// Everything else on the item (`type`, vendor extensions, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LocationItem {
    /// Deserialize an item from an arbitrary JSON value.
    ///
    /// Any JSON object is a valid item; other values are rejected.
    pub fn from_value(value: Value) -> crate::Result<Self> {
        if !value.is_object() {
            return Err(crate::Error::InvalidField {
                field: "locations[]",
                reason: "expected a JSON object".to_string(),
            });
        }
        Ok(serde_json::from_value(value)?)
    }

    /// The item as JSON, as it should be retained for forensic replay.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// The current ingress batch shape, viewed leniently.
///
/// Built from a request body that has already been journaled verbatim, so
/// nothing here rejects input: identifiers may be strings or numbers, a
/// missing `locations` is an empty batch, and items that are not objects are
/// kept until normalization drops them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestEnvelope {
    /// Default user for items that do not carry their own.
    pub user_id: Option<Value>,

    /// Default device for items that do not carry their own.
    pub device_id: Option<Value>,

    /// The raw location items in this batch.
    pub locations: Vec<Value>,
}

impl IngestEnvelope {
    /// View a batch payload.
    pub fn from_payload(payload: &Value) -> Self {
        let locations = match payload.get("locations") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        Self {
            locations,
            ..Self::identity_of(payload)
        }
    }

    /// View a legacy single-object payload: the object is the only item and
    /// its own identifiers are also the batch defaults.
    pub fn single(payload: &Value) -> Self {
        Self {
            locations: vec![payload.clone()],
            ..Self::identity_of(payload)
        }
    }

    fn identity_of(payload: &Value) -> Self {
        let field = |key: &str| payload.get(key).filter(|v| !v.is_null()).cloned();
        Self {
            user_id: field("user_id"),
            device_id: field("device_id"),
            locations: Vec::new(),
        }
    }

    /// The batch user, or `fallback` when it is absent or empty.
    pub fn default_user(&self, fallback: &str) -> String {
        batch_identifier(self.user_id.as_ref())
            .filter(|user| !user.is_empty())
            .unwrap_or_else(|| fallback.to_string())
    }

    /// The batch device. An empty string is kept.
    pub fn default_device(&self) -> Option<String> {
        batch_identifier(self.device_id.as_ref())
    }
}

/// A normalized, validated location observation.
///
/// Only exists when the timestamp, longitude and latitude all resolved.
/// Every other observation field is passed through best-effort and is `None`
/// when absent or null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    /// Deterministic idempotency key (see [`crate::fingerprint`]).
    pub fingerprint: String,
    pub user_id: String,
    pub device_id: Option<String>,
    pub geometry_type: Option<String>,
    /// The coordinate sequence, numeric strings converted to numbers.
    pub coordinates: Option<Value>,
    pub longitude: f64,
    pub latitude: f64,
    pub timestamp_iso8601: String,
    pub timestamp_epoch_millis: i64,
    pub speed: Option<Value>,
    pub battery_state: Option<Value>,
    pub motion: Option<Value>,
    pub battery_level: Option<Value>,
    pub vertical_accuracy: Option<Value>,
    pub horizontal_accuracy: Option<Value>,
    pub pauses: Option<Value>,
    pub wifi: Option<Value>,
    pub deferred: Option<Value>,
    pub significant_change: Option<Value>,
    pub locations_in_payload: Option<Value>,
    pub activity: Option<Value>,
    pub altitude: Option<Value>,
    pub desired_accuracy: Option<Value>,
    /// The original item, retained for forensic replay.
    pub raw_item: Value,
}
