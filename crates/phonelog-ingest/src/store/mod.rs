//! Graph store abstraction.
//!
//! The pipeline and replay engine only ever talk to a [`GraphStore`]: a
//! merge-by-key primitive that creates or updates one `PhoneLog` node per
//! fingerprint and links it to its `User` and `Device` nodes.
//!
//! Two backends are provided:
//! - [`Neo4jStore`]: the production store, over Neo4j's HTTP transaction API
//! - [`MemoryStore`]: an in-process store with the same merge semantics, used
//!   by tests and dry runs

mod memory;
mod neo4j;

pub use memory::{MemoryStore, StoredNode};
pub use neo4j::{Neo4jConfig, Neo4jStore};

use crate::error::{Error, Result};
use phonelog_core::CanonicalRecord;
use serde_json::{Map, Value};
use std::future::Future;
use std::time::Duration;

/// Version stamped on every stored node.
pub const SCHEMA_VERSION: i64 = 1;

/// Idempotent merge of canonical records into a graph store.
///
/// Implementations must guarantee that merging the same fingerprint any
/// number of times, from any number of concurrent callers, leaves exactly
/// one node whose mutable attributes match the last merged record and whose
/// creation stamp is never changed.
pub trait GraphStore: Send + Sync + 'static {
    /// Create or update the node keyed by `record.fingerprint`.
    ///
    /// Returns the key of the merged node. Every failure is reported as a
    /// store failure; nothing is retried here.
    fn merge_phone_log(
        &self,
        record: &CanonicalRecord,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Verify the store is reachable.
    fn health_check(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Merge a record, failing with [`Error::StoreTimeout`] if the store does not
/// answer within `timeout`.
pub async fn merge_with_timeout<S: GraphStore>(
    store: &S,
    record: &CanonicalRecord,
    timeout: Duration,
) -> Result<String> {
    match tokio::time::timeout(timeout, store.merge_phone_log(record)).await {
        Ok(result) => result,
        Err(_) => Err(Error::StoreTimeout(timeout)),
    }
}

/// The mutable node attributes for a record, keyed by stored property name.
///
/// Every property is present on every merge (absent values as `null`), so a
/// merge overwrites all attributes rather than merging field by field.
pub fn node_properties(record: &CanonicalRecord) -> Map<String, Value> {
    let mut props = Map::new();
    let mut set = |key: &str, value: Option<Value>| {
        props.insert(key.to_string(), value.map_or(Value::Null, property_value));
    };

    set("uid", Some(Value::String(record.fingerprint.clone())));
    set("user_id", Some(Value::String(record.user_id.clone())));
    set("device_id", record.device_id.clone().map(Value::String));
    set("geom_type", record.geometry_type.clone().map(Value::String));
    set("coordinates", record.coordinates.clone());
    set("longitude", Some(Value::from(record.longitude)));
    set("latitude", Some(Value::from(record.latitude)));
    set("timestamp", Some(Value::String(record.timestamp_iso8601.clone())));
    set("epoch_millis", Some(Value::from(record.timestamp_epoch_millis)));
    set("speed", record.speed.clone());
    set("battery_state", record.battery_state.clone());
    set("motion", record.motion.clone());
    set("battery_level", record.battery_level.clone());
    set("vertical_accuracy", record.vertical_accuracy.clone());
    set("horizontal_accuracy", record.horizontal_accuracy.clone());
    set("pauses", record.pauses.clone());
    set("wifi", record.wifi.clone());
    set("deferred", record.deferred.clone());
    set("significant_change", record.significant_change.clone());
    set("locations_in_payload", record.locations_in_payload.clone());
    set("activity", record.activity.clone());
    set("altitude", record.altitude.clone());
    set("desired_accuracy", record.desired_accuracy.clone());

    props
}

/// Coerce a passthrough value into something a node property can hold.
///
/// Graph properties are scalars or homogeneous lists of scalars. Objects are
/// stored as their JSON text; lists go through [`list_property`].
fn property_value(value: Value) -> Value {
    match value {
        Value::Object(_) => Value::String(value.to_string()),
        Value::Array(items) => list_property(items),
        other => other,
    }
}

/// Lists of one scalar kind are kept. Integers mixed with floats become
/// floats; any other mix is stored as JSON text.
fn list_property(items: Vec<Value>) -> Value {
    if items.iter().all(Value::is_string)
        || items.iter().all(Value::is_boolean)
        || items.iter().all(Value::is_i64)
    {
        return Value::Array(items);
    }
    if items.iter().all(Value::is_number) {
        return Value::Array(items.iter().filter_map(Value::as_f64).map(Value::from).collect());
    }
    Value::String(Value::Array(items).to_string())
}
