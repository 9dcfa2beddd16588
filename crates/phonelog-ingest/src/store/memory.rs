//! In-process graph store.
//!
//! Mirrors the Neo4j merge semantics closely enough to test idempotency,
//! replay equivalence and failure handling without a database.

use super::{GraphStore, SCHEMA_VERSION, node_properties};
use crate::error::{Error, Result};
use chrono::Utc;
use parking_lot::Mutex;
use phonelog_core::CanonicalRecord;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A stored `PhoneLog` node.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredNode {
    /// Mutable attributes, overwritten on every merge.
    pub properties: Map<String, Value>,
    /// Set on creation, never changed.
    pub created_at: i64,
    pub updated_at: i64,
    pub schema_version: i64,
    /// `User.id` this node is linked to.
    pub user: Option<String>,
    /// `Device.id` this node is linked to.
    pub device: Option<String>,
}

#[derive(Default)]
struct Graph {
    nodes: HashMap<String, StoredNode>,
    users: HashSet<String>,
    devices: HashSet<String>,
}

/// Graph store held in memory.
#[derive(Default)]
pub struct MemoryStore {
    graph: Mutex<Graph>,
    fail_merges: AtomicBool,
    merges: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent merge fail with a store error (or stop doing so).
    pub fn fail_merges(&self, fail: bool) {
        self.fail_merges.store(fail, Ordering::SeqCst);
    }

    /// Number of distinct `PhoneLog` nodes.
    pub fn node_count(&self) -> usize {
        self.graph.lock().nodes.len()
    }

    /// Number of distinct `User` nodes.
    pub fn user_count(&self) -> usize {
        self.graph.lock().users.len()
    }

    /// Number of distinct `Device` nodes.
    pub fn device_count(&self) -> usize {
        self.graph.lock().devices.len()
    }

    /// Number of successful merge calls.
    pub fn merge_count(&self) -> u64 {
        self.merges.load(Ordering::Relaxed)
    }

    /// Keys of every stored node, sorted.
    pub fn fingerprints(&self) -> BTreeSet<String> {
        self.graph.lock().nodes.keys().cloned().collect()
    }

    /// Look up a node by key.
    pub fn node(&self, uid: &str) -> Option<StoredNode> {
        self.graph.lock().nodes.get(uid).cloned()
    }
}

impl GraphStore for MemoryStore {
    async fn merge_phone_log(&self, record: &CanonicalRecord) -> Result<String> {
        if self.fail_merges.load(Ordering::SeqCst) {
            return Err(Error::Store("injected merge failure".to_string()));
        }

        let now = Utc::now().timestamp_millis();
        let properties = node_properties(record);
        let user = Some(record.user_id.clone()).filter(|u| !u.is_empty());
        let device = record.device_id.clone().filter(|d| !d.is_empty());

        let mut graph = self.graph.lock();
        if let Some(u) = &user {
            graph.users.insert(u.clone());
        }
        if let Some(d) = &device {
            graph.devices.insert(d.clone());
        }

        let node = graph
            .nodes
            .entry(record.fingerprint.clone())
            .or_insert_with(|| StoredNode {
                properties: Map::new(),
                created_at: now,
                updated_at: now,
                schema_version: SCHEMA_VERSION,
                user: None,
                device: None,
            });
        node.properties = properties;
        node.updated_at = now;
        // Edges are merged, never removed.
        if user.is_some() {
            node.user = user;
        }
        if device.is_some() {
            node.device = device;
        }

        self.merges.fetch_add(1, Ordering::Relaxed);
        Ok(record.fingerprint.clone())
    }

    async fn health_check(&self) -> Result<()> {
        if self.fail_merges.load(Ordering::SeqCst) {
            return Err(Error::Store("injected health check failure".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phonelog_core::{LocationItem, normalize_one};
    use serde_json::json;

    fn record(lon: f64, speed: f64) -> CanonicalRecord {
        let item = LocationItem::from_value(json!({
            "geometry": {"coordinates": [lon, 40.5]},
            "properties": {"timestamp": "2024-01-01T00:00:00Z", "speed": speed}
        }))
        .unwrap();
        normalize_one(&item, "u1", Some("d1")).unwrap()
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let store = MemoryStore::new();
        let r = record(-73.5, 1.0);

        let first = store.merge_phone_log(&r).await.unwrap();
        let created = store.node(&first).unwrap().created_at;
        let second = store.merge_phone_log(&r).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.node_count(), 1);
        assert_eq!(store.user_count(), 1);
        assert_eq!(store.device_count(), 1);
        assert_eq!(store.merge_count(), 2);
        assert_eq!(store.node(&first).unwrap().created_at, created);
    }

    #[tokio::test]
    async fn test_merge_overwrites_attributes() {
        let store = MemoryStore::new();
        let mut r = record(-73.5, 1.0);
        store.merge_phone_log(&r).await.unwrap();

        // Same key, different mutable attributes: last write wins.
        r.speed = Some(json!(9.0));
        r.battery_level = None;
        store.merge_phone_log(&r).await.unwrap();

        let node = store.node(&r.fingerprint).unwrap();
        assert_eq!(node.properties["speed"], json!(9.0));
        assert_eq!(node.properties["battery_level"], Value::Null);
        assert_eq!(node.user.as_deref(), Some("u1"));
        assert_eq!(node.device.as_deref(), Some("d1"));
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_distinct_nodes() {
        let store = MemoryStore::new();
        store.merge_phone_log(&record(-73.5, 1.0)).await.unwrap();
        store.merge_phone_log(&record(-73.6, 1.0)).await.unwrap();
        assert_eq!(store.node_count(), 2);
        assert_eq!(store.user_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryStore::new();
        store.fail_merges(true);
        let err = store.merge_phone_log(&record(-73.5, 1.0)).await.unwrap_err();
        assert!(err.is_store_failure());
        assert!(store.health_check().await.is_err());
        assert_eq!(store.node_count(), 0);

        store.fail_merges(false);
        store.merge_phone_log(&record(-73.5, 1.0)).await.unwrap();
        assert_eq!(store.node_count(), 1);
    }
}
