//! Neo4j backend over the HTTP transactional endpoint.
//!
//! Each merge is a single auto-committed transaction:
//!
//! ```text
//! POST {uri}/db/{database}/tx/commit
//! {"statements": [{"statement": MERGE_CYPHER, "parameters": {...}}]}
//! ```
//!
//! Uniqueness of `PhoneLog.uid` is enforced by a constraint, so concurrent
//! merges for the same fingerprint are serialized by the database's `MERGE`.

use super::{GraphStore, SCHEMA_VERSION, node_properties};
use crate::error::{Error, Result};
use phonelog_core::CanonicalRecord;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::{debug, info};

/// Merge one `PhoneLog` node and its `User` / `Device` edges.
const MERGE_CYPHER: &str = "\
MERGE (p:PhoneLog {uid: $uid})
ON CREATE SET
  p.created_at = timestamp(),
  p.schema_version = $schema_version
SET
  p.user_id = $user_id,
  p.device_id = $device_id,
  p.geom_type = $geom_type,
  p.coordinates = $coordinates,
  p.longitude = $longitude,
  p.latitude = $latitude,
  p.timestamp = $timestamp,
  p.epoch_millis = $epoch_millis,
  p.speed = $speed,
  p.battery_state = $battery_state,
  p.motion = $motion,
  p.battery_level = $battery_level,
  p.vertical_accuracy = $vertical_accuracy,
  p.horizontal_accuracy = $horizontal_accuracy,
  p.pauses = $pauses,
  p.wifi = $wifi,
  p.deferred = $deferred,
  p.significant_change = $significant_change,
  p.locations_in_payload = $locations_in_payload,
  p.activity = $activity,
  p.altitude = $altitude,
  p.desired_accuracy = $desired_accuracy,
  p.loc = point({latitude: toFloat($latitude), longitude: toFloat($longitude), crs: 'wgs-84'}),
  p.updated_at = timestamp(),
  p.normalized = true
WITH p
FOREACH (_ IN CASE WHEN $user_id IS NOT NULL AND $user_id <> '' THEN [1] ELSE [] END |
  MERGE (u:User {id: $user_id})
  MERGE (p)-[:BY_USER]->(u)
)
FOREACH (_ IN CASE WHEN $device_id IS NOT NULL AND $device_id <> '' THEN [1] ELSE [] END |
  MERGE (d:Device {id: $device_id})
  MERGE (p)-[:FROM_DEVICE]->(d)
)
RETURN p.uid AS uid";

/// Constraints that back the merge keys.
const CONSTRAINTS: [&str; 3] = [
    "CREATE CONSTRAINT phonelog_uid IF NOT EXISTS FOR (p:PhoneLog) REQUIRE p.uid IS UNIQUE",
    "CREATE CONSTRAINT user_id IF NOT EXISTS FOR (u:User) REQUIRE u.id IS UNIQUE",
    "CREATE CONSTRAINT device_id IF NOT EXISTS FOR (d:Device) REQUIRE d.id IS UNIQUE",
];

/// Configuration for the Neo4j store.
#[derive(Debug, Clone)]
pub struct Neo4jConfig {
    /// HTTP endpoint, e.g. `http://localhost:7474`.
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,

    /// Per-request deadline enforced by the HTTP client.
    /// Default: 10 seconds
    pub timeout: Duration,

    /// Create the uniqueness constraints on connect.
    /// Default: true
    pub ensure_constraints: bool,
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            uri: "http://localhost:7474".to_string(),
            user: "neo4j".to_string(),
            password: String::new(),
            database: "neo4j".to_string(),
            timeout: Duration::from_secs(10),
            ensure_constraints: true,
        }
    }
}

#[derive(Serialize)]
struct Statement<'a> {
    statement: &'a str,
    parameters: Map<String, Value>,
}

#[derive(Serialize)]
struct TxRequest<'a> {
    statements: Vec<Statement<'a>>,
}

#[derive(Deserialize, Debug, Default)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Deserialize, Debug, Default)]
struct TxResult {
    #[serde(default)]
    data: Vec<TxRow>,
}

#[derive(Deserialize, Debug)]
struct TxRow {
    #[serde(default)]
    row: Vec<Value>,
}

#[derive(Deserialize, Debug)]
struct TxError {
    code: String,
    message: String,
}

/// Graph store backed by a Neo4j server.
///
/// Cheap to clone; clones share one connection pool.
#[derive(Clone)]
pub struct Neo4jStore {
    client: Client,
    commit_url: String,
    config: Neo4jConfig,
}

impl Neo4jStore {
    /// Build a store client without touching the network.
    pub fn new(config: Neo4jConfig) -> Result<Self> {
        if config.uri.is_empty() {
            return Err(Error::Config("Neo4j URI must not be empty".into()));
        }

        let client = Client::builder().timeout(config.timeout).build()?;
        let commit_url = format!(
            "{}/db/{}/tx/commit",
            config.uri.trim_end_matches('/'),
            config.database
        );

        Ok(Self {
            client,
            commit_url,
            config,
        })
    }

    /// Build a client, verify connectivity, and optionally apply constraints.
    pub async fn connect(config: Neo4jConfig) -> Result<Self> {
        let store = Self::new(config)?;
        store.health_check().await?;
        if store.config.ensure_constraints {
            store.ensure_constraints().await?;
        }
        info!(
            "Connected to Neo4j at {} (database {})",
            store.config.uri, store.config.database
        );
        Ok(store)
    }

    /// Get the configuration.
    pub fn config(&self) -> &Neo4jConfig {
        &self.config
    }

    /// Create the uniqueness constraints. Safe to run repeatedly.
    pub async fn ensure_constraints(&self) -> Result<()> {
        for statement in CONSTRAINTS {
            self.run(statement, Map::new()).await?;
        }
        info!("Neo4j uniqueness constraints ensured");
        Ok(())
    }

    /// Release the connection pool.
    pub fn close(self) {
        debug!("Neo4j client closed");
    }

    /// Run one statement in its own transaction and return its rows.
    async fn run(&self, statement: &str, parameters: Map<String, Value>) -> Result<Vec<TxRow>> {
        let body = TxRequest {
            statements: vec![Statement {
                statement,
                parameters,
            }],
        };

        let resp = self
            .client
            .post(&self.commit_url)
            .basic_auth(&self.config.user, Some(&self.config.password))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Store(format!("HTTP {status}: {text}")));
        }

        let parsed: TxResponse = resp.json().await?;
        if let Some(err) = parsed.errors.first() {
            return Err(Error::Store(format!("{}: {}", err.code, err.message)));
        }

        Ok(parsed
            .results
            .into_iter()
            .next()
            .map(|r| r.data)
            .unwrap_or_default())
    }
}

/// Cypher parameters for a merge.
fn merge_parameters(record: &CanonicalRecord) -> Map<String, Value> {
    let mut params = node_properties(record);
    params.insert("schema_version".to_string(), json!(SCHEMA_VERSION));
    params
}

impl GraphStore for Neo4jStore {
    async fn merge_phone_log(&self, record: &CanonicalRecord) -> Result<String> {
        let rows = match self.run(MERGE_CYPHER, merge_parameters(record)).await {
            Ok(rows) => rows,
            Err(Error::Http(e)) if e.is_timeout() => {
                return Err(Error::StoreTimeout(self.config.timeout));
            }
            Err(e) => return Err(e),
        };

        rows.first()
            .and_then(|r| r.row.first())
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Store(format!("merge of {} returned no uid", record.fingerprint))
            })
    }

    async fn health_check(&self) -> Result<()> {
        let rows = self.run("RETURN 1", Map::new()).await?;
        match rows.first().and_then(|r| r.row.first()) {
            Some(v) if v == &json!(1) => Ok(()),
            other => Err(Error::Store(format!(
                "unexpected health check result: {other:?}"
            ))),
        }
    }
}
