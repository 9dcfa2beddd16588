//! Application state and configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use phonelog_ingest::{IngestPipeline, JournalConfig, Neo4jConfig, PipelineConfig};

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8000").
    pub bind_addr: String,

    /// Journal directory, rotation and durability settings.
    pub journal: JournalConfig,

    /// Graph store connection.
    pub neo4j: Neo4jConfig,

    /// Default user and per-step deadlines.
    pub pipeline: PipelineConfig,

    /// Prometheus listener port (0 disables).
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `NEO4J_URI`: Neo4j HTTP endpoint (e.g. `http://localhost:7474`)
    /// - `NEO4J_USER`, `NEO4J_PASSWORD`: Neo4j credentials
    ///
    /// Optional environment variables:
    /// - `PHONELOG_BIND_ADDR`: Server bind address (default: "0.0.0.0:8000")
    /// - `WAL_DIR`: Journal directory (default: "/data/wal")
    /// - `WAL_ROTATE_BYTES`: Segment size threshold (default: 100000000)
    /// - `WAL_FSYNC`: fsync every append (default: true)
    /// - `NEO4J_DATABASE`: Database name (default: "neo4j")
    /// - `NEO4J_ENSURE_CONSTRAINTS`: Create uniqueness constraints at startup (default: true)
    /// - `DEFAULT_USER_ID`: User for records without one (default: "anonymous")
    /// - `STORE_TIMEOUT_SECS`: Per-merge deadline (default: 10)
    /// - `JOURNAL_TIMEOUT_SECS`: Per-append deadline (default: 5)
    /// - `METRICS_PORT`: Prometheus port, 0 to disable (default: 9091)
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = env_or("PHONELOG_BIND_ADDR", "0.0.0.0:8000");

        let journal = JournalConfig {
            dir: PathBuf::from(env_or("WAL_DIR", "/data/wal")),
            rotate_bytes: parse_env("WAL_ROTATE_BYTES", 100_000_000)?,
            fsync: parse_bool_env("WAL_FSYNC", true)?,
            ..Default::default()
        };
        if journal.rotate_bytes == 0 {
            anyhow::bail!("WAL_ROTATE_BYTES must be greater than zero");
        }

        let store_timeout = Duration::from_secs(parse_env("STORE_TIMEOUT_SECS", 10)?);
        let neo4j = Neo4jConfig {
            uri: required("NEO4J_URI")?,
            user: required("NEO4J_USER")?,
            password: required("NEO4J_PASSWORD")?,
            database: env_or("NEO4J_DATABASE", "neo4j"),
            timeout: store_timeout,
            ensure_constraints: parse_bool_env("NEO4J_ENSURE_CONSTRAINTS", true)?,
        };

        let pipeline = PipelineConfig {
            default_user_id: env_or("DEFAULT_USER_ID", "anonymous"),
            journal_timeout: Duration::from_secs(parse_env("JOURNAL_TIMEOUT_SECS", 5)?),
            store_timeout,
        };

        let metrics_port = parse_env("METRICS_PORT", 9091)?;

        tracing::info!(
            bind_addr = %bind_addr,
            wal_dir = %journal.dir.display(),
            rotate_bytes = journal.rotate_bytes,
            fsync = journal.fsync,
            neo4j_uri = %neo4j.uri,
            neo4j_database = %neo4j.database,
            default_user_id = %pipeline.default_user_id,
            metrics_port,
            "configuration loaded"
        );

        Ok(Self {
            bind_addr,
            journal,
            neo4j,
            pipeline,
            metrics_port,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn required(key: &str) -> anyhow::Result<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow::anyhow!("{key} environment variable is required"))
}

fn parse_env<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {v:?}")),
        _ => Ok(default),
    }
}

fn parse_bool_env(key: &str, default: bool) -> anyhow::Result<bool> {
    match std::env::var(key) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => anyhow::bail!("invalid boolean for {key}: {other:?}"),
        },
        Err(_) => Ok(default),
    }
}

/// Shared application state available to all request handlers.
pub struct AppState<S> {
    /// The ingestion orchestrator (journal + store).
    pub pipeline: Arc<IngestPipeline<S>>,
}

// Manual impl: `S` itself need not be `Clone`.
impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
        }
    }
}

impl<S> AppState<S> {
    /// Create a new application state around a pipeline.
    pub fn new(pipeline: IngestPipeline<S>) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "PHONELOG_BIND_ADDR",
        "WAL_DIR",
        "WAL_ROTATE_BYTES",
        "WAL_FSYNC",
        "NEO4J_URI",
        "NEO4J_USER",
        "NEO4J_PASSWORD",
        "NEO4J_DATABASE",
        "NEO4J_ENSURE_CONSTRAINTS",
        "DEFAULT_USER_ID",
        "STORE_TIMEOUT_SECS",
        "JOURNAL_TIMEOUT_SECS",
        "METRICS_PORT",
    ];

    const NEO4J: &[(&str, &str)] = &[
        ("NEO4J_URI", "http://neo4j:7474"),
        ("NEO4J_USER", "neo4j"),
        ("NEO4J_PASSWORD", "secret"),
    ];

    /// Run `f` with exactly `vars` set among the config keys.
    fn with_env_vars<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

        let saved: Vec<_> = ENV_KEYS
            .iter()
            .map(|k| (*k, std::env::var(k).ok()))
            .collect();

        // SAFETY: Serialized by mutex; only test code touches these vars.
        unsafe {
            for k in ENV_KEYS {
                std::env::remove_var(k);
            }
            for (k, v) in vars {
                std::env::set_var(k, v);
            }
        }

        f();

        // SAFETY: Restoring original env state.
        unsafe {
            for (k, v) in &saved {
                match v {
                    Some(val) => std::env::set_var(k, val),
                    None => std::env::remove_var(k),
                }
            }
        }
    }

    #[test]
    fn test_defaults() {
        with_env_vars(NEO4J, || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.bind_addr, "0.0.0.0:8000");
            assert_eq!(config.journal.dir, PathBuf::from("/data/wal"));
            assert_eq!(config.journal.rotate_bytes, 100_000_000);
            assert!(config.journal.fsync);
            assert_eq!(config.neo4j.database, "neo4j");
            assert!(config.neo4j.ensure_constraints);
            assert_eq!(config.pipeline.default_user_id, "anonymous");
            assert_eq!(config.pipeline.store_timeout, Duration::from_secs(10));
            assert_eq!(config.pipeline.journal_timeout, Duration::from_secs(5));
            assert_eq!(config.metrics_port, 9091);
        });
    }

    #[test]
    fn test_overrides() {
        let mut vars = NEO4J.to_vec();
        vars.extend([
            ("WAL_DIR", "/tmp/wal"),
            ("WAL_ROTATE_BYTES", "1024"),
            ("WAL_FSYNC", "false"),
            ("DEFAULT_USER_ID", "kip"),
            ("STORE_TIMEOUT_SECS", "3"),
            ("METRICS_PORT", "0"),
        ]);
        with_env_vars(&vars, || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.journal.dir, PathBuf::from("/tmp/wal"));
            assert_eq!(config.journal.rotate_bytes, 1024);
            assert!(!config.journal.fsync);
            assert_eq!(config.pipeline.default_user_id, "kip");
            assert_eq!(config.neo4j.timeout, Duration::from_secs(3));
            assert_eq!(config.metrics_port, 0);
        });
    }

    #[test]
    fn test_missing_neo4j_uri() {
        with_env_vars(&[("NEO4J_USER", "neo4j"), ("NEO4J_PASSWORD", "x")], || {
            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("NEO4J_URI"));
        });
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        let mut vars = NEO4J.to_vec();
        vars.push(("WAL_ROTATE_BYTES", "lots"));
        with_env_vars(&vars, || {
            assert!(Config::from_env().is_err());
        });

        let mut vars = NEO4J.to_vec();
        vars.push(("WAL_ROTATE_BYTES", "0"));
        with_env_vars(&vars, || {
            assert!(Config::from_env().is_err());
        });

        let mut vars = NEO4J.to_vec();
        vars.push(("WAL_FSYNC", "maybe"));
        with_env_vars(&vars, || {
            assert!(Config::from_env().is_err());
        });
    }
}
