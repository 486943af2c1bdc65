//! Configuration loading and types for replistore.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, replication behavior, the storage engine, logging,
//! and observability.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Client-facing HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Replication / consensus settings.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Storage engine settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health probes).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration for the client API.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Client API port.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Whether the client API is served over HTTPS (affects forwarded
    /// leader URLs; TLS termination itself is external).
    #[serde(default)]
    pub api_uses_ssl: bool,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            api_port: default_api_port(),
            api_uses_ssl: false,
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Replication / consensus configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    /// Root directory holding the `log/`, `meta/` and `snapshot/`
    /// subdirectories.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Port used for peer-to-peer consensus traffic.
    #[serde(default = "default_peering_port")]
    pub peering_port: u16,

    /// Comma-separated cluster membership:
    /// `host:peering_port:api_port,host:peering_port:api_port,...`
    #[serde(default)]
    pub nodes: String,

    /// Interval between periodic snapshot triggers, in seconds.
    #[serde(default = "default_snapshot_interval_s")]
    pub snapshot_interval_s: u64,

    /// Entry-count snapshot trigger: snapshot once this many entries have
    /// accumulated since the last snapshot.
    #[serde(default = "default_snapshot_max_log_entries")]
    pub snapshot_max_log_entries: u64,

    /// A node is caught up when its lag behind the best known cluster
    /// sequence is at most this many entries.
    #[serde(default)]
    pub catchup_min_sequence_diff: u64,

    /// A node is also caught up when it has applied at least this
    /// percentage of the best known cluster sequence.
    #[serde(default = "default_catchup_threshold_percentage")]
    pub catchup_threshold_percentage: u64,

    /// Propose a no-op on leader start so the snapshot trigger heuristics
    /// can fire on an otherwise idle node.  Workaround for entry-count
    /// based triggers; leave off unless the deployment needs it.
    #[serde(default)]
    pub create_init_db_snapshot: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            peering_port: default_peering_port(),
            nodes: String::new(),
            snapshot_interval_s: default_snapshot_interval_s(),
            snapshot_max_log_entries: default_snapshot_max_log_entries(),
            catchup_min_sequence_diff: 0,
            catchup_threshold_percentage: default_catchup_threshold_percentage(),
            create_init_db_snapshot: false,
        }
    }
}

/// Storage engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Engine type: `memory` or `sqlite`.
    #[serde(default = "default_store_engine")]
    pub engine: String,

    /// SQLite-specific configuration.
    #[serde(default)]
    pub sqlite: SqliteConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            engine: default_store_engine(),
            sqlite: SqliteConfig::default(),
        }
    }
}

/// SQLite-specific store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_sqlite_path")]
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
///
/// Controls Prometheus metrics collection and health probes.  Both are
/// enabled by default.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable `/health` and `/readyz` probes.
    #[serde(default = "default_true")]
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            health_check: true,
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8108
}

fn default_peering_port() -> u16 {
    8107
}

fn default_data_dir() -> String {
    "./data/replication".to_string()
}

fn default_snapshot_interval_s() -> u64 {
    3600
}

fn default_snapshot_max_log_entries() -> u64 {
    1000
}

fn default_catchup_threshold_percentage() -> u64 {
    95
}

fn default_store_engine() -> String {
    "sqlite".to_string()
}

fn default_sqlite_path() -> String {
    "./data/store.db".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.api_port, 8108);
        assert_eq!(config.replication.peering_port, 8107);
        assert_eq!(config.replication.catchup_min_sequence_diff, 0);
        assert_eq!(config.replication.catchup_threshold_percentage, 95);
        assert!(!config.replication.create_init_db_snapshot);
        assert_eq!(config.store.engine, "sqlite");
        assert!(config.observability.metrics);
    }

    #[test]
    fn test_parse_full_section() {
        let yaml = r#"
server:
  host: 127.0.0.1
  api_port: 9000
  api_uses_ssl: true
replication:
  data_dir: /var/lib/replistore
  nodes: "a:8107:8108,b:8107:8108"
  catchup_min_sequence_diff: 50
  create_init_db_snapshot: true
store:
  engine: memory
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.api_port, 9000);
        assert!(config.server.api_uses_ssl);
        assert_eq!(config.replication.data_dir, "/var/lib/replistore");
        assert_eq!(config.replication.catchup_min_sequence_diff, 50);
        assert!(config.replication.create_init_db_snapshot);
        assert_eq!(config.store.engine, "memory");
    }
}
