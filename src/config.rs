//! Configuration loading and types for the gateway cluster node.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! node: the admin listener, cluster membership and the store, logging,
//! and observability.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::errors::ClusterError;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
pub struct Config {
    /// Admin HTTP listener settings.
    #[serde(default)]
    #[garde(dive)]
    pub server: ServerConfig,

    /// Cluster membership and store settings.
    #[serde(default)]
    #[garde(dive)]
    pub cluster: ClusterConfig,

    /// Logging settings.
    #[serde(default)]
    #[garde(skip)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health routes).
    #[serde(default)]
    #[garde(skip)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Check every field constraint, flattening the garde report into a
    /// [`ClusterError::Config`].
    pub fn check(&self) -> Result<(), ClusterError> {
        self.validate().map_err(|report| ClusterError::Config {
            message: report.to_string(),
        })
    }
}

/// Admin HTTP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    #[garde(length(min = 1))]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    #[garde(skip)]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    #[garde(range(min = 1))]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Role of this node in the store cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    /// Runs an embedded store server and participates in replication.
    #[serde(alias = "replica")]
    Writer,
    /// Consumes the store through a client connection only.
    Reader,
}

impl ClusterRole {
    pub fn is_writer(self) -> bool {
        self == ClusterRole::Writer
    }
}

impl std::fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterRole::Writer => f.write_str("writer"),
            ClusterRole::Reader => f.write_str("reader"),
        }
    }
}

/// Cluster membership and store configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ClusterConfig {
    /// This node's member name; unique across the cluster.
    #[serde(default = "default_member_name")]
    #[garde(length(min = 1, max = 128), pattern(r"^[A-Za-z0-9._-]+$"))]
    pub name: String,

    /// Writer (replica) or reader.
    #[serde(default = "default_role")]
    #[garde(skip)]
    pub role: ClusterRole,

    /// Store engine: `etcd` or `memory`.
    #[serde(default = "default_engine")]
    #[garde(length(min = 1))]
    pub engine: String,

    /// Settings for the `etcd` engine.
    #[serde(default)]
    #[garde(dive)]
    pub etcd: EtcdConfig,

    /// Directory for `members.yaml` and embedded server data.
    #[serde(default = "default_data_dir")]
    #[garde(length(min = 1))]
    pub data_dir: String,

    /// URL other replicas use to reach this node's embedded server.
    #[serde(default = "default_peer_url")]
    #[garde(pattern(r"^https?://"))]
    pub peer_url: String,

    /// URL clients use to reach this node's embedded server.
    #[serde(default = "default_client_url")]
    #[garde(pattern(r"^https?://"))]
    pub client_url: String,

    /// Initial replica set: member name -> peer URL.
    #[serde(default)]
    #[garde(custom(validate_initial_cluster))]
    pub initial_cluster: BTreeMap<String, String>,

    /// Peer URLs to dial when joining an existing cluster.
    #[serde(default)]
    #[garde(inner(pattern(r"^https?://")))]
    pub join_urls: Vec<String>,

    /// Ignore other known peers and bootstrap from this node alone.
    #[serde(default)]
    #[garde(skip)]
    pub force_new_cluster: bool,

    /// Token shared by all replicas of one cluster.
    #[serde(default = "default_cluster_token")]
    #[garde(length(min = 1))]
    pub cluster_token: String,

    /// Per-request deadline in seconds.
    #[serde(default = "default_request_timeout")]
    #[garde(range(min = 1))]
    pub request_timeout: u64,

    /// Heartbeat interval in seconds; also the bootstrap retry backoff.
    #[serde(default = "default_heartbeat_interval")]
    #[garde(range(min = 1))]
    pub heartbeat_interval: u64,

    /// Seconds to wait for the embedded server to become ready.
    #[serde(default = "default_server_start_timeout")]
    #[garde(range(min = 1))]
    pub server_start_timeout: u64,

    /// Seconds between defragmentations after a success.
    #[serde(default = "default_defrag_interval")]
    #[garde(range(min = 1))]
    pub defrag_interval: u64,

    /// Seconds before retrying a failed defragmentation.
    #[serde(default = "default_defrag_failed_interval")]
    #[garde(range(min = 1))]
    pub defrag_failed_interval: u64,

    /// Backend quota handed to the embedded server.
    #[serde(default = "default_quota_backend_bytes")]
    #[garde(skip)]
    pub quota_backend_bytes: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_member_name(),
            role: default_role(),
            engine: default_engine(),
            etcd: EtcdConfig::default(),
            data_dir: default_data_dir(),
            peer_url: default_peer_url(),
            client_url: default_client_url(),
            initial_cluster: BTreeMap::new(),
            join_urls: Vec::new(),
            force_new_cluster: false,
            cluster_token: default_cluster_token(),
            request_timeout: default_request_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            server_start_timeout: default_server_start_timeout(),
            defrag_interval: default_defrag_interval(),
            defrag_failed_interval: default_defrag_failed_interval(),
            quota_backend_bytes: default_quota_backend_bytes(),
        }
    }
}

impl ClusterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Deadline for expensive operations such as defragmentation.
    pub fn long_request_timeout(&self) -> Duration {
        3 * self.request_timeout()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    pub fn server_start_timeout(&self) -> Duration {
        Duration::from_secs(self.server_start_timeout)
    }

    pub fn defrag_interval(&self) -> Duration {
        Duration::from_secs(self.defrag_interval)
    }

    pub fn defrag_failed_interval(&self) -> Duration {
        Duration::from_secs(self.defrag_failed_interval)
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }
}

/// `etcd` engine settings.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct EtcdConfig {
    /// Path to the `etcd` binary run on writer nodes.
    #[serde(default = "default_etcd_binary")]
    #[garde(length(min = 1))]
    pub binary: String,

    /// Client URLs to dial instead of deriving them from peer URLs.
    #[serde(default)]
    #[garde(inner(pattern(r"^https?://")))]
    pub client_endpoints: Vec<String>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            binary: default_etcd_binary(),
            client_endpoints: Vec::new(),
        }
    }
}

fn validate_initial_cluster(value: &BTreeMap<String, String>, _ctx: &()) -> garde::Result {
    for (name, url) in value {
        if name.is_empty() {
            return Err(garde::Error::new("member name must not be empty"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(garde::Error::new(format!(
                "peer URL of {name} must be http(s): {url}"
            )));
        }
    }
    Ok(())
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
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
/// Controls Prometheus metrics collection and the health routes.
/// Both are enabled by default.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Mount the `/health` and `/readyz` routes.
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

fn default_port() -> u16 {
    2381
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_member_name() -> String {
    "gateway-001".to_string()
}

fn default_role() -> ClusterRole {
    ClusterRole::Writer
}

fn default_engine() -> String {
    "etcd".to_string()
}

fn default_etcd_binary() -> String {
    "etcd".to_string()
}

fn default_data_dir() -> String {
    "./data/cluster".to_string()
}

fn default_peer_url() -> String {
    "http://127.0.0.1:2380".to_string()
}

fn default_client_url() -> String {
    "http://127.0.0.1:2379".to_string()
}

fn default_cluster_token() -> String {
    "gateway-cluster".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_server_start_timeout() -> u64 {
    10
}

fn default_defrag_interval() -> u64 {
    3600
}

fn default_defrag_failed_interval() -> u64 {
    60
}

fn default_quota_backend_bytes() -> u64 {
    8 * 1024 * 1024 * 1024 // 8 GiB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load, parse and validate configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    config.check()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.cluster.role, ClusterRole::Writer);
        assert_eq!(config.cluster.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.cluster.defrag_interval(), Duration::from_secs(3600));
        assert_eq!(config.cluster.defrag_failed_interval(), Duration::from_secs(60));
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_long_request_timeout_is_triple() {
        let mut cluster = ClusterConfig::default();
        cluster.request_timeout = 4;
        assert_eq!(cluster.long_request_timeout(), Duration::from_secs(12));
    }

    #[test]
    fn test_role_aliases() {
        let config: Config = serde_yaml::from_str("cluster:\n  role: replica\n").unwrap();
        assert_eq!(config.cluster.role, ClusterRole::Writer);
        let config: Config = serde_yaml::from_str("cluster:\n  role: reader\n").unwrap();
        assert_eq!(config.cluster.role, ClusterRole::Reader);
    }

    #[test]
    fn test_rejects_bad_peer_url() {
        let mut config = Config::default();
        config.cluster.peer_url = "127.0.0.1:2380".to_string();
        let err = config.check().unwrap_err();
        assert!(matches!(err, ClusterError::Config { .. }));
    }

    #[test]
    fn test_rejects_bad_initial_cluster_entry() {
        let mut config = Config::default();
        config
            .cluster
            .initial_cluster
            .insert("gw-2".to_string(), "tcp://10.0.0.2:2380".to_string());
        assert!(config.check().is_err());
    }

    #[test]
    fn test_rejects_zero_request_timeout() {
        let mut config = Config::default();
        config.cluster.request_timeout = 0;
        assert!(config.check().is_err());
    }

    #[test]
    fn test_etcd_section() {
        let config: Config = serde_yaml::from_str(
            "cluster:\n  etcd:\n    binary: /usr/local/bin/etcd\n    client_endpoints:\n      - http://10.0.0.1:2379\n",
        )
        .unwrap();
        assert_eq!(config.cluster.engine, "etcd");
        assert_eq!(config.cluster.etcd.binary, "/usr/local/bin/etcd");
        assert!(config.check().is_ok());

        let mut bad = config.clone();
        bad.cluster.etcd.client_endpoints = vec!["10.0.0.1:2379".to_string()];
        assert!(bad.check().is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cluster.yaml");
        std::fs::write(
            &path,
            "cluster:\n  name: gw-7\n  role: reader\n  join_urls:\n    - http://10.0.0.1:2380\n",
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.cluster.name, "gw-7");
        assert_eq!(config.cluster.join_urls.len(), 1);
    }
}
