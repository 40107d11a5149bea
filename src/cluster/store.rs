//! Abstract consensus-store traits.
//!
//! The coordinator never talks to a concrete store.  A backend supplies a
//! [`StoreConnector`] that dials [`StoreClient`]s and, for writer nodes, a
//! [`ServerLauncher`] that starts the local [`EmbeddedServer`].  The traits
//! use manually desugared async methods (pinned boxed futures) so they
//! stay object safe behind `Arc<dyn ...>`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Largest TTL a store lease may carry (about 285 years).
pub const MAX_LEASE_TTL: i64 = 9_000_000_000;

/// Store lease identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub i64);

impl LeaseId {
    /// Render the id the way it is persisted under the lease key: lowercase hex.
    pub fn to_hex(self) -> String {
        format!("{:x}", self.0)
    }

    /// Parse a persisted lease id.
    pub fn from_hex(s: &str) -> Result<Self, std::num::ParseIntError> {
        i64::from_str_radix(s.trim(), 16).map(LeaseId)
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// One entry of the store's authoritative member list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Store-assigned member id.
    pub id: u64,
    /// Member name; empty until the member's server has started.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub peer_urls: Vec<String>,
    #[serde(default)]
    pub client_urls: Vec<String>,
}

/// Response of a member-add call.
#[derive(Debug, Clone)]
pub struct MemberAddResponse {
    /// The member just added.
    pub member: Member,
    /// The full member list after the add.
    pub members: Vec<Member>,
}

/// Options for dialing a store client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub endpoints: Vec<String>,
    pub dial_timeout: Duration,
    pub auto_sync_interval: Duration,
    pub keep_alive_time: Duration,
    pub keep_alive_timeout: Duration,
}

/// Whether the embedded server forms a new cluster or joins one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialClusterState {
    New,
    Existing,
}

/// Configuration handed to a [`ServerLauncher`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub data_dir: std::path::PathBuf,
    pub listen_peer_urls: Vec<String>,
    pub listen_client_urls: Vec<String>,
    pub advertise_peer_urls: Vec<String>,
    pub advertise_client_urls: Vec<String>,
    /// `name=peer_url` pairs, self included.
    pub initial_cluster: Vec<String>,
    pub initial_cluster_state: InitialClusterState,
    pub initial_cluster_token: String,
    pub force_new_cluster: bool,
    pub quota_backend_bytes: u64,
}

impl ServerConfig {
    /// The comma-joined initial cluster string, e.g. `a=http://..,b=http://..`.
    pub fn initial_cluster_string(&self) -> String {
        self.initial_cluster.join(",")
    }
}

/// Async client handle to the store cluster.
pub trait StoreClient: Send + Sync + 'static {
    /// Linearizable read of a single key.
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>>;

    /// Write `value` at `key`, attached to `lease` when given.
    fn put(
        &self,
        key: &str,
        value: String,
        lease: Option<LeaseId>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Delete `key`; returns whether it existed.
    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Grant a new lease with the given TTL in seconds.
    fn grant_lease(
        &self,
        ttl: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<LeaseId>> + Send + '_>>;

    /// Revoke a lease, deleting every key attached to it.
    fn revoke_lease(
        &self,
        lease: LeaseId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// List the store's members.
    fn member_list(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<Member>>> + Send + '_>>;

    /// Add a member reachable at `peer_urls`.
    fn member_add(
        &self,
        peer_urls: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<MemberAddResponse>> + Send + '_>>;

    /// Remove the member with the given id.
    fn member_remove(&self, id: u64)
        -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Defragment the backend of the member serving `endpoint`.
    fn defragment(
        &self,
        endpoint: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Open a coordination session bound to `lease`.
    fn new_session(
        &self,
        lease: LeaseId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn StoreSession>>> + Send + '_>>;

    /// Close the client; later calls fail.
    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

/// Dials [`StoreClient`]s.
pub trait StoreConnector: Send + Sync + 'static {
    fn connect(
        &self,
        options: ClientOptions,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn StoreClient>>> + Send + '_>>;
}

/// Coordination session: lock primitives scoped to one lease.
pub trait StoreSession: Send + Sync + 'static {
    /// The lease every key of this session is attached to.
    fn lease(&self) -> LeaseId;

    /// Try to take the lock `key`; returns false when someone else holds it.
    fn try_lock(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Release the lock `key` if this session holds it.
    fn unlock(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Close the session.  The lease itself is left alone.
    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

/// A running embedded store server.
pub trait EmbeddedServer: Send + Sync + 'static {
    /// Member name the server was started with.
    fn name(&self) -> &str;

    /// Resolves once the server reports ready.
    fn ready(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Whether the server has reported ready.
    fn is_ready(&self) -> bool;

    /// Resolves with the error once the server fails while serving.
    fn failed(&self) -> Pin<Box<dyn Future<Output = anyhow::Error> + Send + '_>>;

    /// Self-reported diagnostics, JSON encoded.
    fn self_stats(&self) -> Vec<u8>;

    /// Stop immediately without draining.
    fn hard_stop(&self);

    /// Stop gracefully; resolves once fully stopped.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Close every client and peer listener.
    fn close_transports(&self);
}

/// Starts [`EmbeddedServer`]s.
pub trait ServerLauncher: Send + Sync + 'static {
    fn launch(
        &self,
        config: ServerConfig,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn EmbeddedServer>>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_hex_round_trip() {
        let lease = LeaseId(0x694d_7c1a_2b3f_0001);
        assert_eq!(lease.to_hex(), "694d7c1a2b3f0001");
        assert_eq!(LeaseId::from_hex("694d7c1a2b3f0001").unwrap(), lease);
    }

    #[test]
    fn test_lease_from_hex_rejects_garbage() {
        assert!(LeaseId::from_hex("not-a-lease").is_err());
        assert!(LeaseId::from_hex("").is_err());
    }

    #[test]
    fn test_initial_cluster_string() {
        let config = ServerConfig {
            name: "a".to_string(),
            data_dir: "/tmp/a".into(),
            listen_peer_urls: vec![],
            listen_client_urls: vec![],
            advertise_peer_urls: vec![],
            advertise_client_urls: vec![],
            initial_cluster: vec!["a=http://a:2380".to_string(), "b=http://b:2380".to_string()],
            initial_cluster_state: InitialClusterState::New,
            initial_cluster_token: "t".to_string(),
            force_new_cluster: false,
            quota_backend_bytes: 0,
        };
        assert_eq!(config.initial_cluster_string(), "a=http://a:2380,b=http://b:2380");
    }
}
