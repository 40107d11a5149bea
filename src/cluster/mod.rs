//! Cluster coordination.
//!
//! A [`Cluster`] owns this node's connection to the consensus store and
//! everything hanging off it: the lease, the coordination session and,
//! on writer nodes, the embedded store server.  Construction spawns the
//! bootstrap task, which retries until the node is cluster-ready and then
//! runs the heartbeat loop (plus the defrag loop on writers) until
//! [`Cluster::close`] is called.
//!
//! Every background task is spawned on one [`TaskTracker`] and observes one
//! [`CancellationToken`]; `close` cancels the token, waits for the tracker
//! to drain, and then tears the resources down.

mod bootstrap;
mod defrag;
pub mod etcd;
pub mod heartbeat;
pub mod layout;
pub mod members;
pub mod memory;
mod mutex;
mod purge;
pub mod resources;
pub mod store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use garde::Validate;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::config::ClusterConfig;
use crate::errors::ClusterError;
use layout::Layout;
use members::{Members, MembershipView};
use resources::{Resources, StartOutcome};
use store::{LeaseId, ServerLauncher, StoreConnector};

pub use heartbeat::{MemberStatus, StoreStatus};
pub use mutex::ClusterMutex;

/// Where the node is in its lifecycle.
#[derive(Debug, Clone)]
pub enum Readiness {
    /// Bootstrap is still running (or retrying).
    Bootstrapping,
    /// Bootstrap finished; the heartbeat loop is running.
    Ready,
    /// Bootstrap hit an error it will not retry.
    Fatal(Arc<ClusterError>),
}

pub struct Cluster {
    resources: Arc<Resources>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    readiness: watch::Sender<Readiness>,
    bootstrap_attempts: AtomicU64,
    last_defrag: RwLock<Option<DateTime<Utc>>>,
}

impl Cluster {
    /// Build the coordinator and start bootstrapping in the background.
    ///
    /// Fails only on invalid configuration or an unreadable membership
    /// file; store trouble is retried by the bootstrap task instead.  Must
    /// be called inside a tokio runtime.
    pub fn new(
        config: ClusterConfig,
        connector: Arc<dyn StoreConnector>,
        launcher: Option<Arc<dyn ServerLauncher>>,
    ) -> Result<Arc<Self>, ClusterError> {
        config.validate().map_err(|report| ClusterError::Config {
            message: report.to_string(),
        })?;
        let launcher = if config.role.is_writer() {
            Some(launcher.ok_or_else(|| ClusterError::Config {
                message: "writer nodes need a server launcher".to_string(),
            })?)
        } else {
            None
        };

        let members = Arc::new(Members::new(&config)?);
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        info!(
            member = %config.name,
            role = %config.role,
            "creating cluster"
        );
        let resources = Arc::new(Resources::new(
            config,
            members,
            connector,
            launcher,
            shutdown.clone(),
            tasks.clone(),
        ));
        let (readiness, _) = watch::channel(Readiness::Bootstrapping);
        metrics::gauge!(crate::metrics::CLUSTER_READY).set(0.0);

        let cluster = Arc::new(Self {
            resources,
            shutdown,
            tasks,
            readiness,
            bootstrap_attempts: AtomicU64::new(0),
            last_defrag: RwLock::new(None),
        });
        let runner = Arc::clone(&cluster);
        cluster.tasks.spawn(async move { runner.run().await });
        Ok(cluster)
    }

    pub fn config(&self) -> &ClusterConfig {
        self.resources.config()
    }

    pub fn layout(&self) -> &Layout {
        self.resources.layout()
    }

    /// The lifecycle manager behind this coordinator.
    pub fn resources(&self) -> &Arc<Resources> {
        &self.resources
    }

    pub fn members(&self) -> MembershipView {
        self.resources.members().view()
    }

    // -- Readiness ------------------------------------------------------------

    pub fn readiness(&self) -> Readiness {
        self.readiness.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.readiness.borrow(), Readiness::Ready)
    }

    /// Wait until bootstrap succeeds or gives up.
    ///
    /// Returns the fatal bootstrap error, or `ShuttingDown` when the
    /// cluster is closed first.
    pub async fn wait_ready(&self) -> Result<(), Arc<ClusterError>> {
        let mut rx = self.readiness.subscribe();
        let settled = async {
            match rx
                .wait_for(|r| !matches!(r, Readiness::Bootstrapping))
                .await
            {
                Ok(r) => r.clone(),
                Err(_) => Readiness::Fatal(Arc::new(ClusterError::ShuttingDown)),
            }
        };
        let readiness = tokio::select! {
            r = settled => r,
            _ = self.shutdown.cancelled() => Readiness::Fatal(Arc::new(ClusterError::ShuttingDown)),
        };
        match readiness {
            Readiness::Fatal(e) => Err(e),
            _ => Ok(()),
        }
    }

    /// How many bootstrap attempts have started so far.
    pub fn bootstrap_attempts(&self) -> u64 {
        self.bootstrap_attempts.load(Ordering::SeqCst)
    }

    /// When the last successful defragmentation finished.
    pub fn last_defrag_time(&self) -> Option<DateTime<Utc>> {
        *self.last_defrag.read().expect("rwlock poisoned")
    }

    fn set_readiness(&self, readiness: Readiness) {
        let ready = matches!(readiness, Readiness::Ready);
        self.readiness.send_replace(readiness);
        metrics::gauge!(crate::metrics::CLUSTER_READY).set(if ready { 1.0 } else { 0.0 });
    }

    // -- Administrative surface -----------------------------------------------

    /// Start the embedded server and wait until it is ready.
    pub async fn start_server(&self) -> Result<(), ClusterError> {
        let start = self.resources.start_server().await?;
        match start.wait().await {
            StartOutcome::Ready => Ok(()),
            StartOutcome::TimedOut => Err(ClusterError::ServerTimeout {
                timeout: self.config().server_start_timeout(),
            }),
            StartOutcome::Cancelled => Err(ClusterError::ShuttingDown),
        }
    }

    pub async fn close_server(&self) {
        self.resources.close_server().await;
    }

    pub async fn lease(&self) -> Result<LeaseId, ClusterError> {
        self.resources.get_lease().await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, ClusterError> {
        self.resources.get(key).await
    }

    pub async fn put(&self, key: &str, value: String) -> Result<(), ClusterError> {
        self.resources.put(key, value).await
    }

    /// Write `key` under this node's lease; it disappears if the lease is
    /// revoked, e.g. by a purge.
    pub async fn put_under_lease(&self, key: &str, value: String) -> Result<(), ClusterError> {
        self.resources.put_under_lease(key, value).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, ClusterError> {
        self.resources.delete(key).await
    }

    /// A named distributed lock tied to this node's session.
    pub fn mutex(&self, name: &str) -> ClusterMutex {
        ClusterMutex::new(
            Arc::clone(&self.resources),
            self.resources.layout().lock(name),
        )
    }

    /// Graceful shutdown.
    ///
    /// Stops every background task, then closes the session, the client
    /// and the server, in that order.  Safe to call more than once.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        self.resources.close_session().await;
        self.resources.close_client().await;
        self.resources.close_server().await;

        metrics::gauge!(crate::metrics::CLUSTER_READY).set(0.0);
        info!(member = %self.config().name, "cluster closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterRole;
    use memory::MemoryStore;
    use std::time::Duration;
    use tempfile::TempDir;

    fn writer_config(tmp: &TempDir) -> ClusterConfig {
        ClusterConfig {
            name: "gw-1".to_string(),
            data_dir: tmp.path().to_str().unwrap().to_string(),
            peer_url: "http://gw-1:2380".to_string(),
            client_url: "http://gw-1:2379".to_string(),
            ..ClusterConfig::default()
        }
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let mut config = writer_config(&tmp);
        config.name = "bad name!".to_string();
        let err = Cluster::new(config, store.connector(), Some(store.launcher()))
            .err()
            .unwrap();
        assert!(matches!(err, ClusterError::Config { .. }));
    }

    #[tokio::test]
    async fn test_writer_requires_launcher() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let err = Cluster::new(writer_config(&tmp), store.connector(), None)
            .err()
            .unwrap();
        assert!(matches!(err, ClusterError::Config { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_writer_becomes_ready() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let cluster =
            Cluster::new(writer_config(&tmp), store.connector(), Some(store.launcher())).unwrap();
        cluster.wait_ready().await.unwrap();

        assert!(cluster.is_ready());
        assert_eq!(cluster.bootstrap_attempts(), 1);
        let lease = cluster.lease().await.unwrap();
        assert_eq!(store.value("/leases/gw-1"), Some(lease.to_hex()));
        cluster.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_becomes_ready_without_server() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let mut config = writer_config(&tmp);
        config.role = ClusterRole::Reader;
        config.join_urls = vec!["http://gw-0:2380".to_string()];
        let cluster = Cluster::new(config, store.connector(), Some(store.launcher())).unwrap();
        cluster.wait_ready().await.unwrap();
        assert_eq!(store.counters().launches, 0);
        assert!(cluster.resources().get_server().await.is_err());
        cluster.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_returns_after_close() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        store.fail_next_launches(u32::MAX);
        let cluster =
            Cluster::new(writer_config(&tmp), store.connector(), Some(store.launcher())).unwrap();
        let waiter = {
            let cluster = Arc::clone(&cluster);
            tokio::spawn(async move { cluster.wait_ready().await })
        };
        tokio::time::sleep(Duration::from_secs(12)).await;
        cluster.close().await;
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(*err, ClusterError::ShuttingDown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admin_kv_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let cluster =
            Cluster::new(writer_config(&tmp), store.connector(), Some(store.launcher())).unwrap();
        cluster.wait_ready().await.unwrap();

        cluster.put("/config/a", "1".to_string()).await.unwrap();
        assert_eq!(cluster.get("/config/a").await.unwrap().as_deref(), Some("1"));
        assert!(cluster.delete("/config/a").await.unwrap());
        assert_eq!(cluster.get("/config/a").await.unwrap(), None);
        cluster.close().await;
    }
}
