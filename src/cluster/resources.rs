//! Lazily created, process-wide store resources.
//!
//! [`Resources`] owns four independent slots: the store client, this
//! node's lease, the coordination session, and (writers only) the embedded
//! server.  Each slot sits behind its own `tokio::sync::RwLock`: the cached
//! path takes a shared read lock, and construction re-checks under the
//! write lock so concurrent callers never build a resource twice.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::layout::Layout;
use super::members::Members;
use super::store::{
    ClientOptions, EmbeddedServer, InitialClusterState, LeaseId, ServerConfig, ServerLauncher,
    StoreClient, StoreConnector, StoreSession, MAX_LEASE_TTL,
};
use crate::config::ClusterConfig;
use crate::errors::ClusterError;

// Client dial settings.
const AUTO_SYNC_INTERVAL: Duration = Duration::from_secs(60);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_KEEP_ALIVE_TIME: Duration = Duration::from_secs(60);
const DIAL_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// How a server start attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The server reported ready and is cached.
    Ready,
    /// The server missed the startup timeout and was stopped.
    TimedOut,
    /// Shutdown or an explicit close interrupted the start.
    Cancelled,
}

/// One-shot signal returned by [`Resources::start_server`].
///
/// Every caller racing the same start observes the same outcome.
#[derive(Debug, Clone)]
pub struct ServerStart {
    outcome: watch::Receiver<Option<StartOutcome>>,
}

impl ServerStart {
    fn already_running() -> Self {
        let (_, outcome) = watch::channel(Some(StartOutcome::Ready));
        Self { outcome }
    }

    /// Wait until the start attempt settles.
    pub async fn wait(mut self) -> StartOutcome {
        match self.outcome.wait_for(|o| o.is_some()).await {
            Ok(outcome) => (*outcome).unwrap_or(StartOutcome::Cancelled),
            Err(_) => StartOutcome::Cancelled,
        }
    }
}

enum ServerSlot {
    Stopped,
    Starting {
        server: Arc<dyn EmbeddedServer>,
        outcome: watch::Sender<Option<StartOutcome>>,
    },
    Running {
        server: Arc<dyn EmbeddedServer>,
        monitor: CancellationToken,
    },
}

struct CachedSession {
    /// Client generation the session was opened on.
    generation: u64,
    session: Arc<dyn StoreSession>,
}

fn same_server(a: &Arc<dyn EmbeddedServer>, b: &Arc<dyn EmbeddedServer>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Stop a server: gracefully once it is ready, hard before that.  Client
/// and peer transports are closed either way.
async fn stop_server(server: &Arc<dyn EmbeddedServer>) {
    if server.is_ready() {
        server.close().await;
        info!(member = %server.name(), "server stopped");
    } else {
        server.hard_stop();
        info!(member = %server.name(), "hard stop server");
    }
    server.close_transports();
}

pub struct Resources {
    config: ClusterConfig,
    layout: Layout,
    members: Arc<Members>,
    connector: Arc<dyn StoreConnector>,
    launcher: Option<Arc<dyn ServerLauncher>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,

    client: RwLock<Option<Arc<dyn StoreClient>>>,
    /// Bumped whenever the client slot changes.
    client_generation: AtomicU64,
    lease: RwLock<Option<LeaseId>>,
    lease_persisted: AtomicBool,
    lease_init: Mutex<()>,
    session: RwLock<Option<CachedSession>>,
    server: RwLock<ServerSlot>,
}

impl Resources {
    pub fn new(
        config: ClusterConfig,
        members: Arc<Members>,
        connector: Arc<dyn StoreConnector>,
        launcher: Option<Arc<dyn ServerLauncher>>,
        shutdown: CancellationToken,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            layout: Layout::new(config.name.clone()),
            config,
            members,
            connector,
            launcher,
            shutdown,
            tasks,
            client: RwLock::new(None),
            client_generation: AtomicU64::new(0),
            lease: RwLock::new(None),
            lease_persisted: AtomicBool::new(false),
            lease_init: Mutex::new(()),
            session: RwLock::new(None),
            server: RwLock::new(ServerSlot::Stopped),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn members(&self) -> &Arc<Members> {
        &self.members
    }

    // -- Deadlines ------------------------------------------------------------

    /// Run a store call under the request deadline.
    pub async fn request<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, ClusterError> {
        Self::with_deadline(op, self.config.request_timeout(), fut).await
    }

    /// Run an expensive store call under the long request deadline.
    pub async fn long_request<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, ClusterError> {
        Self::with_deadline(op, self.config.long_request_timeout(), fut).await
    }

    async fn with_deadline<T>(
        op: &'static str,
        timeout: Duration,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, ClusterError> {
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(ClusterError::request(op, source)),
            Err(_) => Err(ClusterError::Deadline { op, timeout }),
        }
    }

    // -- Client ---------------------------------------------------------------

    /// Return the cached client, dialing one on first use.
    pub async fn get_client(&self) -> Result<Arc<dyn StoreClient>, ClusterError> {
        if let Some(client) = self.client.read().await.as_ref() {
            return Ok(Arc::clone(client));
        }

        let mut slot = self.client.write().await;
        // Another caller may have dialed while we waited for the write lock.
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }

        let endpoints = if self.config.force_new_cluster {
            vec![self.members.self_identity().peer_url]
        } else {
            self.members.known_peer_urls()
        };
        info!(endpoints = ?endpoints, "client connect");
        let options = ClientOptions {
            endpoints: endpoints.clone(),
            dial_timeout: DIAL_TIMEOUT,
            auto_sync_interval: AUTO_SYNC_INTERVAL,
            keep_alive_time: DIAL_KEEP_ALIVE_TIME,
            keep_alive_timeout: DIAL_KEEP_ALIVE_TIMEOUT,
        };
        let client = match tokio::time::timeout(DIAL_TIMEOUT, self.connector.connect(options)).await
        {
            Ok(Ok(client)) => client,
            Ok(Err(source)) => return Err(ClusterError::Connection { endpoints, source }),
            Err(_) => {
                return Err(ClusterError::Connection {
                    endpoints,
                    source: anyhow::anyhow!("dial timeout after {DIAL_TIMEOUT:?}"),
                })
            }
        };

        info!("client is ready");
        self.client_generation.fetch_add(1, Ordering::SeqCst);
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Close and forget the cached client.  No-op when there is none.
    pub async fn close_client(&self) {
        let mut slot = self.client.write().await;
        let Some(client) = slot.take() else {
            return;
        };
        self.client_generation.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = client.close().await {
            error!("close client failed: {e}");
        }
    }

    // -- Lease ----------------------------------------------------------------

    /// Return this node's lease.  Never creates one; see [`Self::init_lease`].
    pub async fn get_lease(&self) -> Result<LeaseId, ClusterError> {
        self.lease
            .read()
            .await
            .ok_or(ClusterError::NotReady { resource: "lease" })
    }

    /// Establish this node's lease, recovering the persisted one if any.
    ///
    /// A freshly granted lease is cached before it is written, because the
    /// write itself goes under that lease.  If the write fails the lease
    /// stays cached and the next call retries only the write.
    pub async fn init_lease(&self) -> Result<(), ClusterError> {
        if self.get_lease().await.is_ok() && self.lease_persisted.load(Ordering::SeqCst) {
            return Ok(());
        }

        let _init = self.lease_init.lock().await;
        let key = self.layout.lease();

        if let Ok(lease) = self.get_lease().await {
            if self.lease_persisted.load(Ordering::SeqCst) {
                return Ok(());
            }
            return self.persist_lease(&key, lease).await;
        }

        if let Some(value) = self.get(&key).await? {
            let lease = LeaseId::from_hex(&value).map_err(|e| {
                error!(key = %key, "BUG: parse lease {value} failed: {e}");
                ClusterError::CorruptState {
                    key: key.clone(),
                    value: value.clone(),
                    reason: e.to_string(),
                }
            })?;
            *self.lease.write().await = Some(lease);
            self.lease_persisted.store(true, Ordering::SeqCst);
            info!(lease = %lease, "lease is ready (recovered from {key})");
            return Ok(());
        }

        let client = self.get_client().await?;
        let lease = self
            .request("grant lease", client.grant_lease(MAX_LEASE_TTL))
            .await?;
        *self.lease.write().await = Some(lease);
        info!(lease = %lease, "lease is ready");

        self.persist_lease(&key, lease).await
    }

    async fn persist_lease(&self, key: &str, lease: LeaseId) -> Result<(), ClusterError> {
        self.put_under_lease(key, lease.to_hex())
            .await
            .map_err(|e| ClusterError::Persist {
                key: key.to_string(),
                source: Box::new(e),
            })?;
        self.lease_persisted.store(true, Ordering::SeqCst);
        Ok(())
    }

    // -- Session --------------------------------------------------------------

    /// Return the coordination session, opening one on the current client
    /// and lease when none is cached or the client changed underneath it.
    pub async fn get_session(&self) -> Result<Arc<dyn StoreSession>, ClusterError> {
        let generation = self.client_generation.load(Ordering::SeqCst);
        if let Some(cached) = self.session.read().await.as_ref() {
            if cached.generation == generation {
                return Ok(Arc::clone(&cached.session));
            }
        }

        let mut slot = self.session.write().await;
        let client = self.get_client().await?;
        let generation = self.client_generation.load(Ordering::SeqCst);
        if let Some(cached) = slot.as_ref() {
            if cached.generation == generation {
                return Ok(Arc::clone(&cached.session));
            }
        }
        let lease = self.get_lease().await?;

        if let Some(stale) = slot.take() {
            if let Err(e) = stale.session.close().await {
                warn!("close stale session failed: {e}");
            }
        }
        let session = self
            .request("create session", client.new_session(lease))
            .await?;
        info!(lease = %lease, "session is ready");
        *slot = Some(CachedSession {
            generation,
            session: Arc::clone(&session),
        });
        Ok(session)
    }

    /// Close and forget the cached session.  No-op when there is none.
    pub async fn close_session(&self) {
        let mut slot = self.session.write().await;
        let Some(cached) = slot.take() else {
            return;
        };
        if let Err(e) = cached.session.close().await {
            error!("close session failed: {e}");
        }
    }

    // -- Server ---------------------------------------------------------------

    /// The running embedded server.
    pub async fn get_server(&self) -> Result<Arc<dyn EmbeddedServer>, ClusterError> {
        match &*self.server.read().await {
            ServerSlot::Running { server, .. } => Ok(Arc::clone(server)),
            _ => Err(ClusterError::NotReady { resource: "server" }),
        }
    }

    pub(crate) fn prepare_server_config(&self) -> ServerConfig {
        let config = &self.config;
        let identity = self.members.self_identity();
        let joined = self
            .members
            .cluster_members()
            .iter()
            .any(|m| m.name != identity.name && !m.name.is_empty());
        let initial_cluster_state = if joined && !config.force_new_cluster {
            InitialClusterState::Existing
        } else {
            InitialClusterState::New
        };
        let initial_cluster = if config.force_new_cluster {
            vec![format!("{}={}", identity.name, identity.peer_url)]
        } else {
            self.members.initial_cluster()
        };

        ServerConfig {
            name: identity.name,
            data_dir: config.data_dir().join("store"),
            listen_peer_urls: vec![config.peer_url.clone()],
            listen_client_urls: vec![config.client_url.clone()],
            advertise_peer_urls: vec![config.peer_url.clone()],
            advertise_client_urls: vec![config.client_url.clone()],
            initial_cluster,
            initial_cluster_state,
            initial_cluster_token: config.cluster_token.clone(),
            force_new_cluster: config.force_new_cluster,
            quota_backend_bytes: config.quota_backend_bytes,
        }
    }

    /// Start the embedded server without waiting for it.
    ///
    /// Returns at once with a [`ServerStart`] that settles when the server
    /// reports ready, misses the startup timeout, or is interrupted.  A
    /// running server yields an already-settled `Ready`; a start in flight
    /// is shared rather than duplicated.
    pub async fn start_server(self: &Arc<Self>) -> Result<ServerStart, ClusterError> {
        let launcher = self.launcher.as_ref().ok_or_else(|| ClusterError::Config {
            message: format!("{} nodes run no embedded server", self.config.role),
        })?;
        if self.shutdown.is_cancelled() {
            return Err(ClusterError::ShuttingDown);
        }

        let mut slot = self.server.write().await;
        match &*slot {
            ServerSlot::Running { .. } => return Ok(ServerStart::already_running()),
            ServerSlot::Starting { outcome, .. } => {
                return Ok(ServerStart {
                    outcome: outcome.subscribe(),
                })
            }
            ServerSlot::Stopped => {}
        }

        let server_config = self.prepare_server_config();
        info!(
            member = %server_config.name,
            initial_cluster = %server_config.initial_cluster_string(),
            state = ?server_config.initial_cluster_state,
            "starting server"
        );
        let server = launcher
            .launch(server_config)
            .await
            .map_err(|source| ClusterError::ServerStart { source })?;

        let (outcome, receiver) = watch::channel(None);
        *slot = ServerSlot::Starting {
            server: Arc::clone(&server),
            outcome,
        };
        drop(slot);

        let this = Arc::clone(self);
        self.tasks.spawn(async move { this.await_server_ready(server).await });
        Ok(ServerStart { outcome: receiver })
    }

    async fn await_server_ready(self: Arc<Self>, server: Arc<dyn EmbeddedServer>) {
        let timeout = self.config.server_start_timeout();
        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => StartOutcome::Cancelled,
            _ = server.ready() => StartOutcome::Ready,
            _ = tokio::time::sleep(timeout) => StartOutcome::TimedOut,
        };

        let mut slot = self.server.write().await;
        let signal = match std::mem::replace(&mut *slot, ServerSlot::Stopped) {
            ServerSlot::Starting {
                server: starting,
                outcome,
            } if same_server(&starting, &server) => outcome,
            // Closed or replaced while starting; whoever did that owns it now.
            other => {
                *slot = other;
                return;
            }
        };

        match outcome {
            StartOutcome::Ready => {
                let monitor = self.shutdown.child_token();
                *slot = ServerSlot::Running {
                    server: Arc::clone(&server),
                    monitor: monitor.clone(),
                };
                drop(slot);
                info!(member = %server.name(), "server is ready");
                let this = Arc::clone(&self);
                let watched = Arc::clone(&server);
                self.tasks
                    .spawn(async move { this.monitor_server(watched, monitor).await });
            }
            StartOutcome::TimedOut => {
                warn!(member = %server.name(), "server not ready after {timeout:?}, stopping it");
                stop_server(&server).await;
            }
            StartOutcome::Cancelled => {
                stop_server(&server).await;
            }
        }
        signal.send_replace(Some(outcome));
    }

    /// Force-stop the server if it fails while serving.
    async fn monitor_server(self: Arc<Self>, server: Arc<dyn EmbeddedServer>, monitor: CancellationToken) {
        tokio::select! {
            err = server.failed() => {
                error!(member = %server.name(), "server serve failed: {err}");
                let mut slot = self.server.write().await;
                let owned = matches!(
                    &*slot,
                    ServerSlot::Running { server: running, .. } if same_server(running, &server)
                );
                // Otherwise close_server already took and stopped it.
                if owned {
                    *slot = ServerSlot::Stopped;
                    stop_server(&server).await;
                }
            }
            _ = monitor.cancelled() => {}
        }
    }

    /// Stop and forget the embedded server.  No-op when there is none.
    pub async fn close_server(&self) {
        let mut slot = self.server.write().await;
        match std::mem::replace(&mut *slot, ServerSlot::Stopped) {
            ServerSlot::Running { server, monitor } => {
                monitor.cancel();
                stop_server(&server).await;
            }
            ServerSlot::Starting { server, outcome } => {
                stop_server(&server).await;
                outcome.send_replace(Some(StartOutcome::Cancelled));
            }
            ServerSlot::Stopped => {}
        }
    }

    // -- Key-value ------------------------------------------------------------

    /// Read `key` under the request deadline.
    pub async fn get(&self, key: &str) -> Result<Option<String>, ClusterError> {
        let client = self.get_client().await?;
        self.request("get", client.get(key)).await
    }

    /// Write `key` without a lease.
    pub async fn put(&self, key: &str, value: String) -> Result<(), ClusterError> {
        let client = self.get_client().await?;
        self.request("put", client.put(key, value, None)).await
    }

    /// Write `key` attached to this node's lease, so revoking the lease
    /// deletes it.
    pub async fn put_under_lease(&self, key: &str, value: String) -> Result<(), ClusterError> {
        let lease = self.get_lease().await?;
        let client = self.get_client().await?;
        self.request("put under lease", client.put(key, value, Some(lease)))
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, ClusterError> {
        let client = self.get_client().await?;
        self.request("delete", client.delete(key)).await
    }
}
