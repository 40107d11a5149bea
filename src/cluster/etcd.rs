//! `etcd` engine.
//!
//! [`EtcdConnector`] dials [`EtcdClient`]s on `etcd-client`, and
//! [`EtcdLauncher`] runs the `etcd` binary as a child process for writer
//! nodes.  The coordinator hands the connector peer URLs; they are mapped
//! to client URLs here, either from `cluster.etcd.client_endpoints` or by
//! swapping etcd's well-known peer port for its client port.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use etcd_client::{Client, ConnectOptions, LockOptions, PutOptions};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::{
    ClientOptions, EmbeddedServer, InitialClusterState, LeaseId, Member, MemberAddResponse,
    ServerConfig, ServerLauncher, StoreClient, StoreConnector, StoreSession,
};
use crate::config::ClusterConfig;

const DEFAULT_PEER_PORT: &str = ":2380";
const DEFAULT_CLIENT_PORT: &str = ":2379";

/// Upper bound on one lock attempt before it counts as contended.
const LOCK_ATTEMPT_WINDOW: Duration = Duration::from_millis(100);

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(200);
const STATS_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

// -- Endpoints ----------------------------------------------------------------

/// Maps the peer URLs the coordinator knows to etcd client URLs.
#[derive(Debug, Clone)]
struct Endpoints {
    overrides: Vec<String>,
    peer_url: String,
    client_url: String,
}

impl Endpoints {
    fn from_config(config: &ClusterConfig) -> Self {
        Self {
            overrides: config.etcd.client_endpoints.clone(),
            peer_url: config.peer_url.clone(),
            client_url: config.client_url.clone(),
        }
    }

    fn dial_urls(&self, peer_urls: &[String]) -> Vec<String> {
        if !self.overrides.is_empty() {
            return self.overrides.clone();
        }
        let mut urls: Vec<String> = peer_urls.iter().map(|u| self.client_url_for(u)).collect();
        urls.sort();
        urls.dedup();
        urls
    }

    /// Client URL of the member reachable at `peer_url`.
    fn client_url_for(&self, peer_url: &str) -> String {
        let peer_url = peer_url.trim_end_matches('/');
        if peer_url == self.peer_url.trim_end_matches('/') {
            return self.client_url.clone();
        }
        match peer_url.strip_suffix(DEFAULT_PEER_PORT) {
            Some(host) => format!("{host}{DEFAULT_CLIENT_PORT}"),
            None => peer_url.to_string(),
        }
    }
}

fn connect_options(options: &ClientOptions) -> ConnectOptions {
    ConnectOptions::new()
        .with_connect_timeout(options.dial_timeout)
        .with_keep_alive(options.keep_alive_time, options.keep_alive_timeout)
}

fn member_from(member: &etcd_client::Member) -> Member {
    Member {
        id: member.id(),
        name: member.name().to_string(),
        peer_urls: member.peer_urls().to_vec(),
        client_urls: member.client_urls().to_vec(),
    }
}

// -- Client -------------------------------------------------------------------

pub struct EtcdConnector {
    endpoints: Endpoints,
}

impl EtcdConnector {
    pub fn new(config: &ClusterConfig) -> Arc<Self> {
        Arc::new(Self {
            endpoints: Endpoints::from_config(config),
        })
    }
}

impl StoreConnector for EtcdConnector {
    fn connect(
        &self,
        options: ClientOptions,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn StoreClient>>> + Send + '_>> {
        Box::pin(async move {
            let urls = self.endpoints.dial_urls(&options.endpoints);
            // etcd-client has no endpoint auto-sync; auto_sync_interval is unused.
            debug!(urls = ?urls, "dial etcd");
            let client = Client::connect(urls.clone(), Some(connect_options(&options)))
                .await
                .with_context(|| format!("connect to etcd at {urls:?}"))?;
            let client: Arc<dyn StoreClient> = Arc::new(EtcdClient {
                client,
                options,
                endpoints: self.endpoints.clone(),
                closed: AtomicBool::new(false),
            });
            Ok(client)
        })
    }
}

/// Store client backed by one `etcd_client::Client`.
pub struct EtcdClient {
    client: Client,
    options: ClientOptions,
    endpoints: Endpoints,
    closed: AtomicBool,
}

impl EtcdClient {
    /// `etcd_client::Client` methods take `&mut self`; clones share one channel.
    fn handle(&self) -> anyhow::Result<Client> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("etcd client is closed");
        }
        Ok(self.client.clone())
    }
}

impl StoreClient for EtcdClient {
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut client = self.handle()?;
            let resp = client.get(key, None).await?;
            match resp.kvs().first() {
                Some(kv) => Ok(Some(kv.value_str()?.to_string())),
                None => Ok(None),
            }
        })
    }

    fn put(
        &self,
        key: &str,
        value: String,
        lease: Option<LeaseId>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut client = self.handle()?;
            let options = lease.map(|lease| PutOptions::new().with_lease(lease.0));
            client.put(key, value, options).await?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut client = self.handle()?;
            Ok(client.delete(key, None).await?.deleted() > 0)
        })
    }

    fn grant_lease(
        &self,
        ttl: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<LeaseId>> + Send + '_>> {
        Box::pin(async move {
            let mut client = self.handle()?;
            Ok(LeaseId(client.lease_grant(ttl, None).await?.id()))
        })
    }

    fn revoke_lease(
        &self,
        lease: LeaseId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut client = self.handle()?;
            client.lease_revoke(lease.0).await?;
            Ok(())
        })
    }

    fn member_list(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<Member>>> + Send + '_>> {
        Box::pin(async move {
            let mut client = self.handle()?;
            let resp = client.member_list().await?;
            Ok(resp.members().iter().map(member_from).collect())
        })
    }

    fn member_add(
        &self,
        peer_urls: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<MemberAddResponse>> + Send + '_>> {
        Box::pin(async move {
            let mut client = self.handle()?;
            let resp = client.member_add(peer_urls, None).await?;
            let member = resp
                .member()
                .map(member_from)
                .context("member add response carries no member")?;
            Ok(MemberAddResponse {
                member,
                members: resp.member_list().iter().map(member_from).collect(),
            })
        })
    }

    fn member_remove(&self, id: u64) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut client = self.handle()?;
            client.member_remove(id).await?;
            Ok(())
        })
    }

    fn defragment(
        &self,
        endpoint: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let url = self.endpoints.client_url_for(endpoint);
        Box::pin(async move {
            self.handle()?;
            // Defragment is per member: dial that member alone.
            let mut member = Client::connect([url.as_str()], Some(connect_options(&self.options)))
                .await
                .with_context(|| format!("connect to {url} for defragment"))?;
            member.defragment().await?;
            Ok(())
        })
    }

    fn new_session(
        &self,
        lease: LeaseId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn StoreSession>>> + Send + '_>> {
        Box::pin(async move {
            let session: Arc<dyn StoreSession> = Arc::new(EtcdSession {
                client: self.handle()?,
                lease,
                held: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            });
            Ok(session)
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

// -- Session ------------------------------------------------------------------

/// Locks taken through etcd's lock service, owned by one lease.
pub struct EtcdSession {
    client: Client,
    lease: LeaseId,
    /// Lock name -> ownership key returned by the lock service.
    held: Mutex<HashMap<String, Vec<u8>>>,
    closed: AtomicBool,
}

impl EtcdSession {
    fn take_held(&self, name: &str) -> Option<Vec<u8>> {
        self.held.lock().expect("mutex poisoned").remove(name)
    }
}

impl StoreSession for EtcdSession {
    fn lease(&self) -> LeaseId {
        self.lease
    }

    fn try_lock(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let name = key.to_string();
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                anyhow::bail!("session is closed");
            }
            if self.held.lock().expect("mutex poisoned").contains_key(&name) {
                return Ok(true);
            }
            let mut client = self.client.clone();
            let options = LockOptions::new().with_lease(self.lease.0);
            // Dropping a pending lock call cancels it, and etcd removes the waiter key.
            match tokio::time::timeout(LOCK_ATTEMPT_WINDOW, client.lock(name.clone(), Some(options)))
                .await
            {
                Ok(resp) => {
                    let owner = resp?.key().to_vec();
                    self.held.lock().expect("mutex poisoned").insert(name, owner);
                    Ok(true)
                }
                Err(_) => Ok(false),
            }
        })
    }

    fn unlock(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let owner = self.take_held(key);
        Box::pin(async move {
            if let Some(owner) = owner {
                let mut client = self.client.clone();
                client.unlock(owner).await?;
            }
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            let held = std::mem::take(&mut *self.held.lock().expect("mutex poisoned"));
            let mut client = self.client.clone();
            for (name, owner) in held {
                if let Err(e) = client.unlock(owner).await {
                    warn!(lock = %name, "release lock on session close failed: {e}");
                }
            }
            Ok(())
        })
    }
}

// -- Server -------------------------------------------------------------------

/// Command-line flags for an `etcd` process started from `config`.
fn server_args(config: &ServerConfig) -> Vec<String> {
    let state = match config.initial_cluster_state {
        InitialClusterState::New => "new",
        InitialClusterState::Existing => "existing",
    };
    let mut args = vec![
        format!("--name={}", config.name),
        format!("--data-dir={}", config.data_dir.display()),
        format!("--listen-peer-urls={}", config.listen_peer_urls.join(",")),
        format!("--listen-client-urls={}", config.listen_client_urls.join(",")),
        format!(
            "--initial-advertise-peer-urls={}",
            config.advertise_peer_urls.join(",")
        ),
        format!(
            "--advertise-client-urls={}",
            config.advertise_client_urls.join(",")
        ),
        format!("--initial-cluster={}", config.initial_cluster_string()),
        format!("--initial-cluster-state={state}"),
        format!("--initial-cluster-token={}", config.initial_cluster_token),
        format!("--quota-backend-bytes={}", config.quota_backend_bytes),
    ];
    if config.force_new_cluster {
        args.push("--force-new-cluster".to_string());
    }
    args
}

/// Runs `etcd` child processes.
pub struct EtcdLauncher {
    binary: String,
    http: reqwest::Client,
}

impl EtcdLauncher {
    pub fn new(binary: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            binary: binary.into(),
            http: reqwest::Client::new(),
        })
    }
}

impl ServerLauncher for EtcdLauncher {
    fn launch(
        &self,
        config: ServerConfig,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn EmbeddedServer>>> + Send + '_>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&config.data_dir)
                .await
                .with_context(|| format!("create {}", config.data_dir.display()))?;
            let client_url = config
                .advertise_client_urls
                .first()
                .cloned()
                .context("server config has no advertise client URL")?;

            let mut child = Command::new(&self.binary)
                .args(server_args(&config))
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("spawn {}", self.binary))?;
            let raw_pid = child.id().context("etcd exited before it was supervised")?;
            info!(member = %config.name, pid = raw_pid, "etcd process started");

            let (ready, _) = watch::channel(false);
            let (exited, _) = watch::channel(None);
            let server = Arc::new(EtcdServer {
                name: config.name.clone(),
                pid: Pid::from_raw(raw_pid as i32),
                client_url,
                started_at: Utc::now(),
                ready,
                exited,
                stopping: AtomicBool::new(false),
                stats: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
            });

            // etcd logs to stderr; stdout is normally silent.
            if let Some(stdout) = child.stdout.take() {
                let name = config.name.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(member = %name, "{line}");
                    }
                });
            }
            if let Some(stderr) = child.stderr.take() {
                let name = config.name.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(member = %name, "{line}");
                    }
                });
            }

            let supervised = Arc::clone(&server);
            tokio::spawn(async move {
                let reason = match child.wait().await {
                    Ok(status) => format!("etcd exited with {status}"),
                    Err(e) => format!("wait for etcd failed: {e}"),
                };
                info!(member = %supervised.name, "{reason}");
                supervised.exited.send_replace(Some(reason));
            });

            let polled = Arc::clone(&server);
            let http = self.http.clone();
            tokio::spawn(async move { polled.poll_health(http).await });

            let server: Arc<dyn EmbeddedServer> = server;
            Ok(server)
        })
    }
}

#[derive(Deserialize)]
struct Health {
    health: String,
}

#[derive(Deserialize)]
struct StatusHeader {
    #[serde(default)]
    member_id: String,
}

/// `/v3/maintenance/status` through etcd's JSON gateway.
#[derive(Deserialize)]
struct MaintenanceStatus {
    header: StatusHeader,
    #[serde(default)]
    leader: String,
}

/// One supervised `etcd` process.
pub struct EtcdServer {
    name: String,
    pid: Pid,
    client_url: String,
    started_at: DateTime<Utc>,
    ready: watch::Sender<bool>,
    exited: watch::Sender<Option<String>>,
    /// Set once a stop was requested; exits after that are not failures.
    stopping: AtomicBool,
    stats: Mutex<Vec<u8>>,
    cancel: CancellationToken,
}

impl EtcdServer {
    fn has_exited(&self) -> bool {
        self.exited.borrow().is_some()
    }

    fn signal(&self, sig: Signal) {
        if self.has_exited() {
            return;
        }
        if let Err(e) = signal::kill(self.pid, sig) {
            debug!(member = %self.name, "send {sig:?} failed: {e}");
        }
    }

    /// Poll `/health` until ready, then refresh the cached stats, until
    /// the process exits or is stopped.
    async fn poll_health(self: Arc<Self>, http: reqwest::Client) {
        let mut exited = self.exited.subscribe();
        loop {
            let interval = if self.is_ready() {
                STATS_REFRESH_INTERVAL
            } else {
                HEALTH_POLL_INTERVAL
            };
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => return,
                _ = exited.wait_for(|e| e.is_some()) => return,
            }

            if !self.is_ready() && self.check_health(&http).await {
                info!(member = %self.name, "etcd reports healthy");
                self.ready.send_replace(true);
            }
            if self.is_ready() {
                if let Err(e) = self.refresh_stats(&http).await {
                    debug!(member = %self.name, "refresh etcd status failed: {e}");
                }
            }
        }
    }

    async fn check_health(&self, http: &reqwest::Client) -> bool {
        let url = format!("{}/health", self.client_url.trim_end_matches('/'));
        match http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<Health>()
                .await
                .map(|h| h.health == "true")
                .unwrap_or(false),
            _ => false,
        }
    }

    async fn refresh_stats(&self, http: &reqwest::Client) -> anyhow::Result<()> {
        let url = format!("{}/v3/maintenance/status", self.client_url.trim_end_matches('/'));
        let status: MaintenanceStatus = http
            .post(&url)
            .json(&serde_json::json!({}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let id: u64 = status
            .header
            .member_id
            .parse()
            .with_context(|| format!("member id {:?}", status.header.member_id))?;
        let state = if status.leader == status.header.member_id {
            "StateLeader"
        } else {
            "StateFollower"
        };
        *self.stats.lock().expect("mutex poisoned") = self.render_stats(id, state);
        Ok(())
    }

    fn render_stats(&self, id: u64, state: &str) -> Vec<u8> {
        let stats = serde_json::json!({
            "name": self.name,
            "id": format!("{id:x}"),
            "state": state,
            "startTime": self.started_at.to_rfc3339(),
        });
        serde_json::to_vec(&stats).unwrap_or_default()
    }
}

impl EmbeddedServer for EtcdServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn ready(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let mut rx = self.ready.subscribe();
        Box::pin(async move {
            let _ = rx.wait_for(|ready| *ready).await;
        })
    }

    fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    fn failed(&self) -> Pin<Box<dyn Future<Output = anyhow::Error> + Send + '_>> {
        let mut rx = self.exited.subscribe();
        Box::pin(async move {
            let reason = rx
                .wait_for(|e| e.is_some())
                .await
                .map(|e| e.clone().unwrap_or_default());
            match reason {
                Ok(reason) if !self.stopping.load(Ordering::SeqCst) => anyhow::anyhow!(reason),
                _ => std::future::pending().await,
            }
        })
    }

    fn self_stats(&self) -> Vec<u8> {
        let stats = self.stats.lock().expect("mutex poisoned");
        if stats.is_empty() {
            return self.render_stats(0, "StateUnknown");
        }
        stats.clone()
    }

    fn hard_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        self.signal(Signal::SIGKILL);
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.stopping.store(true, Ordering::SeqCst);
            self.cancel.cancel();
            self.signal(Signal::SIGTERM);
            let mut exited = self.exited.subscribe();
            let stopped = tokio::time::timeout(
                GRACEFUL_STOP_TIMEOUT,
                exited.wait_for(|e| e.is_some()),
            )
            .await
            .is_ok();
            if !stopped {
                warn!(member = %self.name, "etcd ignored SIGTERM for {GRACEFUL_STOP_TIMEOUT:?}, killing it");
                self.signal(Signal::SIGKILL);
            }
        })
    }

    /// The process owns its listeners; they close when it is gone.
    fn close_transports(&self) {
        self.signal(Signal::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(overrides: &[&str]) -> Endpoints {
        let mut config = ClusterConfig {
            peer_url: "http://10.0.0.1:2380".to_string(),
            client_url: "http://10.0.0.1:12379".to_string(),
            ..ClusterConfig::default()
        };
        config.etcd.client_endpoints = overrides.iter().map(|s| s.to_string()).collect();
        Endpoints::from_config(&config)
    }

    #[test]
    fn test_own_peer_url_maps_to_configured_client_url() {
        let ep = endpoints(&[]);
        assert_eq!(ep.client_url_for("http://10.0.0.1:2380/"), "http://10.0.0.1:12379");
    }

    #[test]
    fn test_other_peers_use_well_known_client_port() {
        let ep = endpoints(&[]);
        assert_eq!(
            ep.dial_urls(&[
                "http://10.0.0.2:2380".to_string(),
                "http://10.0.0.3:2380".to_string(),
                "http://10.0.0.3:2380".to_string(),
                "http://10.0.0.4:7001".to_string(),
            ]),
            vec![
                "http://10.0.0.2:2379",
                "http://10.0.0.3:2379",
                "http://10.0.0.4:7001",
            ]
        );
    }

    #[test]
    fn test_configured_client_endpoints_win() {
        let ep = endpoints(&["http://lb.internal:2379"]);
        assert_eq!(
            ep.dial_urls(&["http://10.0.0.2:2380".to_string()]),
            vec!["http://lb.internal:2379"]
        );
        // Defragment still targets the member itself.
        assert_eq!(ep.client_url_for("http://10.0.0.2:2380"), "http://10.0.0.2:2379");
    }

    #[test]
    fn test_server_args() {
        let config = ServerConfig {
            name: "gw-2".to_string(),
            data_dir: "/var/lib/gw/store".into(),
            listen_peer_urls: vec!["http://10.0.0.2:2380".to_string()],
            listen_client_urls: vec!["http://10.0.0.2:2379".to_string()],
            advertise_peer_urls: vec!["http://10.0.0.2:2380".to_string()],
            advertise_client_urls: vec!["http://10.0.0.2:2379".to_string()],
            initial_cluster: vec![
                "gw-1=http://10.0.0.1:2380".to_string(),
                "gw-2=http://10.0.0.2:2380".to_string(),
            ],
            initial_cluster_state: InitialClusterState::Existing,
            initial_cluster_token: "gateway-cluster".to_string(),
            force_new_cluster: false,
            quota_backend_bytes: 1024,
        };
        let args = server_args(&config);
        assert!(args.contains(&"--name=gw-2".to_string()));
        assert!(args.contains(&"--data-dir=/var/lib/gw/store".to_string()));
        assert!(args.contains(
            &"--initial-cluster=gw-1=http://10.0.0.1:2380,gw-2=http://10.0.0.2:2380".to_string()
        ));
        assert!(args.contains(&"--initial-cluster-state=existing".to_string()));
        assert!(args.contains(&"--quota-backend-bytes=1024".to_string()));
        assert!(!args.contains(&"--force-new-cluster".to_string()));

        let forced = ServerConfig {
            force_new_cluster: true,
            initial_cluster_state: InitialClusterState::New,
            ..config
        };
        let args = server_args(&forced);
        assert!(args.contains(&"--force-new-cluster".to_string()));
        assert!(args.contains(&"--initial-cluster-state=new".to_string()));
    }

    #[tokio::test]
    async fn test_missing_binary_fails_launch() {
        let tmp = tempfile::TempDir::new().unwrap();
        let launcher = EtcdLauncher::new("/nonexistent/etcd-binary");
        let config = ServerConfig {
            name: "gw-1".to_string(),
            data_dir: tmp.path().join("store"),
            listen_peer_urls: vec!["http://127.0.0.1:2380".to_string()],
            listen_client_urls: vec!["http://127.0.0.1:2379".to_string()],
            advertise_peer_urls: vec!["http://127.0.0.1:2380".to_string()],
            advertise_client_urls: vec!["http://127.0.0.1:2379".to_string()],
            initial_cluster: vec!["gw-1=http://127.0.0.1:2380".to_string()],
            initial_cluster_state: InitialClusterState::New,
            initial_cluster_token: "t".to_string(),
            force_new_cluster: false,
            quota_backend_bytes: 0,
        };
        let err = launcher.launch(config).await.err().unwrap();
        assert!(err.to_string().contains("spawn /nonexistent/etcd-binary"), "{err}");
    }
}
