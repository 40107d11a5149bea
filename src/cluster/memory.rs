//! In-process store engine.
//!
//! [`MemoryStore`] holds one cluster's entire state behind a single mutex:
//! keys with their owning lease, live leases, the member list, and the
//! locks taken through sessions.  Every client dialed by
//! [`MemoryConnector`] and every server started by [`MemoryLauncher`]
//! shares that state, so reads are trivially linearizable and revoking a
//! lease deletes its keys atomically.
//!
//! Fault knobs (`fail_next_*`, `stall_next_servers`) and operation
//! counters let tests drive the coordinator through partial failures.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info};

use super::store::{
    ClientOptions, EmbeddedServer, LeaseId, Member, MemberAddResponse, ServerConfig,
    ServerLauncher, StoreClient, StoreConnector, StoreSession,
};

/// Delay before a launched server reports ready.
const DEFAULT_READY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

#[derive(Debug, Default)]
struct State {
    kv: BTreeMap<String, Entry>,
    leases: BTreeSet<LeaseId>,
    members: Vec<Member>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_connects: AtomicU32,
    fail_launches: AtomicU32,
    stall_servers: AtomicU32,
    fail_defrags: AtomicU32,
    fail_puts: AtomicU32,
}

/// Consume one injected failure if any remain.
fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Operation counters.
#[derive(Debug, Default)]
struct Counters {
    connects: AtomicU64,
    launches: AtomicU64,
    lease_grants: AtomicU64,
    lease_revokes: AtomicU64,
    member_adds: AtomicU64,
    member_removes: AtomicU64,
    defrags: AtomicU64,
    sessions: AtomicU64,
}

/// Point-in-time copy of the operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub connects: u64,
    pub launches: u64,
    pub lease_grants: u64,
    pub lease_revokes: u64,
    pub member_adds: u64,
    pub member_removes: u64,
    pub defrags: u64,
    pub sessions: u64,
}

/// One in-process store cluster.
pub struct MemoryStore {
    state: Mutex<State>,
    faults: Faults,
    counters: Counters,
    ready_delay: Duration,
    servers: Mutex<Vec<Arc<MemoryServer>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Self::with_ready_delay(DEFAULT_READY_DELAY)
    }

    pub fn with_ready_delay(ready_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            faults: Faults::default(),
            counters: Counters::default(),
            ready_delay,
            servers: Mutex::new(Vec::new()),
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector {
            store: Arc::clone(self),
        })
    }

    pub fn launcher(self: &Arc<Self>) -> Arc<MemoryLauncher> {
        Arc::new(MemoryLauncher {
            store: Arc::clone(self),
        })
    }

    // ── Fault injection ────────────────────────────────────────────

    pub fn fail_next_connects(&self, n: u32) {
        self.faults.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_launches(&self, n: u32) {
        self.faults.fail_launches.store(n, Ordering::SeqCst);
    }

    /// The next `n` launched servers never report ready.
    pub fn stall_next_servers(&self, n: u32) {
        self.faults.stall_servers.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_defrags(&self, n: u32) {
        self.faults.fail_defrags.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_puts(&self, n: u32) {
        self.faults.fail_puts.store(n, Ordering::SeqCst);
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub fn counters(&self) -> CounterSnapshot {
        let c = &self.counters;
        CounterSnapshot {
            connects: c.connects.load(Ordering::SeqCst),
            launches: c.launches.load(Ordering::SeqCst),
            lease_grants: c.lease_grants.load(Ordering::SeqCst),
            lease_revokes: c.lease_revokes.load(Ordering::SeqCst),
            member_adds: c.member_adds.load(Ordering::SeqCst),
            member_removes: c.member_removes.load(Ordering::SeqCst),
            defrags: c.defrags.load(Ordering::SeqCst),
            sessions: c.sessions.load(Ordering::SeqCst),
        }
    }

    /// Current value at `key`.
    pub fn value(&self, key: &str) -> Option<String> {
        let state = self.state.lock().expect("mutex poisoned");
        state.kv.get(key).map(|e| e.value.clone())
    }

    /// Lease `key` is attached to, if any.
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let state = self.state.lock().expect("mutex poisoned");
        state.kv.get(key).and_then(|e| e.lease)
    }

    pub fn lease_exists(&self, lease: LeaseId) -> bool {
        let state = self.state.lock().expect("mutex poisoned");
        state.leases.contains(&lease)
    }

    pub fn members(&self) -> Vec<Member> {
        let state = self.state.lock().expect("mutex poisoned");
        state.members.clone()
    }

    /// Every server launched so far, stopped ones included.
    pub fn servers(&self) -> Vec<Arc<MemoryServer>> {
        self.servers.lock().expect("mutex poisoned").clone()
    }

    /// Insert a named member directly, as if it had joined earlier.
    pub fn seed_member(&self, id: u64, name: &str, peer_url: &str) -> Member {
        let member = Member {
            id,
            name: name.to_string(),
            peer_urls: vec![peer_url.to_string()],
            client_urls: Vec::new(),
        };
        let mut state = self.state.lock().expect("mutex poisoned");
        state.members.push(member.clone());
        member
    }

    /// Grant a lease and write `key` under it without going through a client.
    pub fn seed_under_lease(&self, key: &str, value: &str) -> LeaseId {
        let mut state = self.state.lock().expect("mutex poisoned");
        let lease = Self::allocate_lease(&mut state);
        state.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease: Some(lease),
            },
        );
        lease
    }

    /// Write `key` under an existing lease without going through a client.
    pub fn seed_with_lease(&self, key: &str, value: &str, lease: LeaseId) {
        let mut state = self.state.lock().expect("mutex poisoned");
        state.leases.insert(lease);
        state.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease: Some(lease),
            },
        );
    }

    fn allocate_lease(state: &mut State) -> LeaseId {
        let mut rng = rand::thread_rng();
        loop {
            let lease = LeaseId(rng.gen_range(1..i64::MAX));
            if state.leases.insert(lease) {
                return lease;
            }
        }
    }

    fn allocate_member_id(state: &State) -> u64 {
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(1..u64::MAX);
            if state.members.iter().all(|m| m.id != id) {
                return id;
            }
        }
    }

    /// Attach a started server to its member entry, naming it.
    fn register_server(&self, config: &ServerConfig) -> u64 {
        let mut state = self.state.lock().expect("mutex poisoned");
        let peer_url = config.advertise_peer_urls.first().cloned().unwrap_or_default();
        if config.force_new_cluster {
            state.members.retain(|m| m.peer_urls.contains(&peer_url));
        }
        if let Some(member) = state
            .members
            .iter_mut()
            .find(|m| m.peer_urls.contains(&peer_url))
        {
            member.name = config.name.clone();
            member.client_urls = config.advertise_client_urls.clone();
            return member.id;
        }
        let id = Self::allocate_member_id(&state);
        state.members.push(Member {
            id,
            name: config.name.clone(),
            peer_urls: vec![peer_url],
            client_urls: config.advertise_client_urls.clone(),
        });
        id
    }

    fn is_leader(&self, id: u64) -> bool {
        let state = self.state.lock().expect("mutex poisoned");
        state
            .members
            .iter()
            .find(|m| !m.name.is_empty())
            .map(|m| m.id == id)
            .unwrap_or(false)
    }
}

// ── Client ─────────────────────────────────────────────────────────

/// Dials [`MemoryClient`]s against one [`MemoryStore`].
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
}

impl StoreConnector for MemoryConnector {
    fn connect(
        &self,
        options: ClientOptions,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn StoreClient>>> + Send + '_>> {
        Box::pin(async move {
            self.store.counters.connects.fetch_add(1, Ordering::SeqCst);
            if options.endpoints.is_empty() {
                anyhow::bail!("no endpoints to dial");
            }
            if take(&self.store.faults.fail_connects) {
                anyhow::bail!("context deadline exceeded dialing {:?}", options.endpoints);
            }
            debug!(endpoints = ?options.endpoints, "memory client dialed");
            let client: Arc<dyn StoreClient> = Arc::new(MemoryClient {
                store: Arc::clone(&self.store),
                endpoints: options.endpoints,
                closed: AtomicBool::new(false),
            });
            Ok(client)
        })
    }
}

/// Client handle onto a [`MemoryStore`].
pub struct MemoryClient {
    store: Arc<MemoryStore>,
    endpoints: Vec<String>,
    closed: AtomicBool,
}

impl MemoryClient {
    fn check_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("client to {:?} is closed", self.endpoints);
        }
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.store.state.lock().expect("mutex poisoned")
    }
}

impl StoreClient for MemoryClient {
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check_open()?;
            let state = self.lock_state();
            Ok(state.kv.get(&key).map(|e| e.value.clone()))
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
            self.check_open()?;
            if take(&self.store.faults.fail_puts) {
                anyhow::bail!("put {key}: etcdserver: request timed out");
            }
            let mut state = self.lock_state();
            if let Some(lease) = lease {
                if !state.leases.contains(&lease) {
                    anyhow::bail!("requested lease {lease} not found");
                }
            }
            state.kv.insert(key, Entry { value, lease });
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check_open()?;
            let mut state = self.lock_state();
            Ok(state.kv.remove(&key).is_some())
        })
    }

    fn grant_lease(
        &self,
        ttl: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<LeaseId>> + Send + '_>> {
        Box::pin(async move {
            self.check_open()?;
            if ttl <= 0 {
                anyhow::bail!("lease TTL must be positive, got {ttl}");
            }
            let mut state = self.lock_state();
            let lease = MemoryStore::allocate_lease(&mut state);
            self.store.counters.lease_grants.fetch_add(1, Ordering::SeqCst);
            Ok(lease)
        })
    }

    fn revoke_lease(
        &self,
        lease: LeaseId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.check_open()?;
            let mut state = self.lock_state();
            if !state.leases.remove(&lease) {
                anyhow::bail!("requested lease {lease} not found");
            }
            state.kv.retain(|_, e| e.lease != Some(lease));
            self.store.counters.lease_revokes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn member_list(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<Member>>> + Send + '_>> {
        Box::pin(async move {
            self.check_open()?;
            Ok(self.lock_state().members.clone())
        })
    }

    fn member_add(
        &self,
        peer_urls: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<MemberAddResponse>> + Send + '_>> {
        Box::pin(async move {
            self.check_open()?;
            let mut state = self.lock_state();
            if state
                .members
                .iter()
                .any(|m| m.peer_urls.iter().any(|u| peer_urls.contains(u)))
            {
                anyhow::bail!("peer URLs {peer_urls:?} already exist");
            }
            let member = Member {
                id: MemoryStore::allocate_member_id(&state),
                name: String::new(),
                peer_urls,
                client_urls: Vec::new(),
            };
            state.members.push(member.clone());
            self.store.counters.member_adds.fetch_add(1, Ordering::SeqCst);
            Ok(MemberAddResponse {
                member,
                members: state.members.clone(),
            })
        })
    }

    fn member_remove(
        &self,
        id: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.check_open()?;
            let mut state = self.lock_state();
            let before = state.members.len();
            state.members.retain(|m| m.id != id);
            if state.members.len() == before {
                anyhow::bail!("member {id:x} not found");
            }
            self.store.counters.member_removes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn defragment(
        &self,
        endpoint: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let endpoint = endpoint.to_string();
        Box::pin(async move {
            self.check_open()?;
            if take(&self.store.faults.fail_defrags) {
                anyhow::bail!("defragment {endpoint}: backend busy");
            }
            let known = self
                .lock_state()
                .members
                .iter()
                .any(|m| m.peer_urls.contains(&endpoint) || m.client_urls.contains(&endpoint));
            if !known {
                anyhow::bail!("no member serves {endpoint}");
            }
            self.store.counters.defrags.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn new_session(
        &self,
        lease: LeaseId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn StoreSession>>> + Send + '_>> {
        Box::pin(async move {
            self.check_open()?;
            if !self.lock_state().leases.contains(&lease) {
                anyhow::bail!("requested lease {lease} not found");
            }
            self.store.counters.sessions.fetch_add(1, Ordering::SeqCst);
            let session: Arc<dyn StoreSession> = Arc::new(MemorySession {
                store: Arc::clone(&self.store),
                lease,
                held: Mutex::new(BTreeSet::new()),
                closed: AtomicBool::new(false),
            });
            Ok(session)
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                anyhow::bail!("client already closed");
            }
            Ok(())
        })
    }
}

// ── Session ────────────────────────────────────────────────────────

/// Session whose locks are keys attached to its lease.
pub struct MemorySession {
    store: Arc<MemoryStore>,
    lease: LeaseId,
    held: Mutex<BTreeSet<String>>,
    closed: AtomicBool,
}

impl MemorySession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl StoreSession for MemorySession {
    fn lease(&self) -> LeaseId {
        self.lease
    }

    fn try_lock(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            if self.is_closed() {
                anyhow::bail!("session is closed");
            }
            let mut state = self.store.state.lock().expect("mutex poisoned");
            if !state.leases.contains(&self.lease) {
                anyhow::bail!("session lease {} expired", self.lease);
            }
            match state.kv.get(&key) {
                Some(entry) => Ok(entry.lease == Some(self.lease)),
                None => {
                    state.kv.insert(
                        key.clone(),
                        Entry {
                            value: self.lease.to_hex(),
                            lease: Some(self.lease),
                        },
                    );
                    self.held.lock().expect("mutex poisoned").insert(key);
                    Ok(true)
                }
            }
        })
    }

    fn unlock(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut state = self.store.state.lock().expect("mutex poisoned");
            if state.kv.get(&key).map(|e| e.lease) == Some(Some(self.lease)) {
                state.kv.remove(&key);
            }
            self.held.lock().expect("mutex poisoned").remove(&key);
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            let held = std::mem::take(&mut *self.held.lock().expect("mutex poisoned"));
            let mut state = self.store.state.lock().expect("mutex poisoned");
            for key in held {
                if state.kv.get(&key).map(|e| e.lease) == Some(Some(self.lease)) {
                    state.kv.remove(&key);
                }
            }
            Ok(())
        })
    }
}

// ── Embedded server ────────────────────────────────────────────────

/// Starts [`MemoryServer`]s that join a [`MemoryStore`].
pub struct MemoryLauncher {
    store: Arc<MemoryStore>,
}

impl ServerLauncher for MemoryLauncher {
    fn launch(
        &self,
        config: ServerConfig,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn EmbeddedServer>>> + Send + '_>> {
        Box::pin(async move {
            self.store.counters.launches.fetch_add(1, Ordering::SeqCst);
            if take(&self.store.faults.fail_launches) {
                anyhow::bail!("listen on {:?}: address already in use", config.listen_peer_urls);
            }
            let stalled = take(&self.store.faults.stall_servers);
            let (ready, _) = watch::channel(false);
            let (failure, _) = watch::channel(None);
            let server = Arc::new(MemoryServer {
                store: Arc::clone(&self.store),
                config,
                id: AtomicU64::new(0),
                started_at: chrono::Utc::now(),
                ready,
                failure,
                stopped: AtomicBool::new(false),
                stop_calls: AtomicU64::new(0),
                transports_open: AtomicBool::new(true),
            });
            self.store
                .servers
                .lock()
                .expect("mutex poisoned")
                .push(Arc::clone(&server));

            if !stalled {
                let delay = self.store.ready_delay;
                let starting = Arc::clone(&server);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    starting.mark_ready();
                });
            }
            let server: Arc<dyn EmbeddedServer> = server;
            Ok(server)
        })
    }
}

/// Embedded server living inside a [`MemoryStore`].
pub struct MemoryServer {
    store: Arc<MemoryStore>,
    config: ServerConfig,
    id: AtomicU64,
    started_at: chrono::DateTime<chrono::Utc>,
    ready: watch::Sender<bool>,
    failure: watch::Sender<Option<String>>,
    stopped: AtomicBool,
    stop_calls: AtomicU64,
    transports_open: AtomicBool,
}

impl MemoryServer {
    fn mark_ready(&self) {
        if self.is_stopped() {
            return;
        }
        let id = self.store.register_server(&self.config);
        self.id.store(id, Ordering::SeqCst);
        info!(member = %self.config.name, id = %format!("{id:x}"), "memory server ready");
        self.ready.send_replace(true);
    }

    /// Make the server fail while serving.
    pub fn fail(&self, reason: &str) {
        self.failure.send_replace(Some(reason.to_string()));
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Number of hard stops and graceful closes this server received.
    pub fn stop_calls(&self) -> u64 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn transports_open(&self) -> bool {
        self.transports_open.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl EmbeddedServer for MemoryServer {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn ready(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let mut rx = self.ready.subscribe();
        Box::pin(async move {
            // The sender lives as long as the server, so this only ends on ready.
            let _ = rx.wait_for(|ready| *ready).await;
        })
    }

    fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    fn failed(&self) -> Pin<Box<dyn Future<Output = anyhow::Error> + Send + '_>> {
        let mut rx = self.failure.subscribe();
        Box::pin(async move {
            match rx.wait_for(|f| f.is_some()).await {
                Ok(reason) => anyhow::anyhow!("{}", reason.clone().unwrap_or_default()),
                Err(_) => anyhow::anyhow!("server dropped"),
            }
        })
    }

    fn self_stats(&self) -> Vec<u8> {
        let id = self.id.load(Ordering::SeqCst);
        let state = if !self.is_ready() {
            "StateUnknown"
        } else if self.store.is_leader(id) {
            "StateLeader"
        } else {
            "StateFollower"
        };
        let stats = serde_json::json!({
            "name": self.config.name,
            "id": format!("{id:x}"),
            "state": state,
            "startTime": self.started_at.to_rfc3339(),
        });
        serde_json::to_vec(&stats).unwrap_or_default()
    }

    fn hard_stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            self.stopped.store(true, Ordering::SeqCst);
            tokio::task::yield_now().await;
        })
    }

    fn close_transports(&self) {
        self.transports_open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::store::InitialClusterState;

    fn options() -> ClientOptions {
        ClientOptions {
            endpoints: vec!["http://gw-1:2380".to_string()],
            dial_timeout: Duration::from_secs(1),
            auto_sync_interval: Duration::from_secs(60),
            keep_alive_time: Duration::from_secs(60),
            keep_alive_timeout: Duration::from_secs(60),
        }
    }

    fn server_config(name: &str) -> ServerConfig {
        let peer = format!("http://{name}:2380");
        ServerConfig {
            name: name.to_string(),
            data_dir: std::env::temp_dir(),
            listen_peer_urls: vec![peer.clone()],
            listen_client_urls: vec![],
            advertise_peer_urls: vec![peer.clone()],
            advertise_client_urls: vec![],
            initial_cluster: vec![format!("{name}={peer}")],
            initial_cluster_state: InitialClusterState::New,
            initial_cluster_token: "test".to_string(),
            force_new_cluster: false,
            quota_backend_bytes: 0,
        }
    }

    #[tokio::test]
    async fn test_revoke_deletes_only_keys_of_that_lease() {
        let store = MemoryStore::new();
        let client = store.connector().connect(options()).await.unwrap();
        let mine = client.grant_lease(60).await.unwrap();
        let theirs = client.grant_lease(60).await.unwrap();
        client.put("/a", "1".to_string(), Some(mine)).await.unwrap();
        client.put("/b", "2".to_string(), Some(theirs)).await.unwrap();
        client.put("/c", "3".to_string(), None).await.unwrap();

        client.revoke_lease(mine).await.unwrap();

        assert_eq!(client.get("/a").await.unwrap(), None);
        assert_eq!(client.get("/b").await.unwrap().as_deref(), Some("2"));
        assert_eq!(client.get("/c").await.unwrap().as_deref(), Some("3"));
        assert!(client.revoke_lease(mine).await.is_err());
    }

    #[tokio::test]
    async fn test_put_under_unknown_lease_fails() {
        let store = MemoryStore::new();
        let client = store.connector().connect(options()).await.unwrap();
        assert!(client
            .put("/a", "1".to_string(), Some(LeaseId(42)))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let store = MemoryStore::new();
        let client = store.connector().connect(options()).await.unwrap();
        client.close().await.unwrap();
        assert!(client.get("/a").await.is_err());
        assert!(client.close().await.is_err());
    }

    #[tokio::test]
    async fn test_injected_connect_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_connects(1);
        let connector = store.connector();
        assert!(connector.connect(options()).await.is_err());
        assert!(connector.connect(options()).await.is_ok());
        assert_eq!(store.counters().connects, 2);
    }

    #[tokio::test]
    async fn test_member_add_rejects_duplicate_peer_url() {
        let store = MemoryStore::new();
        store.seed_member(7, "gw-1", "http://gw-1:2380");
        let client = store.connector().connect(options()).await.unwrap();
        assert!(client
            .member_add(vec!["http://gw-1:2380".to_string()])
            .await
            .is_err());
        let added = client
            .member_add(vec!["http://gw-2:2380".to_string()])
            .await
            .unwrap();
        assert!(added.member.name.is_empty());
        assert_eq!(added.members.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_registers_on_ready() {
        let store = MemoryStore::new();
        let server = store.launcher().launch(server_config("gw-1")).await.unwrap();
        assert!(!server.is_ready());
        server.ready().await;
        assert!(server.is_ready());

        let members = store.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "gw-1");

        let stats: serde_json::Value = serde_json::from_slice(&server.self_stats()).unwrap();
        assert_eq!(stats["state"], "StateLeader");
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_names_added_member() {
        let store = MemoryStore::new();
        let client = store.connector().connect(options()).await.unwrap();
        let added = client
            .member_add(vec!["http://gw-2:2380".to_string()])
            .await
            .unwrap();
        let server = store.launcher().launch(server_config("gw-2")).await.unwrap();
        server.ready().await;
        let members = store.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, added.member.id);
        assert_eq!(members[0].name, "gw-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_locks_released_on_close() {
        let store = MemoryStore::new();
        let client = store.connector().connect(options()).await.unwrap();
        let a = client.grant_lease(60).await.unwrap();
        let b = client.grant_lease(60).await.unwrap();
        let first = client.new_session(a).await.unwrap();
        let second = client.new_session(b).await.unwrap();

        assert!(first.try_lock("/locks/x").await.unwrap());
        assert!(!second.try_lock("/locks/x").await.unwrap());
        first.close().await.unwrap();
        assert!(second.try_lock("/locks/x").await.unwrap());
        assert!(store.lease_exists(a));
    }
}
