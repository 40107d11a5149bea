//! Bootstrap: get the node cluster-ready, then hand over to the loops.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{error, info, warn};

use super::resources::StartOutcome;
use super::{Cluster, Readiness};
use crate::errors::ClusterError;
use crate::metrics::BOOTSTRAP_ATTEMPTS_TOTAL;

/// Once more consecutive failures than this pile up, each retry also logs
/// operator guidance.
const ESCALATE_AFTER_FAILURES: u64 = 4;

const REJOIN_GUIDANCE: &str = "failed to start the store server too many times: \
check that the other members are online and start any that are not; \
if they are online, purge this node, clean its data dir and re-join it";

fn needs_guidance(consecutive_failures: u64) -> bool {
    consecutive_failures > ESCALATE_AFTER_FAILURES
}

impl Cluster {
    /// Retry [`Cluster::get_ready`] until it succeeds, then run the
    /// heartbeat loop (and, on writers, the defrag loop) until shutdown.
    pub(super) async fn run(self: Arc<Self>) {
        let backoff = self.config().heartbeat_interval();
        info!(member = %self.config().name, "starting cluster ...");

        let mut failures: u64 = 0;
        loop {
            let attempt = self.bootstrap_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let result = tokio::select! {
                r = self.get_ready() => r,
                _ = self.shutdown.cancelled() => return,
            };

            match result {
                Ok(()) => {
                    metrics::counter!(BOOTSTRAP_ATTEMPTS_TOTAL, "result" => "ok").increment(1);
                    break;
                }
                Err(e) if e.is_fatal() => {
                    metrics::counter!(BOOTSTRAP_ATTEMPTS_TOTAL, "result" => "fatal").increment(1);
                    error!(attempt, "cluster bootstrap stopped: {e}");
                    self.set_readiness(Readiness::Fatal(Arc::new(e)));
                    return;
                }
                Err(e) => {
                    metrics::counter!(BOOTSTRAP_ATTEMPTS_TOTAL, "result" => "failed").increment(1);
                    failures += 1;
                    error!(attempt, "failed to start cluster, retry in {backoff:?}: {e}");
                    if needs_guidance(failures) {
                        error!(member = %self.config().name, failures, "{REJOIN_GUIDANCE}");
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.cancelled() => return,
            }
        }

        info!(member = %self.config().name, "cluster is ready");
        self.set_readiness(Readiness::Ready);

        if self.config().role.is_writer() {
            let defrag = Arc::clone(&self);
            self.tasks.spawn(async move { defrag.defrag_loop().await });
        }
        self.heartbeat_loop().await;
    }

    /// One bootstrap attempt.
    async fn get_ready(&self) -> Result<(), ClusterError> {
        let resources = &self.resources;
        let config = self.config();

        if !config.role.is_writer() {
            resources.get_client().await?;
            return resources.init_lease().await;
        }

        if !config.force_new_cluster && resources.members().known_members_len() > 1 {
            match self.add_self_to_cluster().await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("add self to cluster failed: {e}"),
            }
        }

        let start = resources.start_server().await?;
        match start.wait().await {
            StartOutcome::Ready => {}
            StartOutcome::TimedOut => {
                return Err(ClusterError::ServerTimeout {
                    timeout: config.server_start_timeout(),
                })
            }
            StartOutcome::Cancelled => return Err(ClusterError::ShuttingDown),
        }
        resources.get_client().await?;

        // Learn our store id before anything can compare identities again.
        if let Err(e) = self.update_members().await {
            warn!("update members after server start failed: {e}");
        }

        resources.init_lease().await
    }

    /// Make sure this node is in the store's member list.
    ///
    /// An entry with our name and id (or a not-yet-started entry at our
    /// peer URL) means we are already a member.  An entry sharing only the
    /// name or only the id is an [`ClusterError::IdentityConflict`].
    /// Otherwise the node is added and the returned list merged.
    pub(crate) async fn add_self_to_cluster(&self) -> Result<(), ClusterError> {
        let resources = &self.resources;
        let client = resources.get_client().await?;
        let list = resources
            .request("list members", client.member_list())
            .await?;
        let me = resources.members().self_identity();

        let mut found = false;
        for member in &list {
            let same_name = member.name == me.name;
            let same_id = me.id != 0 && member.id == me.id;
            let at_my_url = member.peer_urls.contains(&me.peer_url);

            if (same_name && same_id) || (member.name.is_empty() && at_my_url) {
                found = true;
                break;
            }
            // A fresh registry has no id yet; the entry at our own address
            // under our own name is ours.
            if same_name && me.id == 0 && at_my_url {
                found = true;
                break;
            }
            if same_name || same_id {
                error!(
                    local_name = %me.name,
                    local_id = %format!("{:x}", me.id),
                    store_name = %member.name,
                    store_id = %format!("{:x}", member.id),
                    "member identity conflict: purge this node, clean its data dir and re-join it"
                );
                return Err(ClusterError::IdentityConflict {
                    local_name: me.name.clone(),
                    local_id: me.id,
                    store_name: member.name.clone(),
                    store_id: member.id,
                });
            }
        }

        if found {
            resources.members().update_cluster_members(&list);
            return Ok(());
        }

        let added = resources
            .request("add member", client.member_add(vec![me.peer_url.clone()]))
            .await?;
        info!(
            member = %me.name,
            id = %format!("{:x}", added.member.id),
            "added self to member list"
        );
        resources.members().learn_self_id(&added.member);
        resources.members().update_cluster_members(&added.members);
        Ok(())
    }
}
