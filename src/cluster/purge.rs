//! Evicting a departed member.

use tracing::{error, info, warn};

use super::store::LeaseId;
use super::Cluster;
use crate::errors::ClusterError;
use crate::metrics::{result_label, PURGES_TOTAL};

impl Cluster {
    /// Remove `member_name` from the store's member list (if listed) and
    /// revoke its lease, which deletes every key it wrote under it.
    ///
    /// Fails with [`ClusterError::NotFound`] when the member has no lease
    /// record; an unknown name mutates nothing.
    pub async fn purge_member(&self, member_name: &str) -> Result<(), ClusterError> {
        let result = self.purge(member_name).await;
        metrics::counter!(PURGES_TOTAL, "result" => result_label(&result)).increment(1);
        match &result {
            Ok(()) => info!(member = %member_name, "purged member"),
            Err(e) => error!(member = %member_name, "purge member failed: {e}"),
        }
        result
    }

    async fn purge(&self, member_name: &str) -> Result<(), ClusterError> {
        let resources = &self.resources;
        let client = resources.get_client().await?;

        let list = resources
            .request("list members", client.member_list())
            .await?;
        match list.iter().find(|m| m.name == member_name) {
            Some(member) => {
                resources
                    .request("remove member", client.member_remove(member.id))
                    .await?;
                info!(
                    member = %member_name,
                    id = %format!("{:x}", member.id),
                    "removed member from store"
                );
            }
            None => warn!(member = %member_name, "member not in store member list"),
        }

        let key = self.layout().other_lease(member_name);
        let value = resources
            .get(&key)
            .await?
            .ok_or_else(|| ClusterError::NotFound { key: key.clone() })?;
        let lease = LeaseId::from_hex(&value).map_err(|e| ClusterError::CorruptState {
            key: key.clone(),
            value: value.clone(),
            reason: e.to_string(),
        })?;

        resources
            .request("revoke lease", client.revoke_lease(lease))
            .await?;
        info!(member = %member_name, lease = %lease, "revoked member lease");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::MemoryStore;
    use crate::config::{ClusterConfig, ClusterRole};
    use tempfile::TempDir;

    fn reader(tmp: &TempDir, store: &std::sync::Arc<MemoryStore>) -> std::sync::Arc<Cluster> {
        let config = ClusterConfig {
            name: "gw-admin".to_string(),
            role: ClusterRole::Reader,
            data_dir: tmp.path().to_str().unwrap().to_string(),
            join_urls: vec!["http://gw-1:2380".to_string()],
            ..ClusterConfig::default()
        };
        Cluster::new(config, store.connector(), None).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_removes_member_and_lease_keys() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        store.seed_member(0xb2, "gw-2", "http://gw-2:2380");
        let lease = store.seed_under_lease("/status/members/gw-2", "status");
        store.seed_with_lease("/leases/gw-2", &lease.to_hex(), lease);
        let cluster = reader(&tmp, &store);
        cluster.wait_ready().await.unwrap();

        cluster.purge_member("gw-2").await.unwrap();
        assert!(store.members().is_empty());
        assert_eq!(store.value("/leases/gw-2"), None);
        assert_eq!(store.value("/status/members/gw-2"), None);
        assert!(!store.lease_exists(lease));
        cluster.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_corrupt_lease_record() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        store.seed_under_lease("/leases/gw-9", "garbage!");
        let cluster = reader(&tmp, &store);
        cluster.wait_ready().await.unwrap();
        let err = cluster.purge_member("gw-9").await.unwrap_err();
        assert!(matches!(err, ClusterError::CorruptState { .. }));
        cluster.close().await;
    }
}
