use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::resources::Resources;
use crate::errors::ClusterError;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// A named lock held through the coordination session.  The lock key is
/// attached to this node's lease, so it vanishes if the lease is revoked.
pub struct ClusterMutex {
    resources: Arc<Resources>,
    key: String,
}

impl ClusterMutex {
    pub(super) fn new(resources: Arc<Resources>, key: String) -> Self {
        Self { resources, key }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Take the lock, polling until it is free or the request deadline passes.
    pub async fn lock(&self) -> Result<(), ClusterError> {
        let session = self.resources.get_session().await?;
        let timeout = self.resources.config().request_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            if self
                .resources
                .request("lock", session.try_lock(&self.key))
                .await?
            {
                debug!(key = %self.key, "lock acquired");
                return Ok(());
            }
            if Instant::now() + LOCK_RETRY_INTERVAL > deadline {
                return Err(ClusterError::Deadline { op: "lock", timeout });
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    pub async fn unlock(&self) -> Result<(), ClusterError> {
        let session = self.resources.get_session().await?;
        self.resources
            .request("unlock", session.unlock(&self.key))
            .await?;
        debug!(key = %self.key, "lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::cluster::memory::MemoryStore;
    use crate::cluster::store::{ClientOptions, StoreConnector};
    use crate::cluster::Cluster;
    use crate::config::{ClusterConfig, ClusterRole};
    use crate::errors::ClusterError;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test(start_paused = true)]
    async fn test_lock_contended_until_released() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let config = ClusterConfig {
            name: "gw-r".to_string(),
            role: ClusterRole::Reader,
            data_dir: tmp.path().to_str().unwrap().to_string(),
            join_urls: vec!["http://gw-1:2380".to_string()],
            ..ClusterConfig::default()
        };
        let cluster = Cluster::new(config, store.connector(), None).unwrap();
        cluster.wait_ready().await.unwrap();

        // Another node holds the lock.
        let other = store
            .connector()
            .connect(ClientOptions {
                endpoints: vec!["http://gw-1:2380".to_string()],
                dial_timeout: Duration::from_secs(1),
                auto_sync_interval: Duration::from_secs(60),
                keep_alive_time: Duration::from_secs(60),
                keep_alive_timeout: Duration::from_secs(60),
            })
            .await
            .unwrap();
        let lease = other.grant_lease(60).await.unwrap();
        let session = other.new_session(lease).await.unwrap();
        assert!(session.try_lock("/locks/rollout").await.unwrap());

        let mutex = cluster.mutex("rollout");
        let err = mutex.lock().await.unwrap_err();
        assert!(matches!(err, ClusterError::Deadline { op: "lock", .. }));

        session.unlock("/locks/rollout").await.unwrap();
        mutex.lock().await.unwrap();
        assert_eq!(
            store.lease_of("/locks/rollout"),
            Some(cluster.lease().await.unwrap())
        );
        mutex.unlock().await.unwrap();
        assert_eq!(store.value("/locks/rollout"), None);
        cluster.close().await;
    }
}
