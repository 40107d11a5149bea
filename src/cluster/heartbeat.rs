//! Heartbeat: publish this node's status and refresh the member list.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::Cluster;
use crate::config::ClusterConfig;
use crate::errors::ClusterError;
use crate::metrics::{result_label, HEARTBEATS_TOTAL};

/// Status document published under this node's lease every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    pub options: ClusterConfig,
    /// RFC 3339 wall-clock time of the tick that wrote this document.
    pub last_heartbeat_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_defrag_time: Option<String>,
    /// Embedded server state; writers only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatus {
    /// Store member id, hex.
    pub id: String,
    pub start_time: String,
    /// `Leader`, `Follower`, ...
    pub state: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerStats {
    id: String,
    state: String,
    start_time: String,
}

impl StoreStatus {
    /// Parse the embedded server's self-reported diagnostics.
    pub fn from_stats(raw: &[u8]) -> Result<Self, ClusterError> {
        let corrupt = |reason: String| ClusterError::CorruptState {
            key: "server self stats".to_string(),
            value: String::from_utf8_lossy(raw).into_owned(),
            reason,
        };
        let stats: ServerStats = serde_json::from_slice(raw).map_err(|e| corrupt(e.to_string()))?;
        let start_time = DateTime::parse_from_rfc3339(&stats.start_time)
            .map_err(|e| corrupt(format!("start time: {e}")))?
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let state = stats
            .state
            .strip_prefix("State")
            .unwrap_or(&stats.state)
            .to_string();
        Ok(Self {
            id: stats.id,
            start_time,
            state,
        })
    }
}

impl Cluster {
    /// Tick every heartbeat interval until shutdown.  Both steps are best
    /// effort; a failure is logged and the next tick runs as usual.
    pub(super) async fn heartbeat_loop(&self) {
        let interval = self.config().heartbeat_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown.cancelled() => return,
            }
            tokio::select! {
                _ = self.heartbeat() => {}
                _ = self.shutdown.cancelled() => return,
            }
        }
    }

    async fn heartbeat(&self) {
        let status = self.sync_status().await;
        metrics::counter!(HEARTBEATS_TOTAL, "step" => "status", "result" => result_label(&status))
            .increment(1);
        if let Err(e) = status {
            error!("sync status failed: {e}");
        }

        let members = self.update_members().await;
        metrics::counter!(HEARTBEATS_TOTAL, "step" => "members", "result" => result_label(&members))
            .increment(1);
        if let Err(e) = members {
            error!("update members failed: {e}");
        }
    }

    /// Assemble the current status document.
    pub async fn member_status(&self) -> Result<MemberStatus, ClusterError> {
        let store = if self.config().role.is_writer() {
            let server = self.resources.get_server().await?;
            Some(StoreStatus::from_stats(&server.self_stats())?)
        } else {
            None
        };
        Ok(MemberStatus {
            options: self.config().clone(),
            last_heartbeat_time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            last_defrag_time: self
                .last_defrag_time()
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            store,
        })
    }

    /// Write the status document under this node's lease.
    pub(crate) async fn sync_status(&self) -> Result<(), ClusterError> {
        let status = self.member_status().await?;
        let doc = serde_yaml::to_string(&status).map_err(|source| ClusterError::Encode { source })?;
        self.resources
            .put_under_lease(&self.layout().status_member_key(), doc)
            .await
    }

    /// Replace the local membership view with the store's member list.
    pub(crate) async fn update_members(&self) -> Result<(), ClusterError> {
        let client = self.resources.get_client().await?;
        let list = self
            .resources
            .request("list members", client.member_list())
            .await?;
        debug!("store reports {} members", list.len());
        self.resources.members().update_cluster_members(&list);
        Ok(())
    }

    /// This node's status document as last published.
    pub async fn status(&self) -> Result<Option<MemberStatus>, ClusterError> {
        let key = self.layout().status_member_key();
        let Some(doc) = self.resources.get(&key).await? else {
            return Ok(None);
        };
        serde_yaml::from_str(&doc)
            .map(Some)
            .map_err(|e| ClusterError::CorruptState {
                key,
                value: doc.clone(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::MemoryStore;
    use crate::config::ClusterRole;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_stats_state_prefix_is_stripped() {
        let raw = br#"{"id":"8e9e05c52164694d","state":"StateLeader","startTime":"2024-03-01T10:00:00.123456+08:00"}"#;
        let status = StoreStatus::from_stats(raw).unwrap();
        assert_eq!(status.id, "8e9e05c52164694d");
        assert_eq!(status.state, "Leader");
        assert_eq!(status.start_time, "2024-03-01T02:00:00Z");
    }

    #[test]
    fn test_stats_without_prefix_kept_verbatim() {
        let raw = br#"{"id":"1","state":"Follower","startTime":"2024-03-01T02:00:00Z"}"#;
        assert_eq!(StoreStatus::from_stats(raw).unwrap().state, "Follower");
    }

    #[test]
    fn test_garbage_stats_are_corrupt() {
        let err = StoreStatus::from_stats(b"not json").unwrap_err();
        assert!(matches!(err, ClusterError::CorruptState { .. }));
    }

    #[test]
    fn test_status_document_field_names() {
        let status = MemberStatus {
            options: ClusterConfig::default(),
            last_heartbeat_time: "2024-03-01T02:00:00Z".to_string(),
            last_defrag_time: None,
            store: None,
        };
        let doc = serde_yaml::to_string(&status).unwrap();
        assert!(doc.contains("lastHeartbeatTime:"));
        assert!(!doc.contains("lastDefragTime"));
        assert!(!doc.contains("store:"));
    }

    fn config(tmp: &TempDir, role: ClusterRole) -> ClusterConfig {
        ClusterConfig {
            name: "gw-1".to_string(),
            role,
            data_dir: tmp.path().to_str().unwrap().to_string(),
            peer_url: "http://gw-1:2380".to_string(),
            client_url: "http://gw-1:2379".to_string(),
            join_urls: vec!["http://gw-0:2380".to_string()],
            ..ClusterConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_publishes_status_under_lease() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let cluster = Cluster::new(
            config(&tmp, ClusterRole::Writer),
            store.connector(),
            Some(store.launcher()),
        )
        .unwrap();
        cluster.wait_ready().await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        let lease = cluster.lease().await.unwrap();
        assert_eq!(store.lease_of("/status/members/gw-1"), Some(lease));
        let status = cluster.status().await.unwrap().unwrap();
        assert_eq!(status.options.name, "gw-1");
        assert_eq!(status.store.unwrap().state, "Leader");
        cluster.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_status_has_no_store_section() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let cluster =
            Cluster::new(config(&tmp, ClusterRole::Reader), store.connector(), None).unwrap();
        cluster.wait_ready().await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        let status = cluster.status().await.unwrap().unwrap();
        assert!(status.store.is_none());
        cluster.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stops_after_close() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let cluster =
            Cluster::new(config(&tmp, ClusterRole::Reader), store.connector(), None).unwrap();
        cluster.wait_ready().await.unwrap();
        cluster.close().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.value("/status/members/gw-1"), None);
        assert_eq!(store.counters().connects, 1);
    }
}
