//! Membership registry.
//!
//! Tracks this node's identity, the store's last reported member list, and
//! every peer URL this node has ever learned about.  The view is persisted
//! to `<data_dir>/members.yaml` after each merge so a restarted node keeps
//! its store-assigned id and can still find its peers.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::store::Member;
use crate::config::ClusterConfig;
use crate::errors::ClusterError;

const MEMBERS_FILE: &str = "members.yaml";

/// Who this node is in the store's member list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberIdentity {
    pub name: String,
    /// Store-assigned id; 0 until the store has reported it.
    pub id: u64,
    pub peer_url: String,
}

/// On-disk form of the registry.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MembersFile {
    #[serde(default)]
    self_id: u64,
    #[serde(default)]
    cluster_members: Vec<Member>,
    /// peer URL -> member name (empty when not yet known).
    #[serde(default)]
    known_members: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Inner {
    self_id: u64,
    cluster_members: Vec<Member>,
    known_members: BTreeMap<String, String>,
}

/// Snapshot of the registry for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct MembershipView {
    #[serde(rename = "self")]
    pub self_identity: MemberIdentity,
    pub cluster_members: Vec<Member>,
    pub known_peer_urls: Vec<String>,
}

pub struct Members {
    name: String,
    peer_url: String,
    writer: bool,
    seed_peers: BTreeMap<String, String>,
    join_urls: Vec<String>,
    file: PathBuf,
    inner: RwLock<Inner>,
}

impl Members {
    /// Build the registry from configuration, restoring any persisted view
    /// found under the data directory.
    pub fn new(config: &ClusterConfig) -> Result<Self, ClusterError> {
        let dir = config.data_dir();
        std::fs::create_dir_all(&dir).map_err(|e| ClusterError::Config {
            message: format!("create data dir {} failed: {e}", dir.display()),
        })?;
        let file = dir.join(MEMBERS_FILE);
        let restored = Self::read_file(&file)?;

        let mut inner = Inner {
            self_id: restored.self_id,
            cluster_members: restored.cluster_members,
            known_members: restored.known_members,
        };
        for (name, url) in &config.initial_cluster {
            inner
                .known_members
                .entry(url.clone())
                .or_insert_with(|| name.clone());
        }

        if inner.self_id != 0 {
            info!(
                member = %config.name,
                id = %format!("{:x}", inner.self_id),
                "restored member id from {}",
                file.display()
            );
        }

        Ok(Self {
            name: config.name.clone(),
            peer_url: config.peer_url.clone(),
            writer: config.role.is_writer(),
            seed_peers: config.initial_cluster.clone(),
            join_urls: config.join_urls.clone(),
            file,
            inner: RwLock::new(inner),
        })
    }

    fn read_file(path: &Path) -> Result<MembersFile, ClusterError> {
        if !path.exists() {
            return Ok(MembersFile::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ClusterError::CorruptState {
            key: path.display().to_string(),
            value: String::new(),
            reason: e.to_string(),
        })?;
        serde_yaml::from_str(&contents).map_err(|e| ClusterError::CorruptState {
            key: path.display().to_string(),
            value: contents.clone(),
            reason: e.to_string(),
        })
    }

    /// This node's identity.
    pub fn self_identity(&self) -> MemberIdentity {
        let inner = self.inner.read().expect("rwlock poisoned");
        MemberIdentity {
            name: self.name.clone(),
            id: inner.self_id,
            peer_url: self.peer_url.clone(),
        }
    }

    /// Every peer URL worth dialing, sorted and de-duplicated.
    pub fn known_peer_urls(&self) -> Vec<String> {
        let inner = self.inner.read().expect("rwlock poisoned");
        let mut urls: BTreeSet<String> = BTreeSet::new();
        urls.extend(self.seed_peers.values().cloned());
        urls.extend(self.join_urls.iter().cloned());
        urls.extend(inner.known_members.keys().cloned());
        if self.writer {
            urls.insert(self.peer_url.clone());
        } else {
            urls.remove(&self.peer_url);
        }
        urls.into_iter().collect()
    }

    /// Number of distinct known peers, self included for writers.
    pub fn known_members_len(&self) -> usize {
        self.known_peer_urls().len()
    }

    /// The store's member list as last merged.
    pub fn cluster_members(&self) -> Vec<Member> {
        let inner = self.inner.read().expect("rwlock poisoned");
        inner.cluster_members.clone()
    }

    /// `name=peer_url` pairs for the embedded server's initial cluster,
    /// self included.  Members whose name is still unknown are skipped.
    pub fn initial_cluster(&self) -> Vec<String> {
        let inner = self.inner.read().expect("rwlock poisoned");
        let mut pairs: BTreeMap<String, String> = BTreeMap::new();
        for member in &inner.cluster_members {
            if member.name.is_empty() {
                continue;
            }
            if let Some(url) = member.peer_urls.first() {
                pairs.insert(member.name.clone(), url.clone());
            }
        }
        for (name, url) in &self.seed_peers {
            pairs.entry(name.clone()).or_insert_with(|| url.clone());
        }
        pairs.insert(self.name.clone(), self.peer_url.clone());
        pairs
            .into_iter()
            .map(|(name, url)| format!("{name}={url}"))
            .collect()
    }

    /// Merge a member-list response from the store into the view and
    /// persist it.
    pub fn update_cluster_members(&self, members: &[Member]) {
        let file = {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            for member in members {
                self.observe_self(&mut inner, member);
                for url in &member.peer_urls {
                    let name = inner.known_members.entry(url.clone()).or_default();
                    if !member.name.is_empty() {
                        *name = member.name.clone();
                    }
                }
            }
            inner.cluster_members = members.to_vec();
            MembersFile {
                self_id: inner.self_id,
                cluster_members: inner.cluster_members.clone(),
                known_members: inner.known_members.clone(),
            }
        };
        metrics::gauge!(crate::metrics::CLUSTER_MEMBERS).set(members.len() as f64);

        if let Err(e) = self.write_file(&file) {
            warn!("persist members to {} failed: {e}", self.file.display());
        } else {
            debug!("persisted {} cluster members", file.cluster_members.len());
        }
    }

    /// Record the id of the member a member-add call just created for us.
    pub fn learn_self_id(&self, added: &Member) {
        let mut inner = self.inner.write().expect("rwlock poisoned");
        if added.peer_urls.contains(&self.peer_url) && inner.self_id != added.id {
            info!(
                member = %self.name,
                id = %format!("{:x}", added.id),
                "learned self id from member add"
            );
            inner.self_id = added.id;
        }
    }

    /// Learn our id from an entry at our own peer URL: a pending entry
    /// (no name yet) always, a named one only while we have no id.  An
    /// entry under our name that is not ours leaves the id alone.
    fn observe_self(&self, inner: &mut Inner, member: &Member) {
        let at_my_url = member.peer_urls.contains(&self.peer_url);
        let same_name = member.name == self.name;
        let ours = at_my_url && (member.name.is_empty() || (same_name && inner.self_id == 0));
        if ours {
            if inner.self_id != member.id {
                info!(
                    member = %self.name,
                    id = %format!("{:x}", member.id),
                    "learned self id from store"
                );
                inner.self_id = member.id;
            }
        } else if same_name && member.id != inner.self_id {
            error!(
                local_name = %self.name,
                local_id = %format!("{:x}", inner.self_id),
                store_id = %format!("{:x}", member.id),
                store_peer_urls = ?member.peer_urls,
                "member identity conflict: store lists our name under another member"
            );
        }
    }

    /// Write to a temp file, then rename over the target.
    fn write_file(&self, file: &MembersFile) -> anyhow::Result<()> {
        let contents = serde_yaml::to_string(file)?;
        let tmp = self.file.with_extension("yaml.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.file)?;
        Ok(())
    }

    pub fn view(&self) -> MembershipView {
        MembershipView {
            self_identity: self.self_identity(),
            cluster_members: self.cluster_members(),
            known_peer_urls: self.known_peer_urls(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterRole;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir, name: &str) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            data_dir: tmp.path().to_str().unwrap().to_string(),
            peer_url: format!("http://{name}:2380"),
            ..ClusterConfig::default()
        }
    }

    fn member(id: u64, name: &str) -> Member {
        Member {
            id,
            name: name.to_string(),
            peer_urls: vec![format!("http://{name}:2380")],
            client_urls: vec![format!("http://{name}:2379")],
        }
    }

    #[test]
    fn test_single_writer_knows_only_itself() {
        let tmp = TempDir::new().unwrap();
        let members = Members::new(&test_config(&tmp, "gw-1")).unwrap();
        assert_eq!(members.known_peer_urls(), vec!["http://gw-1:2380"]);
        assert_eq!(members.known_members_len(), 1);
        assert_eq!(members.self_identity().id, 0);
    }

    #[test]
    fn test_seed_peers_count_as_known() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp, "gw-1");
        config
            .initial_cluster
            .insert("gw-2".to_string(), "http://gw-2:2380".to_string());
        let members = Members::new(&config).unwrap();
        assert_eq!(members.known_members_len(), 2);
        assert_eq!(
            members.initial_cluster(),
            vec!["gw-1=http://gw-1:2380", "gw-2=http://gw-2:2380"]
        );
    }

    #[test]
    fn test_reader_excludes_own_peer_url() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp, "gw-r");
        config.role = ClusterRole::Reader;
        config.join_urls = vec!["http://gw-1:2380".to_string()];
        let members = Members::new(&config).unwrap();
        assert_eq!(members.known_peer_urls(), vec!["http://gw-1:2380"]);
    }

    #[test]
    fn test_update_learns_self_id_and_peers() {
        let tmp = TempDir::new().unwrap();
        let members = Members::new(&test_config(&tmp, "gw-1")).unwrap();
        members.update_cluster_members(&[member(0xa1, "gw-1"), member(0xb2, "gw-2")]);

        assert_eq!(members.self_identity().id, 0xa1);
        assert_eq!(members.cluster_members().len(), 2);
        assert!(members
            .known_peer_urls()
            .contains(&"http://gw-2:2380".to_string()));
    }

    #[test]
    fn test_unnamed_member_matched_by_peer_url() {
        let tmp = TempDir::new().unwrap();
        let members = Members::new(&test_config(&tmp, "gw-3")).unwrap();
        let mut added = member(0xc3, "gw-3");
        added.name.clear();
        members.update_cluster_members(&[member(0xa1, "gw-1"), added]);
        assert_eq!(members.self_identity().id, 0xc3);
    }

    #[test]
    fn test_name_collision_does_not_replace_self_id() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp, "gw-2");
        let members = Members::new(&config).unwrap();
        members.update_cluster_members(&[member(0xb2, "gw-2")]);
        assert_eq!(members.self_identity().id, 0xb2);

        let impostor = Member {
            id: 0xc3,
            name: "gw-2".to_string(),
            peer_urls: vec!["http://10.0.0.9:2380".to_string()],
            client_urls: vec![],
        };
        members.update_cluster_members(&[member(0xa1, "gw-1"), impostor]);
        assert_eq!(members.self_identity().id, 0xb2);
        assert_eq!(Members::new(&config).unwrap().self_identity().id, 0xb2);
    }

    #[test]
    fn test_fresh_node_ignores_its_name_at_another_address() {
        let tmp = TempDir::new().unwrap();
        let members = Members::new(&test_config(&tmp, "gw-2")).unwrap();
        let elsewhere = Member {
            id: 0xc3,
            name: "gw-2".to_string(),
            peer_urls: vec!["http://10.0.0.9:2380".to_string()],
            client_urls: vec![],
        };
        members.update_cluster_members(&[elsewhere]);
        assert_eq!(members.self_identity().id, 0);
    }

    #[test]
    fn test_learn_self_id_from_added_member() {
        let tmp = TempDir::new().unwrap();
        let members = Members::new(&test_config(&tmp, "gw-3")).unwrap();
        let mut added = member(0xc3, "gw-3");
        added.name.clear();
        members.learn_self_id(&added);
        assert_eq!(members.self_identity().id, 0xc3);

        members.learn_self_id(&member(0xd4, "gw-4"));
        assert_eq!(members.self_identity().id, 0xc3);
    }

    #[test]
    fn test_view_survives_restart() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp, "gw-1");
        {
            let members = Members::new(&config).unwrap();
            members.update_cluster_members(&[member(0xa1, "gw-1"), member(0xb2, "gw-2")]);
        }
        let restored = Members::new(&config).unwrap();
        assert_eq!(restored.self_identity().id, 0xa1);
        assert_eq!(restored.cluster_members().len(), 2);
        assert_eq!(restored.known_members_len(), 2);
    }

    #[test]
    fn test_corrupt_members_file_is_reported() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(MEMBERS_FILE), "self_id: [not, a, number").unwrap();
        let err = Members::new(&test_config(&tmp, "gw-1")).err().unwrap();
        assert!(matches!(err, ClusterError::CorruptState { .. }));
    }
}
