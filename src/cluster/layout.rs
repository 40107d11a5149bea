//! Well-known store keys.

const LEASE_PREFIX: &str = "/leases/";
const STATUS_MEMBER_PREFIX: &str = "/status/members/";
const LOCK_PREFIX: &str = "/locks/";

/// Produces the keys this node reads and writes, all derived from the
/// member name.
#[derive(Debug, Clone)]
pub struct Layout {
    member_name: String,
}

impl Layout {
    pub fn new(member_name: impl Into<String>) -> Self {
        Self {
            member_name: member_name.into(),
        }
    }

    /// Key holding this node's hex-encoded lease id.
    pub fn lease(&self) -> String {
        self.other_lease(&self.member_name)
    }

    /// Key holding another member's hex-encoded lease id.
    pub fn other_lease(&self, member_name: &str) -> String {
        format!("{LEASE_PREFIX}{member_name}")
    }

    /// Key holding this node's published status document.
    pub fn status_member_key(&self) -> String {
        self.other_status_member_key(&self.member_name)
    }

    pub fn other_status_member_key(&self, member_name: &str) -> String {
        format!("{STATUS_MEMBER_PREFIX}{member_name}")
    }

    /// Key of a named distributed lock.
    pub fn lock(&self, name: &str) -> String {
        format!("{LOCK_PREFIX}{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_member_scoped() {
        let layout = Layout::new("gw-1");
        assert_eq!(layout.lease(), "/leases/gw-1");
        assert_eq!(layout.other_lease("gw-2"), "/leases/gw-2");
        assert_eq!(layout.status_member_key(), "/status/members/gw-1");
        assert_eq!(layout.lock("rollout"), "/locks/rollout");
    }
}
