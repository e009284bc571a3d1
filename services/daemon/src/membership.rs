//! External channel membership store interface (spec §4.3, §4.5).
//!
//! The router treats this store as advisory: it mirrors local joins/leaves
//! into it but never blocks routing on its I/O (spec §5 "routing decisions
//! ... MUST NOT suspend").

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipAction {
    Join,
    Leave,
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn upsert(&self, workspace_id: &str, channel: &str, member: &str, action: MembershipAction);

    async fn list(&self, workspace_id: &str, channel: &str) -> Vec<String>;

    async fn list_for_member(&self, workspace_id: &str, member: &str) -> Vec<String>;
}

/// In-memory reference implementation; also doubles as the "no external
/// store configured" default since an empty store behaves identically to
/// none.
#[derive(Debug, Default)]
pub struct InMemoryMembershipStore {
    // (workspace, channel) -> members
    inner: dashmap::DashMap<(String, String), std::collections::HashSet<String>>,
}

#[async_trait]
impl MembershipStore for InMemoryMembershipStore {
    async fn upsert(&self, workspace_id: &str, channel: &str, member: &str, action: MembershipAction) {
        let key = (workspace_id.to_string(), channel.to_string());
        let mut entry = self.inner.entry(key).or_default();
        match action {
            MembershipAction::Join => {
                entry.insert(member.to_string());
            }
            MembershipAction::Leave => {
                entry.remove(member);
            }
        }
    }

    async fn list(&self, workspace_id: &str, channel: &str) -> Vec<String> {
        self.inner
            .get(&(workspace_id.to_string(), channel.to_string()))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn list_for_member(&self, workspace_id: &str, member: &str) -> Vec<String> {
        self.inner
            .iter()
            .filter(|entry| entry.key().0 == workspace_id && entry.value().contains(member))
            .map(|entry| entry.key().1.clone())
            .collect()
    }
}
