//! Cloud-sync outbound hook (spec §4.6, §1 out-of-scope).
//!
//! Cross-machine sync is an opaque external collaborator here: the daemon
//! only needs somewhere to call `update_agents` (debounced) and a way to ask
//! whether a name is known on another daemon instance. No real
//! implementation lives in this crate.

use async_trait::async_trait;

#[async_trait]
pub trait CloudSync: Send + Sync {
    async fn update_agents(&self, agents: Vec<String>);

    /// Attempt delivery to an agent believed to live on a different daemon
    /// instance. Returns `true` if accepted for forwarding.
    async fn send_cross_machine_message(
        &self,
        target_daemon_id: &str,
        target_agent: &str,
        from: &str,
        body: &str,
    ) -> bool;

    /// Resolve a name to a remote daemon id, if a remote agent with that
    /// name is currently known.
    async fn resolve_remote(&self, _agent: &str) -> Option<String> {
        None
    }
}

/// No cloud sync configured — the default for a standalone daemon.
#[derive(Debug, Default)]
pub struct NoopCloudSync;

#[async_trait]
impl CloudSync for NoopCloudSync {
    async fn update_agents(&self, _agents: Vec<String>) {}

    async fn send_cross_machine_message(
        &self,
        _target_daemon_id: &str,
        _target_agent: &str,
        _from: &str,
        _body: &str,
    ) -> bool {
        false
    }
}
