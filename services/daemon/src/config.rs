//! Daemon configuration (spec §6, SPEC_FULL §6).
//!
//! Follows the teacher's `Config::load()` shape (`sven-node/src/config.rs`):
//! a plain struct with a `from_env` constructor and explicit defaults, no
//! hidden global state.

use std::path::PathBuf;
use std::time::Duration;

/// Default local stream socket path (spec §6).
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/agent-relay.sock";

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub workspace_id: Option<String>,
    /// Heartbeat PING interval (spec §4.2: 30s).
    pub heartbeat_interval: Duration,
    /// Missed PONGs before a connection is dropped (spec §4.2: 2).
    pub max_missed_heartbeats: u32,
    /// ACK timeout before a DELIVER is retransmitted (spec §4.4: 10s default).
    pub ack_timeout: Duration,
    /// Total send attempts before a delivery is dropped (spec §4.4: 3 default).
    pub max_attempts: u32,
    /// TTL from first attempt before a delivery is dropped (spec §4.4: 60s default).
    pub delivery_ttl: Duration,
    /// Default per-connection inflight cap advertised at HELLO (spec §5: 256).
    pub default_max_inflight: u32,
    /// Interval for periodic state-file writers (spec §4.6: 500ms).
    pub state_file_interval: Duration,
    /// Debounce window for cloud-sync agent-list updates (spec §4.6: 1s).
    pub cloud_sync_debounce: Duration,
    /// Interval the delivery tracker scans for due retries/TTL expiry.
    pub tracker_tick_interval: Duration,
    /// Directory the periodic snapshot files (agents.json, ...) are written to.
    pub state_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            workspace_id: None,
            heartbeat_interval: Duration::from_secs(30),
            max_missed_heartbeats: 2,
            ack_timeout: Duration::from_secs(10),
            max_attempts: 3,
            delivery_ttl: Duration::from_secs(60),
            default_max_inflight: 256,
            state_file_interval: Duration::from_millis(500),
            cloud_sync_debounce: Duration::from_secs(1),
            tracker_tick_interval: Duration::from_millis(200),
            state_dir: PathBuf::from("/tmp"),
        }
    }
}

impl DaemonConfig {
    /// Load overrides from the environment variables named in spec §6.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(workspace_id) = std::env::var("WORKSPACE_ID") {
            let workspace_id = workspace_id.trim().to_string();
            if !workspace_id.is_empty() {
                cfg.socket_path = workspace_namespaced_socket_path(&workspace_id, "daemon");
                cfg.state_dir = PathBuf::from(format!("/tmp/relay/{workspace_id}"));
                cfg.workspace_id = Some(workspace_id);
            }
        }

        if let Ok(socket) = std::env::var("RELAY_SOCKET") {
            if !socket.trim().is_empty() {
                cfg.socket_path = PathBuf::from(socket);
            }
        }

        cfg
    }

    pub fn pid_path(&self) -> PathBuf {
        let mut path = self.socket_path.clone().into_os_string();
        path.push(".pid");
        PathBuf::from(path)
    }
}

/// Build a workspace-namespaced socket path, hashing the agent name into the
/// filename when the full path would exceed common platform socket-name
/// limits (spec §4.8, §6).
pub fn workspace_namespaced_socket_path(workspace_id: &str, agent: &str) -> PathBuf {
    const MAX_SUN_PATH: usize = 100; // conservative cross-platform budget

    let candidate = format!("/tmp/relay/{workspace_id}/sockets/{agent}.sock");
    if candidate.len() <= MAX_SUN_PATH {
        return PathBuf::from(candidate);
    }

    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(agent.as_bytes());
    let digest = hasher.finalize();
    let short = hex::encode(&digest[..6]);
    PathBuf::from(format!("/tmp/relay/{workspace_id}/sockets/{short}.sock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_are_not_hashed() {
        let p = workspace_namespaced_socket_path("ws1", "Alice");
        assert_eq!(p, PathBuf::from("/tmp/relay/ws1/sockets/Alice.sock"));
    }

    #[test]
    fn long_names_get_hashed_substitution() {
        let long_name = "x".repeat(200);
        let p = workspace_namespaced_socket_path("ws1", &long_name);
        assert!(p.to_string_lossy().len() <= 100);
        assert!(!p.to_string_lossy().contains(&long_name));
    }
}
