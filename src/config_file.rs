//! `--config` TOML overlay (SPEC_FULL §6).
//!
//! Precedence is CLI flag > config file > environment > built-in default,
//! the reverse of the teacher's `sven-config::loader::load` (which has no
//! CLI layer and merges file-then-nothing-else); this binary has a CLI
//! layer on top, so it applies overlays in the opposite order to get the
//! same "most specific wins" result.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigFile {
    pub socket: Option<PathBuf>,
    pub heartbeat_interval_ms: Option<u64>,
    pub max_missed_heartbeats: Option<u32>,
    pub ack_timeout_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub delivery_ttl_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub queue_max: Option<usize>,
    pub dashboard_port: Option<u16>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
        toml::from_str(&text).map_err(|e| anyhow::anyhow!("parsing config file {}: {e}", path.display()))
    }

    pub fn apply_to_daemon(&self, config: &mut daemon::DaemonConfig) {
        if let Some(v) = &self.socket {
            config.socket_path = v.clone();
        }
        if let Some(v) = self.heartbeat_interval_ms {
            config.heartbeat_interval = std::time::Duration::from_millis(v);
        }
        if let Some(v) = self.max_missed_heartbeats {
            config.max_missed_heartbeats = v;
        }
        if let Some(v) = self.ack_timeout_ms {
            config.ack_timeout = std::time::Duration::from_millis(v);
        }
        if let Some(v) = self.max_attempts {
            config.max_attempts = v;
        }
        if let Some(v) = self.delivery_ttl_ms {
            config.delivery_ttl = std::time::Duration::from_millis(v);
        }
    }

    pub fn apply_to_worker(&self, config: &mut orchestrator::WorkerConfig) {
        if let Some(v) = &self.socket {
            config.daemon_socket = v.clone();
        }
        if let Some(v) = self.idle_timeout_ms {
            config.idle_timeout = std::time::Duration::from_millis(v);
        }
        if let Some(v) = self.queue_max {
            config.queue_max = v;
        }
        if let Some(v) = self.dashboard_port {
            config.dashboard_port = Some(v);
        }
    }
}
