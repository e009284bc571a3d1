//! Client configuration (spec §4.7, §4.2 handshake, SPEC_FULL §6 config layering).

use std::path::PathBuf;
use std::time::Duration;

use relay_protocol::{Capabilities, EntityType};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    pub agent: String,
    pub entity_type: EntityType,
    pub cli: Option<String>,
    pub is_system_component: bool,
    pub capabilities: Capabilities,
    /// Previously issued resume token, if resuming a known session.
    pub resume_token: Option<String>,
    /// Deadline for `connect()` to either see WELCOME or give up (spec §4.2: 5s HELLO budget, mirrored client-side).
    pub connect_timeout: Duration,
    pub reconnect: BackoffConfig,
}

impl ClientConfig {
    pub fn new(agent: impl Into<String>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            agent: agent.into(),
            entity_type: EntityType::Agent,
            cli: None,
            is_system_component: false,
            capabilities: Capabilities {
                ack: true,
                resume: true,
                max_inflight: Some(256),
                supports_topics: true,
                codec: Some("json".into()),
            },
            resume_token: None,
            connect_timeout: Duration::from_secs(5),
            reconnect: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff parameters for reconnect (spec §4.7).
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base: Duration,
    pub factor: f64,
    pub jitter_min: f64,
    pub jitter_max: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            jitter_min: 0.85,
            jitter_max: 1.15,
            cap: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}
