//! Worker orchestrator configuration (spec §4.8, §6, SPEC_FULL §6).

use std::path::PathBuf;
use std::time::Duration;

use daemon::workspace_namespaced_socket_path;

/// Environment variables recognized by the core (spec §6).
pub mod env {
    pub const RELAY_SOCKET: &str = "RELAY_SOCKET";
    pub const RELAY_AGENT_NAME: &str = "RELAY_AGENT_NAME";
    pub const WORKSPACE_ID: &str = "WORKSPACE_ID";
    pub const AGENT_RELAY_SPAWNER: &str = "AGENT_RELAY_SPAWNER";
    pub const MAX_AGENTS: &str = "MAX_AGENTS";
    pub const DEBUG_SPAWN: &str = "DEBUG_SPAWN";
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub agent: String,
    pub cli: Option<String>,
    /// The wrapped CLI's argv, e.g. `["claude", "--model", "opus"]`.
    pub command: Vec<String>,
    pub daemon_socket: PathBuf,
    pub workspace_id: Option<String>,
    /// Milliseconds of output silence before the control-socket signal
    /// additionally reports idle (spec §4.8 step 2 `--idle-timeout`).
    pub idle_timeout: Duration,
    /// How long the injection queue waits for the idle detector before
    /// falling back to the control-socket silence signal (spec §4.8
    /// `idleBeforeInjectMs`).
    pub idle_before_inject: Duration,
    /// Cap on queued inbound messages before backpressure engages.
    pub queue_max: usize,
    /// Relay command prefix recognized by the output parser (spec §4.9).
    pub relay_prefix: String,
    /// Optional dashboard HTTP port for spawn/release delegation (spec §4.8,
    /// §6 "Spawner HTTP").
    pub dashboard_port: Option<u16>,
    pub max_agents: Option<u32>,
    pub debug_spawn: bool,
    /// How long the verifier waits to see injected text reappear in stdout
    /// before declaring the injection failed (spec §4.8: 2s).
    pub injection_verify_timeout: Duration,
    /// Injection retry budget before `onInjectionFailed` fires (grounded on
    /// the original relay-pty's `max_retries`/`retry_delay_ms`).
    pub max_injection_retries: u32,
    pub injection_retry_delay: Duration,
    /// Log file for worker-side `tracing` output, since stderr is reserved
    /// for the wrapped CLI's own terminal (SPEC_FULL §2 ambient logging).
    pub log_file: Option<PathBuf>,
}

impl WorkerConfig {
    pub fn new(agent: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            agent: agent.into(),
            cli: None,
            command,
            daemon_socket: PathBuf::from(crate::DEFAULT_DAEMON_SOCKET),
            workspace_id: None,
            idle_timeout: Duration::from_millis(500),
            idle_before_inject: Duration::from_millis(500),
            queue_max: 50,
            relay_prefix: crate::parser::DEFAULT_PREFIX.to_string(),
            dashboard_port: None,
            max_agents: None,
            debug_spawn: false,
            injection_verify_timeout: Duration::from_secs(2),
            max_injection_retries: 3,
            injection_retry_delay: Duration::from_millis(300),
            log_file: None,
        }
    }

    /// Overlay the environment variables named in spec §6 (CLI flags take
    /// precedence over these when both are set; SPEC_FULL §6).
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var(env::RELAY_SOCKET) {
            if !v.trim().is_empty() {
                self.daemon_socket = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var(env::RELAY_AGENT_NAME) {
            if !v.trim().is_empty() {
                self.agent = v;
            }
        }
        if let Ok(v) = std::env::var(env::WORKSPACE_ID) {
            let v = v.trim().to_string();
            if !v.is_empty() {
                self.daemon_socket = workspace_namespaced_socket_path(&v, "daemon");
                self.workspace_id = Some(v);
            }
        }
        if let Ok(v) = std::env::var(env::MAX_AGENTS) {
            if let Ok(n) = v.trim().parse() {
                self.max_agents = Some(n);
            }
        }
        if let Ok(v) = std::env::var(env::DEBUG_SPAWN) {
            self.debug_spawn = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    /// The control/injection socket path for this worker (spec §4.8 step 2:
    /// workspace-namespaced when a workspace id is set, else
    /// `/tmp/relay-pty-<name>.sock`).
    pub fn control_socket_path(&self) -> PathBuf {
        match &self.workspace_id {
            Some(ws) => workspace_namespaced_socket_path(ws, &self.agent),
            None => PathBuf::from(format!("/tmp/relay-pty-{}.sock", self.agent)),
        }
    }
}
