//! PTY orchestration: spawns a worker CLI under a pseudo-terminal, parses
//! its output for relay commands, detects idle moments, and injects queued
//! inbound messages (spec C8/C9/C10).

mod config;
mod error;
mod events;
mod idle;
mod orchestrator;
mod parser;
mod protocol;
mod pty;

pub use config::{env, WorkerConfig};
pub use error::OrchestratorError;
pub use events::OrchestratorEvent;
pub use idle::{IdleDetector, IdleStatus};
pub use orchestrator::Orchestrator;
pub use parser::{OutputParser, ParsedCommand};
pub use protocol::{InjectRequest, InjectResponse, InjectStatus};
pub use pty::{locate_native_pty_binary, PtyHandle};

/// Fallback daemon socket path when neither `RELAY_SOCKET` nor
/// `WORKSPACE_ID` is set (mirrors `daemon::config::DEFAULT_SOCKET_PATH`).
pub const DEFAULT_DAEMON_SOCKET: &str = daemon::DEFAULT_SOCKET_PATH;
