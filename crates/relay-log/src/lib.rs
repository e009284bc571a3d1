//! Shared `tracing` setup for the `agent-relay` binaries.
//!
//! Mirrors the teacher's `init_logging` (`sven/src/main.rs`): a TUI-adjacent
//! process must never write to stderr, since a wrapped CLI's own terminal
//! rendering would be corrupted by interleaved log lines. The PTY
//! orchestrator wraps exactly such a process, so it defaults to a log file
//! (`RELAY_LOG_FILE`) and stays silent on stderr unless one is configured;
//! the daemon has no terminal to corrupt and defaults to stderr.

use std::path::Path;

use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

fn env_filter(verbose: bool) -> EnvFilter {
    if let Ok(from_env) = std::env::var("RUST_LOG") {
        return EnvFilter::new(from_env);
    }
    EnvFilter::new(if verbose { "debug" } else { "info" })
}

/// Initialize logging for the daemon: always writes structured logs to
/// stderr, since the daemon owns no terminal that could be disturbed.
pub fn init_daemon_logging(verbose: bool) {
    let _ = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

/// Initialize logging for a PTY orchestrator. If `log_file` is set, logs go
/// there; otherwise logging is suppressed entirely so the wrapped CLI's
/// stdout/stderr stream stays pristine for the output parser and the user's
/// own terminal.
pub fn init_worker_logging(verbose: bool, log_file: Option<&Path>) {
    let Some(path) = log_file else {
        return;
    };
    let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(path) else {
        return;
    };
    let _ = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(fmt::layer().with_writer(file).with_ansi(false).with_target(false))
        .try_init();
}
