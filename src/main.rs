//! `agent-relay` CLI: runs either the relay daemon or a worker orchestrator
//! that wraps an agent CLI under a pseudo-terminal (spec §5, §6).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use daemon::{CloudSync, DaemonConfig, InMemoryMembershipStore, InMemoryStorage, NoopCloudSync};
use orchestrator::{Orchestrator, OrchestratorEvent, WorkerConfig};
use tracing::{error, info};

mod config_file;
use config_file::ConfigFile;

#[derive(Parser)]
#[command(name = "agent-relay", version, about = "Multi-agent relay message broker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug-level logging.
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay daemon: accepts agent connections over a Unix socket
    /// and routes envelopes between them.
    Daemon {
        /// Override the Unix socket path (defaults to `RELAY_SOCKET` or
        /// the workspace-namespaced default).
        #[arg(long)]
        socket: Option<PathBuf>,
        /// TOML file overlaying environment defaults (SPEC_FULL §6).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Spawn a wrapped CLI under a pseudo-terminal and relay messages into
    /// and out of it.
    Worker {
        /// Name this worker registers as (defaults to `RELAY_AGENT_NAME`).
        #[arg(long)]
        agent: Option<String>,
        /// The CLI identifier reported in HELLO (e.g. "claude", "codex").
        #[arg(long)]
        cli: Option<String>,
        /// Daemon socket to connect to (defaults to `RELAY_SOCKET` or the
        /// workspace-namespaced default).
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Log file for worker-side tracing output (stderr is reserved for
        /// the wrapped CLI's own terminal).
        #[arg(long)]
        log_file: Option<PathBuf>,
        /// Dashboard HTTP port for spawn/release delegation.
        #[arg(long)]
        dashboard_port: Option<u16>,
        /// TOML file overlaying environment defaults (SPEC_FULL §6).
        #[arg(long)]
        config: Option<PathBuf>,
        /// The wrapped CLI's own argv, e.g. `-- claude --model opus`.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { socket, config } => {
            relay_log::init_daemon_logging(cli.verbose);
            run_daemon(socket, config).await
        }
        Commands::Worker { agent, cli: cli_name, socket, log_file, dashboard_port, config, command } => {
            relay_log::init_worker_logging(cli.verbose, log_file.as_deref());
            run_worker(agent, cli_name, socket, log_file, dashboard_port, config, command).await
        }
    }
}

async fn run_daemon(socket: Option<PathBuf>, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = DaemonConfig::from_env();
    if let Some(path) = &config_path {
        ConfigFile::load(path)?.apply_to_daemon(&mut config);
    }
    if let Some(socket) = socket {
        config.socket_path = socket;
    }

    let storage = Arc::new(InMemoryStorage::default());
    let membership = Arc::new(InMemoryMembershipStore::default());
    let cloud_sync: Arc<dyn CloudSync> = Arc::new(NoopCloudSync);

    info!(socket = %config.socket_path.display(), "starting agent-relay daemon");
    daemon::run(config, storage, membership, cloud_sync).await
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    agent: Option<String>,
    cli_name: Option<String>,
    socket: Option<PathBuf>,
    log_file: Option<PathBuf>,
    dashboard_port: Option<u16>,
    config_path: Option<PathBuf>,
    command: Vec<String>,
) -> anyhow::Result<()> {
    let agent_name = agent
        .or_else(|| std::env::var(orchestrator::env::RELAY_AGENT_NAME).ok())
        .ok_or_else(|| anyhow::anyhow!("worker requires --agent or RELAY_AGENT_NAME"))?;

    let mut config = WorkerConfig::new(agent_name, command);
    config.cli = cli_name;
    config.log_file = log_file;
    config.apply_env();
    if let Some(path) = &config_path {
        ConfigFile::load(path)?.apply_to_worker(&mut config);
    }
    if let Some(socket) = socket {
        config.daemon_socket = socket;
    }
    if let Some(port) = dashboard_port {
        config.dashboard_port = Some(port);
    }

    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let agent_name = config.agent.clone();

    let watcher = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                OrchestratorEvent::Summary { raw_json } => info!(%raw_json, "session summary"),
                OrchestratorEvent::SessionEnd { raw } => info!(%raw, "session end"),
                OrchestratorEvent::Exit { code } => info!(?code, "wrapped cli exited"),
                OrchestratorEvent::InjectionFailed { message_id, error } => {
                    error!(%message_id, %error, "injection failed");
                }
                OrchestratorEvent::SpawnCommand { name, cli, task } => {
                    info!(%name, %cli, %task, "spawn command requires an external spawner");
                }
                OrchestratorEvent::ReleaseCommand { name } => info!(%name, "release command observed"),
            }
        }
    });

    let orchestrator = Orchestrator::new(config);
    let result = orchestrator.run(events_tx).await;
    watcher.abort();
    result.map_err(Into::into)
}
