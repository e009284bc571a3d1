//! Daemon lifecycle (spec §4.6): bind the control socket, accept
//! connections, and tear everything down cleanly on shutdown.
//!
//! Shaped after the teacher's `sven_gateway::gateway::run` startup sequence
//! (`sven-gateway/src/gateway.rs`): build collaborators, spawn the hub,
//! serve until asked to stop, then unwind in the opposite order.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use relay_protocol::{Envelope, EnvelopeType};
use tokio::net::UnixListener;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cloud_sync::CloudSync;
use crate::config::DaemonConfig;
use crate::connection;
use crate::error::DaemonError;
use crate::membership::MembershipStore;
use crate::router::Router;
use crate::storage::StorageAdapter;

/// Bring up the control socket, serve connections until ctrl-c, then shut
/// down cleanly.
pub async fn run(
    config: DaemonConfig,
    storage: Arc<dyn StorageAdapter>,
    membership: Arc<dyn MembershipStore>,
    cloud_sync: Arc<dyn CloudSync>,
) -> anyhow::Result<()> {
    storage.init().await?;

    check_stale_pid_file(&config)?;
    let listener = bind_socket(&config)?;
    write_pid_file(&config)?;

    let (router, router_join) = Router::spawn(config.clone(), storage.clone(), membership, cloud_sync);
    info!(socket = %config.socket_path.display(), "daemon listening");

    let config = Arc::new(config);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let connection_id = Uuid::new_v4().to_string();
                        let router = router.clone();
                        let config = config.clone();
                        let storage = storage.clone();
                        tokio::spawn(async move {
                            connection::serve(stream, connection_id, router, config, storage).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    shutdown(&config, &router, router_join, storage.as_ref()).await;
    Ok(())
}

/// If a pid file from a previous run already exists, refuse to start when
/// its owning process is still alive (spec §6 exit code 1 "pid file
/// stale"). A dead owner's pid file and any orphaned socket it left behind
/// are cleaned up so `bind_socket` gets a clean slate.
fn check_stale_pid_file(config: &DaemonConfig) -> Result<(), DaemonError> {
    let pid_path = config.pid_path();
    let Ok(contents) = std::fs::read_to_string(&pid_path) else {
        return Ok(());
    };

    let Ok(pid) = contents.trim().parse::<libc::pid_t>() else {
        warn!(pid_path = %pid_path.display(), "pid file unparsable, treating as stale");
        let _ = std::fs::remove_file(&pid_path);
        let _ = std::fs::remove_file(&config.socket_path);
        return Ok(());
    };

    // `kill(pid, 0)` sends no signal, it only probes whether `pid` is a live
    // process we're allowed to see (same no-op-signal idiom the teacher uses
    // for its own process liveness/signal checks, e.g. `sven-tools`' gdb
    // process-group handling).
    let alive = unsafe { libc::kill(pid, 0) == 0 } || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);

    if alive {
        return Err(DaemonError::Startup(format!(
            "pid file {} names a live process ({pid}); another daemon instance is already running",
            pid_path.display()
        )));
    }

    info!(pid, pid_path = %pid_path.display(), "removing stale pid file and orphaned socket left by a dead daemon");
    let _ = std::fs::remove_file(&pid_path);
    let _ = std::fs::remove_file(&config.socket_path);
    Ok(())
}

fn bind_socket(config: &DaemonConfig) -> anyhow::Result<UnixListener> {
    if let Some(dir) = config.socket_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
    }
    let listener = UnixListener::bind(&config.socket_path)?;
    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(&config.socket_path, perms)?;
    Ok(listener)
}

fn write_pid_file(config: &DaemonConfig) -> anyhow::Result<()> {
    std::fs::write(config.pid_path(), std::process::id().to_string())?;
    Ok(())
}

async fn shutdown(
    config: &DaemonConfig,
    router: &crate::router::RouterHandle,
    router_join: tokio::task::JoinHandle<()>,
    storage: &dyn StorageAdapter,
) {
    router.broadcast_system_message(Envelope::new(EnvelopeType::Bye, serde_json::Value::Null));
    router.shutdown();
    // Give in-flight BYE sends a moment to reach their sockets before the
    // router task (and its connection sinks) drop.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let _ = router_join.await;

    if let Err(e) = storage.close().await {
        error!(error = %e, "storage close failed");
    }

    let _ = std::fs::remove_file(&config.socket_path);
    let _ = std::fs::remove_file(config.pid_path());
    info!("daemon shut down cleanly");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_sync::NoopCloudSync;
    use crate::membership::InMemoryMembershipStore;
    use crate::storage::InMemoryStorage;

    #[tokio::test]
    async fn bind_socket_creates_parent_dir_and_sets_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.socket_path = dir.path().join("nested/daemon.sock");

        let listener = bind_socket(&config).unwrap();
        drop(listener);

        let meta = std::fs::metadata(&config.socket_path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn pid_file_contains_current_process_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.socket_path = dir.path().join("daemon.sock");

        write_pid_file(&config).unwrap();
        let contents = std::fs::read_to_string(config.pid_path()).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }

    #[test]
    fn no_pid_file_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.socket_path = dir.path().join("daemon.sock");

        check_stale_pid_file(&config).unwrap();
    }

    #[test]
    fn live_pid_file_aborts_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.socket_path = dir.path().join("daemon.sock");
        // Our own pid is guaranteed alive for the duration of this test.
        std::fs::write(config.pid_path(), std::process::id().to_string()).unwrap();

        let err = check_stale_pid_file(&config).expect_err("a live pid should refuse startup");
        assert_eq!(err.code(), "STARTUP_FAILED");
        assert!(config.pid_path().exists(), "a live owner's pid file must not be removed");
    }

    #[test]
    fn dead_pid_file_and_orphaned_socket_are_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.socket_path = dir.path().join("daemon.sock");
        // pid 1 is `init`/`launchd` on any Unix this test runs on, so spawn a
        // short-lived child and use its pid once it has exited instead of
        // guessing at a reserved pid.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        std::fs::write(config.pid_path(), dead_pid.to_string()).unwrap();
        std::fs::write(&config.socket_path, b"orphaned").unwrap();

        check_stale_pid_file(&config).unwrap();
        assert!(!config.pid_path().exists());
        assert!(!config.socket_path.exists());
    }

    #[tokio::test]
    async fn shutdown_removes_socket_and_pid_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.socket_path = dir.path().join("daemon.sock");
        config.state_dir = dir.path().to_path_buf();

        let _listener = bind_socket(&config).unwrap();
        write_pid_file(&config).unwrap();

        let (router, join) = Router::spawn(
            config.clone(),
            Arc::new(InMemoryStorage::default()),
            Arc::new(InMemoryMembershipStore::default()),
            Arc::new(NoopCloudSync),
        );
        shutdown(&config, &router, join, &InMemoryStorage::default()).await;

        assert!(!config.socket_path.exists());
        assert!(!config.pid_path().exists());
    }
}
