use thiserror::Error;

/// Orchestrator-side error taxonomy (spec §7).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("no native pty binary found in any known path")]
    PtyBinaryNotFound,

    #[error("command to wrap under a pty must not be empty")]
    EmptyCommand,

    #[error("pty error: {0}")]
    Pty(String),

    #[error("child process exited")]
    ChildExited,

    #[error("control socket error: {0}")]
    ControlSocket(String),

    #[error("relay client error: {0}")]
    Client(#[from] relay_client::ClientError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
