use thiserror::Error;

/// Daemon-side error taxonomy (spec §7).
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("wire error: {0}")]
    Wire(#[from] relay_protocol::ProtocolError),

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("startup failure: {0}")]
    Startup(String),
}

impl DaemonError {
    /// Stable machine code for the ERROR envelope this error produces.
    pub fn code(&self) -> &'static str {
        match self {
            DaemonError::Wire(e) => e.code(),
            DaemonError::Handshake(_) => "HANDSHAKE_FAILED",
            DaemonError::Io(_) => "IO_ERROR",
            DaemonError::Startup(_) => "STARTUP_FAILED",
        }
    }
}

/// Handshake-specific fatal reasons (spec §4.2).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("reserved or invalid agent name")]
    UnauthorizedName,
    #[error("another live connection already holds this name")]
    DuplicateConnection,
    #[error("resume token is stale or unknown")]
    ResumeTooOld,
    #[error("HELLO not received within the handshake deadline")]
    Timeout,
}

impl HandshakeError {
    pub fn code(self) -> &'static str {
        match self {
            HandshakeError::UnauthorizedName => "UNAUTHORIZED_NAME",
            HandshakeError::DuplicateConnection => "DUPLICATE_CONNECTION",
            HandshakeError::ResumeTooOld => "RESUME_TOO_OLD",
            HandshakeError::Timeout => "HANDSHAKE_TIMEOUT",
        }
    }
}
