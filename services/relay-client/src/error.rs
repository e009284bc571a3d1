use thiserror::Error;

/// Client-side error taxonomy (spec §7, §4.7).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("wire error: {0}")]
    Wire(#[from] relay_protocol::ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("handshake rejected: {code}: {message}")]
    HandshakeRejected { code: String, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("client was destroyed")]
    Destroyed,

    #[error("not connected")]
    NotConnected,

    #[error("peer returned an error: {code}: {message}")]
    Remote { code: String, message: String },
}
