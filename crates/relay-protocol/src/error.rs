use thiserror::Error;

/// Framing/wire errors (spec §4.1, §7 "Wire error").
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {0} bytes exceeds the 16 MiB cap")]
    FrameTooLarge(usize),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

impl ProtocolError {
    /// Stable machine code surfaced in an ERROR envelope (spec §7).
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::FrameTooLarge(_) => "FRAME_TOO_LARGE",
            ProtocolError::InvalidFrame(_) => "INVALID_FRAME",
        }
    }
}
