//! Client connection state machine (spec §4.7):
//! DISCONNECTED → CONNECTING → HANDSHAKING → READY → (BACKOFF → CONNECTING …)

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Backoff,
    /// Terminal: `destroy()` was called; no further reconnects will happen.
    Destroyed,
}
