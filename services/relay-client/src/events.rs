//! Client-observable events (spec §4.7, §9 "callbacks ... equivalently a
//! channel/stream of typed events").

use relay_protocol::{DeliveryInfo, PayloadMeta, ReleasePayload, SendPayload, SpawnPayload};

use crate::state::ConnectionState;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A DELIVER addressed to us, already ACKed and dedupe-checked.
    Message {
        from: String,
        payload: SendPayload,
        payload_meta: Option<PayloadMeta>,
        delivery: Option<DeliveryInfo>,
    },
    ChannelMessage {
        from: String,
        channel: String,
        body: String,
        data: Option<serde_json::Map<String, serde_json::Value>>,
    },
    AgentReady {
        name: String,
    },
    /// Someone asked us (acting as a spawner) to start a new agent. Answer
    /// with `RelayClient::reply_spawn_result`.
    SpawnRequested {
        from: String,
        envelope_id: String,
        payload: SpawnPayload,
    },
    /// Someone asked us to release/stop an agent. Answer with
    /// `RelayClient::reply_release_result`.
    ReleaseRequested {
        from: String,
        envelope_id: String,
        payload: ReleasePayload,
    },
    Log {
        from: String,
        body: String,
    },
    StateChange(ConnectionState),
    Error {
        code: String,
        message: String,
        fatal: bool,
    },
}
