//! Envelope — the unit of wire traffic (spec §3).
//!
//! The envelope carries a type tag plus a loosely-typed JSON payload; callers
//! decode the payload into one of the typed structs below once the `kind` is
//! known. This mirrors the teacher's own wire types (`sven-p2p::protocol::types`),
//! which keep the relay binary's message shapes independent of richer
//! in-process types and convert at the edges.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current protocol version understood by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Envelope type tag (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeType {
    Hello,
    Welcome,
    Send,
    Deliver,
    Ack,
    Ping,
    Pong,
    Bye,
    Subscribe,
    Unsubscribe,
    ChannelJoin,
    ChannelLeave,
    ChannelMessage,
    ShadowBind,
    ShadowUnbind,
    Log,
    Spawn,
    SpawnResult,
    Release,
    ReleaseResult,
    AgentReady,
    Error,
    Busy,
    StatusRequest,
    StatusResponse,
    InboxRequest,
    InboxResponse,
    MessagesQueryRequest,
    MessagesQueryResponse,
    ListAgentsRequest,
    ListAgentsResponse,
    HealthRequest,
    HealthResponse,
    MetricsRequest,
    MetricsResponse,
    RemoveAgentRequest,
    RemoveAgentResponse,
}

/// Importance level carried in `payload_meta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    #[default]
    Normal,
    High,
    Urgent,
}

/// `payload_meta.sync` — correlation metadata for `sendAndWait`/`request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMeta {
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub blocking: bool,
}

/// Optional out-of-band metadata attached to an envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "replyTo")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<Importance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

/// `delivery` field, present only on DELIVER envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    pub seq: u64,
    pub session_id: String,
    #[serde(rename = "originalTo")]
    pub original_to: String,
    /// The envelope `type` this DELIVER carries the payload of (SEND,
    /// SPAWN, LOG, ...); a DELIVER's own `type` is always `DELIVER`, so a
    /// recipient needs this to know which typed payload to decode.
    #[serde(rename = "originalType")]
    pub original_type: EnvelopeType,
}

/// The full wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    #[serde(rename = "type")]
    pub typ: EnvelopeType,
    pub id: String,
    pub ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_meta: Option<PayloadMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryInfo>,
}

impl Envelope {
    /// Build an envelope with a fresh id and the current wall-clock timestamp.
    pub fn new(typ: EnvelopeType, payload: impl Serialize) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            typ,
            id: Uuid::new_v4().to_string(),
            ts: now_ms(),
            from: None,
            to: None,
            topic: None,
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            payload_meta: None,
            delivery: None,
        }
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_meta(mut self, meta: PayloadMeta) -> Self {
        self.payload_meta = Some(meta);
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryInfo) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// Decode `payload` into a typed struct; callers should know the shape
    /// from `self.typ` before calling this.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.payload.clone())
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Typed payload shapes (spec §3, §4.2) ──────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub ack: bool,
    #[serde(default)]
    pub resume: bool,
    #[serde(default, rename = "max_inflight")]
    pub max_inflight: Option<u32>,
    #[serde(default)]
    pub supports_topics: bool,
    /// Non-standard extension: which inner codec this connection wants on
    /// egress ("json" or "cbor") for the "current" 5-byte-header frame mode.
    #[serde(default)]
    pub codec: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionClaim {
    pub resume_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub agent: String,
    #[serde(rename = "entityType")]
    pub entity_type: EntityType,
    #[serde(default)]
    pub cli: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub session: Option<SessionClaim>,
    #[serde(default, rename = "_isSystemComponent")]
    pub is_system_component: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Agent,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub session_id: String,
    pub resume_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_sequences: Option<BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendKind {
    Message,
    Action,
    State,
    Thinking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendPayload {
    pub kind: SendKind,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

impl SendPayload {
    pub fn message(body: impl Into<String>) -> Self {
        Self {
            kind: SendKind::Message,
            body: body.into(),
            data: None,
            thread: None,
        }
    }

    /// Whether the sender opted in to a self-addressed echo via `data._echoSelf`.
    pub fn echo_self(&self) -> bool {
        self.data
            .as_ref()
            .and_then(|d| d.get("_echoSelf"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub fatal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShadowSpeakOn {
    AllMessages,
    CodeWritten,
    ReviewRequest,
    SessionEnd,
    ExplicitAsk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowBindPayload {
    pub primary: String,
    #[serde(default)]
    pub speak_on: Vec<ShadowSpeakOn>,
    #[serde(default)]
    pub receive_incoming: bool,
    #[serde(default)]
    pub receive_outgoing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnPayload {
    pub name: String,
    pub cli: String,
    pub task: String,
    #[serde(default)]
    pub wait_for_ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnResultPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleasePayload {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResultPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReadyPayload {
    pub name: String,
}

// ── Query-operation payloads (spec §4.5 "Query operations") ──────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusRequestPayload {
    #[serde(default)]
    pub agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub name: String,
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
    #[serde(default)]
    pub processing: bool,
    #[serde(default)]
    pub joined_channels: Vec<String>,
    pub last_seen_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponsePayload {
    pub agents: Vec<AgentStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListAgentsRequestPayload {
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListAgentsResponsePayload {
    pub agents: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthRequestPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponsePayload {
    pub uptime_ms: u64,
    pub connected_agents: u32,
    pub pending_deliveries: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsRequestPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsResponsePayload {
    pub connected_agents: u32,
    pub pending_deliveries: u32,
    pub dedupe_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxRequestPayload {
    pub agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxResponsePayload {
    pub messages: Vec<Envelope>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagesQueryRequestPayload {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub since_ms: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesQueryResponsePayload {
    pub messages: Vec<Envelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveAgentRequestPayload {
    pub agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveAgentResponsePayload {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowUnbindPayload {
    pub primary: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trips_through_json() {
        let env = Envelope::new(
            EnvelopeType::Hello,
            HelloPayload {
                agent: "Alice".into(),
                entity_type: EntityType::Agent,
                cli: Some("claude".into()),
                capabilities: Capabilities {
                    ack: true,
                    resume: true,
                    max_inflight: Some(256),
                    supports_topics: true,
                    codec: Some("cbor".into()),
                },
                session: None,
                is_system_component: false,
            },
        )
        .with_from("Alice");

        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.typ, EnvelopeType::Hello);
        let payload: HelloPayload = back.payload_as().unwrap();
        assert_eq!(payload.agent, "Alice");
        assert!(payload.capabilities.resume);
    }

    #[test]
    fn echo_self_flag_reads_through_data_map() {
        let mut data = serde_json::Map::new();
        data.insert("_echoSelf".into(), serde_json::Value::Bool(true));
        let payload = SendPayload {
            kind: SendKind::Message,
            body: "hi".into(),
            data: Some(data),
            thread: None,
        };
        assert!(payload.echo_self());
    }
}
