//! Connection (spec §4.2) — owns one socket, moves envelopes between it and
//! the router, and enforces handshake/heartbeat/backpressure policy.
//!
//! One Tokio task per connection, mirroring the teacher's per-transport
//! handler tasks that all funnel into `ControlService`
//! (`sven-node/src/control/service.rs`): the connection never touches
//! another connection's state directly, it only talks to the router through
//! the serialized `RouterHandle`.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relay_protocol::{
    encode_batch, encode_frame, Codec, Envelope, EnvelopeType, ErrorPayload, FrameDecoder,
    FrameMode, HealthRequestPayload, HelloPayload, InboxRequestPayload, InboxResponsePayload,
    ListAgentsRequestPayload, ListAgentsResponsePayload, MessagesQueryRequestPayload,
    MessagesQueryResponsePayload, MetricsRequestPayload, RemoveAgentRequestPayload,
    RemoveAgentResponsePayload, ShadowBindPayload, ShadowUnbindPayload, StatusRequestPayload,
    StatusResponsePayload, WelcomePayload,
};

use crate::config::DaemonConfig;
use crate::router::RouterHandle;
use crate::storage::{MessageFilter, StorageAdapter};

/// 5s HELLO deadline (spec §4.2).
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

enum ConnError {
    Eof,
    Io(std::io::Error),
    Protocol(relay_protocol::ProtocolError),
}

impl From<std::io::Error> for ConnError {
    fn from(e: std::io::Error) -> Self {
        ConnError::Io(e)
    }
}

/// Read the next complete envelope, reading more bytes from `reader` as
/// needed. Several frames may already be buffered in `decoder` from a prior
/// read, in which case no I/O happens at all.
async fn next_envelope<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    buf: &mut [u8],
) -> Result<Envelope, ConnError> {
    loop {
        match decoder.next_envelope() {
            Ok(Some(env)) => return Ok(env),
            Ok(None) => {}
            Err(e) => return Err(ConnError::Protocol(e)),
        }
        let n = reader.read(buf).await?;
        if n == 0 {
            return Err(ConnError::Eof);
        }
        decoder.feed(&buf[..n]);
    }
}

fn negotiate_frame_mode(caps: &relay_protocol::Capabilities) -> FrameMode {
    match caps.codec.as_deref() {
        Some("cbor") => FrameMode::Current(Codec::Cbor),
        Some("legacy") => FrameMode::Legacy,
        _ => FrameMode::Current(Codec::Json),
    }
}

/// Drive one accepted socket until it disconnects or is closed by the
/// daemon. Registers/unregisters itself with the router around its lifetime.
pub async fn serve(
    stream: UnixStream,
    connection_id: String,
    router: RouterHandle,
    config: Arc<DaemonConfig>,
    storage: Arc<dyn StorageAdapter>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<Envelope>();
    router.register_connection(connection_id.clone(), sink_tx.clone());

    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 16 * 1024];

    // ── Handshake ──────────────────────────────────────────────────────────
    let hello_env = match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        next_envelope(&mut read_half, &mut decoder, &mut read_buf),
    )
    .await
    {
        Ok(Ok(env)) if env.typ == EnvelopeType::Hello => env,
        Ok(Ok(_)) => {
            debug!(connection_id, "first frame was not HELLO, dropping");
            router.unregister_connection(connection_id);
            return;
        }
        Ok(Err(_)) | Err(_) => {
            debug!(connection_id, "handshake timed out or connection closed");
            router.unregister_connection(connection_id);
            return;
        }
    };

    let Ok(hello_payload) = hello_env.payload_as::<HelloPayload>() else {
        write_fatal_error(&mut write_half, FrameMode::Current(Codec::Json), "INVALID_FRAME", "malformed HELLO payload").await;
        router.unregister_connection(connection_id);
        return;
    };

    let frame_mode = negotiate_frame_mode(&hello_payload.capabilities);
    let agent = hello_payload.agent.clone();

    let outcome = match router.hello(connection_id.clone(), hello_payload).await {
        Ok(outcome) => outcome,
        Err(e) => {
            write_fatal_error(&mut write_half, frame_mode, e.code(), &e.to_string()).await;
            router.unregister_connection(connection_id);
            return;
        }
    };

    let welcome = Envelope::new(
        EnvelopeType::Welcome,
        WelcomePayload {
            session_id: outcome.session.id.clone(),
            resume_token: outcome.session.resume_token.clone(),
            seed_sequences: None,
        },
    );
    if write_frame(&mut write_half, &welcome, frame_mode).await.is_err() {
        router.unregister_connection(connection_id);
        return;
    }

    // Replay any pending deliveries for a resumed session, in seq order,
    // before any new traffic (spec §4.4, §4.8 resume invariant).
    for env in outcome.replay {
        let _ = sink_tx.send(env);
    }

    info!(connection_id, agent = %agent, session_id = %outcome.session.id, "connection established");

    // ── Steady state ───────────────────────────────────────────────────────
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.tick().await; // consume the immediate first tick
    let mut awaiting_pong = false;
    let mut missed = 0u32;

    loop {
        tokio::select! {
            result = next_envelope(&mut read_half, &mut decoder, &mut read_buf) => {
                match result {
                    Ok(env) => {
                        if env.typ == EnvelopeType::Bye {
                            debug!(connection_id, agent = %agent, "peer sent BYE");
                            break;
                        }
                        handle_inbound(
                            env,
                            &connection_id,
                            &agent,
                            &router,
                            &storage,
                            &sink_tx,
                            &mut awaiting_pong,
                            &mut missed,
                        ).await;
                    }
                    Err(ConnError::Eof) => {
                        debug!(connection_id, agent = %agent, "connection closed by peer");
                        break;
                    }
                    Err(ConnError::Io(e)) => {
                        warn!(connection_id, agent = %agent, error = %e, "io error, closing connection");
                        break;
                    }
                    Err(ConnError::Protocol(e)) => {
                        warn!(connection_id, agent = %agent, error = %e, "protocol error, closing connection");
                        write_fatal_error(&mut write_half, frame_mode, e.code(), &e.to_string()).await;
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if awaiting_pong {
                    missed += 1;
                    if missed >= config.max_missed_heartbeats {
                        if router.is_processing(agent.clone()).await {
                            // extend the deadline by one interval while the
                            // agent is observed mid-processing.
                            missed = 0;
                        } else {
                            warn!(connection_id, agent = %agent, "missed heartbeats, closing connection");
                            break;
                        }
                    }
                }
                let ping = Envelope::new(EnvelopeType::Ping, serde_json::Value::Null);
                if write_frame(&mut write_half, &ping, frame_mode).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
            outbound = sink_rx.recv() => {
                let Some(first) = outbound else {
                    break;
                };
                let mut batch = vec![first];
                while let Ok(env) = sink_rx.try_recv() {
                    batch.push(env);
                }
                match encode_batch(&batch, frame_mode) {
                    Ok(bytes) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(connection_id, error = %e, "failed to encode outbound batch");
                    }
                }
            }
        }
    }

    router.unregister_connection(connection_id);
}

#[allow(clippy::too_many_arguments)]
async fn handle_inbound(
    env: Envelope,
    connection_id: &str,
    agent: &str,
    router: &RouterHandle,
    storage: &Arc<dyn StorageAdapter>,
    sink_tx: &mpsc::UnboundedSender<Envelope>,
    awaiting_pong: &mut bool,
    missed: &mut u32,
) {
    match env.typ {
        EnvelopeType::Pong => {
            *awaiting_pong = false;
            *missed = 0;
        }
        EnvelopeType::Ping => {
            let pong = Envelope::new(EnvelopeType::Pong, serde_json::Value::Null);
            let _ = sink_tx.send(pong);
        }
        EnvelopeType::Ack => {
            router.ack(connection_id.to_string(), env.id.clone());
        }
        EnvelopeType::Send
        | EnvelopeType::Spawn
        | EnvelopeType::SpawnResult
        | EnvelopeType::Release
        | EnvelopeType::ReleaseResult
        | EnvelopeType::AgentReady
        | EnvelopeType::Log => {
            router.touch(agent.to_string());
            router.route(connection_id.to_string(), env);
        }
        EnvelopeType::Subscribe => {
            if let Some(topic) = env.topic.clone() {
                router.subscribe(agent.to_string(), topic);
            }
        }
        EnvelopeType::Unsubscribe => {
            if let Some(topic) = env.topic.clone() {
                router.unsubscribe(agent.to_string(), topic);
            }
        }
        EnvelopeType::ChannelJoin => {
            if let Some(channel) = env.topic.clone().or_else(|| env.to.clone()) {
                router.channel_join(agent.to_string(), channel);
            }
        }
        EnvelopeType::ChannelLeave => {
            if let Some(channel) = env.topic.clone().or_else(|| env.to.clone()) {
                router.channel_leave(agent.to_string(), channel);
            }
        }
        EnvelopeType::ChannelMessage => {
            router.touch(agent.to_string());
            router.channel_message(connection_id.to_string(), env);
        }
        EnvelopeType::ShadowBind => {
            if let Ok(payload) = env.payload_as::<ShadowBindPayload>() {
                router.bind_shadow(agent.to_string(), payload);
            }
        }
        EnvelopeType::ShadowUnbind => {
            if let Ok(payload) = env.payload_as::<ShadowUnbindPayload>() {
                router.unbind_shadow(agent.to_string(), payload.primary);
            }
        }
        EnvelopeType::StatusRequest => {
            let requested = env.payload_as::<StatusRequestPayload>().ok().and_then(|p| p.agent);
            let agents = router.status(requested).await;
            let _ = sink_tx.send(Envelope::new(EnvelopeType::StatusResponse, StatusResponsePayload { agents }));
        }
        EnvelopeType::InboxRequest => {
            let target = env.payload_as::<InboxRequestPayload>().map(|p| p.agent).unwrap_or_else(|_| agent.to_string());
            let messages = router.inbox(target).await;
            let _ = sink_tx.send(Envelope::new(EnvelopeType::InboxResponse, InboxResponsePayload { messages }));
        }
        EnvelopeType::MessagesQueryRequest => {
            let filter = env
                .payload_as::<MessagesQueryRequestPayload>()
                .map(|p| MessageFilter { agent: p.agent, since_ms: p.since_ms, limit: p.limit })
                .unwrap_or_default();
            let messages = storage.get_messages(filter).await.unwrap_or_default();
            let _ = sink_tx.send(Envelope::new(EnvelopeType::MessagesQueryResponse, MessagesQueryResponsePayload { messages }));
        }
        EnvelopeType::ListAgentsRequest => {
            let _ = env.payload_as::<ListAgentsRequestPayload>();
            let agents = router.connected_names().await;
            let _ = sink_tx.send(Envelope::new(EnvelopeType::ListAgentsResponse, ListAgentsResponsePayload { agents }));
        }
        EnvelopeType::HealthRequest => {
            let _ = env.payload_as::<HealthRequestPayload>();
            let health = router.health().await;
            let _ = sink_tx.send(Envelope::new(EnvelopeType::HealthResponse, health));
        }
        EnvelopeType::MetricsRequest => {
            let _ = env.payload_as::<MetricsRequestPayload>();
            let metrics = router.metrics().await;
            let _ = sink_tx.send(Envelope::new(EnvelopeType::MetricsResponse, metrics));
        }
        EnvelopeType::RemoveAgentRequest => {
            let target = env.payload_as::<RemoveAgentRequestPayload>().map(|p| p.agent);
            if let Ok(target) = target {
                let success = router.remove_agent(target).await;
                let _ = sink_tx.send(Envelope::new(EnvelopeType::RemoveAgentResponse, RemoveAgentResponsePayload { success }));
            }
        }
        other => {
            debug!(connection_id, agent, ?other, "unhandled envelope type on connection");
        }
    }
}

async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, env: &Envelope, mode: FrameMode) -> std::io::Result<()> {
    match encode_frame(env, mode) {
        Ok(bytes) => writer.write_all(&bytes).await,
        Err(e) => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
    }
}

async fn write_fatal_error<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, mode: FrameMode, code: &str, message: &str) {
    let env = Envelope::new(
        EnvelopeType::Error,
        ErrorPayload { code: code.into(), message: message.into(), fatal: true, trace_id: None },
    );
    let _ = write_frame(writer, &env, mode).await;
}
