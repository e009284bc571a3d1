//! `RelayClient` (spec §4.7) — a single actor task per connection, the
//! same shape as the daemon's own `RouterHandle`/`Router` split
//! (`services/daemon/src/router.rs`), which itself mirrors the teacher's
//! `ControlService` hub (`sven-node/src/control/service.rs`): callers talk
//! to a cheap, clone-able handle over an `mpsc` channel; the actor owns all
//! mutable state and runs strictly sequentially.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use relay_protocol::{
    encode_batch, Codec, DedupeCache, Envelope, EnvelopeType, ErrorPayload, FrameDecoder,
    FrameMode, HealthRequestPayload, HealthResponsePayload, HelloPayload, InboxRequestPayload,
    InboxResponsePayload, ListAgentsRequestPayload, ListAgentsResponsePayload, MetricsRequestPayload,
    MetricsResponsePayload, PayloadMeta, ReleasePayload, ReleaseResultPayload,
    RemoveAgentRequestPayload, RemoveAgentResponsePayload, SendPayload, ShadowBindPayload,
    ShadowSpeakOn, ShadowUnbindPayload, SpawnPayload, SpawnResultPayload, StatusRequestPayload,
    StatusResponsePayload, SyncMeta, WelcomePayload,
};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::state::ConnectionState;

/// Default budget for `sendAndWait`/`request`/`spawn`/`release` RPCs that
/// don't specify their own (spec §4.7).
const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

enum Command {
    Send {
        envelope: Envelope,
    },
    SendAndWait {
        envelope: Envelope,
        correlation_id: String,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Request {
        envelope: Envelope,
        correlation_id: String,
        reply: oneshot::Sender<Envelope>,
    },
    Spawn {
        envelope: Envelope,
        reply: oneshot::Sender<Envelope>,
    },
    Release {
        envelope: Envelope,
        reply: oneshot::Sender<Envelope>,
    },
    WaitForAgentReady {
        name: String,
        reply: oneshot::Sender<()>,
    },
    Query {
        envelope: Envelope,
        response_type: EnvelopeType,
        reply: oneshot::Sender<Envelope>,
    },
    Destroy,
}

/// Cheap, clone-able handle to a running client connection.
#[derive(Clone)]
pub struct RelayClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    event_tx: broadcast::Sender<ClientEvent>,
    state_rx: watch::Receiver<ConnectionState>,
    agent: String,
}

impl RelayClient {
    /// Connect, perform HELLO, and wait for WELCOME (or a fatal rejection).
    /// Reconnection after the first success is handled in the background
    /// with exponential backoff (spec §4.7); this call only governs the
    /// very first attempt.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let agent = config.agent.clone();
        let connect_timeout = config.connect_timeout;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (ready_tx, ready_rx) = oneshot::channel();

        let actor = Actor {
            config,
            state_tx,
            event_tx: event_tx.clone(),
            dedupe: DedupeCache::default(),
            pending: Pending::default(),
            destroyed: false,
        };
        tokio::spawn(actor.run(cmd_rx, Some(ready_tx)));

        match tokio::time::timeout(connect_timeout + Duration::from_secs(2), ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(Self { cmd_tx, event_tx, state_rx, agent }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) | Err(_) => Err(ClientError::ConnectTimeout),
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.event_tx.subscribe()
    }

    /// Fire-and-forget send (spec §4.7 `sendMessage`).
    pub fn send_message(&self, to: impl Into<String>, body: impl Into<String>) -> Result<(), ClientError> {
        let envelope = Envelope::new(EnvelopeType::Send, SendPayload::message(body))
            .with_from(self.agent.clone())
            .with_to(to);
        self.send_raw(envelope)
    }

    fn send_raw(&self, envelope: Envelope) -> Result<(), ClientError> {
        self.cmd_tx
            .send(Command::Send { envelope })
            .map_err(|_| ClientError::Destroyed)
    }

    /// Send and wait for the recipient's ACK to clear the tracker, or a
    /// `delivery-failed` error if it never does (spec §4.7 `sendAndWait`).
    pub async fn send_and_wait(
        &self,
        to: impl Into<String>,
        body: impl Into<String>,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let correlation_id = Uuid::new_v4().to_string();
        let meta = PayloadMeta {
            sync: Some(SyncMeta {
                correlation_id: correlation_id.clone(),
                timeout_ms: timeout.as_millis() as u64,
                blocking: true,
            }),
            ..Default::default()
        };
        let envelope = Envelope::new(EnvelopeType::Send, SendPayload::message(body))
            .with_from(self.agent.clone())
            .with_to(to)
            .with_meta(meta);

        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SendAndWait { envelope, correlation_id, reply })
            .map_err(|_| ClientError::Destroyed)?;
        tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| ClientError::Timeout)?
            .unwrap_or(Err(ClientError::Destroyed))
    }

    /// Send and wait for a *reply message* (distinct from an ACK) carrying
    /// the same correlation id via `payload_meta.reply_to` or
    /// `data._correlationId` (spec §4.7 `request`).
    pub async fn request(
        &self,
        to: impl Into<String>,
        body: impl Into<String>,
        timeout: Duration,
    ) -> Result<Envelope, ClientError> {
        let correlation_id = Uuid::new_v4().to_string();
        let meta = PayloadMeta {
            sync: Some(SyncMeta {
                correlation_id: correlation_id.clone(),
                timeout_ms: timeout.as_millis() as u64,
                blocking: true,
            }),
            ..Default::default()
        };
        let envelope = Envelope::new(EnvelopeType::Send, SendPayload::message(body))
            .with_from(self.agent.clone())
            .with_to(to)
            .with_meta(meta);

        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request { envelope, correlation_id, reply })
            .map_err(|_| ClientError::Destroyed)?;
        tokio::time::timeout(timeout, rx).await.map_err(|_| ClientError::Timeout)
    }

    /// Reply to a `request()` from another agent, matched by `correlation_id`.
    pub fn respond(&self, to: impl Into<String>, correlation_id: impl Into<String>, body: impl Into<String>) -> Result<(), ClientError> {
        let meta = PayloadMeta { reply_to: Some(correlation_id.into()), ..Default::default() };
        let envelope = Envelope::new(EnvelopeType::Send, SendPayload::message(body))
            .with_from(self.agent.clone())
            .with_to(to)
            .with_meta(meta);
        self.send_raw(envelope)
    }

    pub fn join_channel(&self, channel: impl Into<String>) -> Result<(), ClientError> {
        let envelope = Envelope::new(EnvelopeType::ChannelJoin, serde_json::Value::Null)
            .with_from(self.agent.clone())
            .with_topic(channel);
        self.send_raw(envelope)
    }

    pub fn leave_channel(&self, channel: impl Into<String>) -> Result<(), ClientError> {
        let envelope = Envelope::new(EnvelopeType::ChannelLeave, serde_json::Value::Null)
            .with_from(self.agent.clone())
            .with_topic(channel);
        self.send_raw(envelope)
    }

    pub fn send_channel_message(&self, channel: impl Into<String>, body: impl Into<String>) -> Result<(), ClientError> {
        let envelope = Envelope::new(EnvelopeType::ChannelMessage, SendPayload::message(body))
            .with_from(self.agent.clone())
            .with_topic(channel);
        self.send_raw(envelope)
    }

    pub fn bind_as_shadow(
        &self,
        primary: impl Into<String>,
        speak_on: Vec<ShadowSpeakOn>,
        receive_incoming: bool,
        receive_outgoing: bool,
    ) -> Result<(), ClientError> {
        let envelope = Envelope::new(
            EnvelopeType::ShadowBind,
            ShadowBindPayload { primary: primary.into(), speak_on, receive_incoming, receive_outgoing },
        )
        .with_from(self.agent.clone());
        self.send_raw(envelope)
    }

    pub fn unbind_as_shadow(&self, primary: impl Into<String>) -> Result<(), ClientError> {
        let envelope = Envelope::new(EnvelopeType::ShadowUnbind, ShadowUnbindPayload { primary: primary.into() })
            .with_from(self.agent.clone());
        self.send_raw(envelope)
    }

    pub fn send_log(&self, body: impl Into<String>) -> Result<(), ClientError> {
        let envelope = Envelope::new(EnvelopeType::Log, SendPayload::message(body)).with_from(self.agent.clone());
        self.send_raw(envelope)
    }

    async fn query(&self, envelope: Envelope, response_type: EnvelopeType) -> Result<Envelope, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Query { envelope, response_type, reply })
            .map_err(|_| ClientError::Destroyed)?;
        tokio::time::timeout(DEFAULT_RPC_TIMEOUT, rx).await.map_err(|_| ClientError::Timeout)
    }

    pub async fn get_status(&self, agent: Option<String>) -> Result<StatusResponsePayload, ClientError> {
        let envelope = Envelope::new(EnvelopeType::StatusRequest, StatusRequestPayload { agent }).with_from(self.agent.clone());
        self.query(envelope, EnvelopeType::StatusResponse).await?.payload_as().map_err(Into::into)
    }

    pub async fn get_inbox(&self, agent: impl Into<String>) -> Result<InboxResponsePayload, ClientError> {
        let envelope = Envelope::new(EnvelopeType::InboxRequest, InboxRequestPayload { agent: agent.into() }).with_from(self.agent.clone());
        self.query(envelope, EnvelopeType::InboxResponse).await?.payload_as().map_err(Into::into)
    }

    pub async fn list_agents(&self, channel: Option<String>) -> Result<ListAgentsResponsePayload, ClientError> {
        let envelope = Envelope::new(EnvelopeType::ListAgentsRequest, ListAgentsRequestPayload { channel }).with_from(self.agent.clone());
        self.query(envelope, EnvelopeType::ListAgentsResponse).await?.payload_as().map_err(Into::into)
    }

    pub async fn get_health(&self) -> Result<HealthResponsePayload, ClientError> {
        let envelope = Envelope::new(EnvelopeType::HealthRequest, HealthRequestPayload {}).with_from(self.agent.clone());
        self.query(envelope, EnvelopeType::HealthResponse).await?.payload_as().map_err(Into::into)
    }

    pub async fn get_metrics(&self) -> Result<MetricsResponsePayload, ClientError> {
        let envelope = Envelope::new(EnvelopeType::MetricsRequest, MetricsRequestPayload {}).with_from(self.agent.clone());
        self.query(envelope, EnvelopeType::MetricsResponse).await?.payload_as().map_err(Into::into)
    }

    pub async fn remove_agent(&self, agent: impl Into<String>) -> Result<RemoveAgentResponsePayload, ClientError> {
        let envelope = Envelope::new(EnvelopeType::RemoveAgentRequest, RemoveAgentRequestPayload { agent: agent.into() }).with_from(self.agent.clone());
        self.query(envelope, EnvelopeType::RemoveAgentResponse).await?.payload_as().map_err(Into::into)
    }

    /// Ask whatever agent is addressed by `spawner` to spawn a new worker,
    /// matched on `payload_meta.reply_to == <this envelope's id>` (spec
    /// §4.7 `spawn`). The relay core never spawns anything itself: it only
    /// routes SPAWN/SPAWN_RESULT like any other addressed message, and some
    /// external collaborator (a dashboard, another orchestrator) answers it.
    pub async fn spawn(
        &self,
        spawner: impl Into<String>,
        name: impl Into<String>,
        cli: impl Into<String>,
        task: impl Into<String>,
        wait_for_ready: bool,
        timeout: Duration,
    ) -> Result<SpawnResultPayload, ClientError> {
        let name = name.into();
        let envelope = Envelope::new(
            EnvelopeType::Spawn,
            SpawnPayload { name: name.clone(), cli: cli.into(), task: task.into(), wait_for_ready },
        )
        .with_from(self.agent.clone())
        .with_to(spawner);

        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Spawn { envelope, reply })
            .map_err(|_| ClientError::Destroyed)?;
        let result_env = tokio::time::timeout(timeout, rx).await.map_err(|_| ClientError::Timeout)?.map_err(|_| ClientError::Destroyed)?;
        let result: SpawnResultPayload = result_env.payload_as()?;

        if result.success && wait_for_ready {
            let (ready_tx, ready_rx) = oneshot::channel();
            self.cmd_tx
                .send(Command::WaitForAgentReady { name, reply: ready_tx })
                .map_err(|_| ClientError::Destroyed)?;
            tokio::time::timeout(timeout, ready_rx).await.map_err(|_| ClientError::Timeout)?.ok();
        }
        Ok(result)
    }

    pub async fn release(&self, releaser: impl Into<String>, name: impl Into<String>, timeout: Duration) -> Result<ReleaseResultPayload, ClientError> {
        let envelope = Envelope::new(EnvelopeType::Release, ReleasePayload { name: name.into() })
            .with_from(self.agent.clone())
            .with_to(releaser);
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Release { envelope, reply })
            .map_err(|_| ClientError::Destroyed)?;
        let result_env = tokio::time::timeout(timeout, rx).await.map_err(|_| ClientError::Timeout)?.map_err(|_| ClientError::Destroyed)?;
        result_env.payload_as().map_err(Into::into)
    }

    /// Answer a `ClientEvent::SpawnRequested` (spec §4.7; an external
    /// collaborator acting as a spawner is expected to call this).
    pub fn reply_spawn_result(&self, requester: impl Into<String>, request_envelope_id: impl Into<String>, success: bool, error: Option<String>) -> Result<(), ClientError> {
        let meta = PayloadMeta { reply_to: Some(request_envelope_id.into()), ..Default::default() };
        let envelope = Envelope::new(EnvelopeType::SpawnResult, SpawnResultPayload { success, error })
            .with_from(self.agent.clone())
            .with_to(requester)
            .with_meta(meta);
        self.send_raw(envelope)
    }

    /// Answer a `ClientEvent::ReleaseRequested`.
    pub fn reply_release_result(&self, requester: impl Into<String>, request_envelope_id: impl Into<String>, success: bool, error: Option<String>) -> Result<(), ClientError> {
        let meta = PayloadMeta { reply_to: Some(request_envelope_id.into()), ..Default::default() };
        let envelope = Envelope::new(EnvelopeType::ReleaseResult, ReleaseResultPayload { success, error })
            .with_from(self.agent.clone())
            .with_to(requester)
            .with_meta(meta);
        self.send_raw(envelope)
    }

    /// Announce that a just-spawned agent is ready (spec §4.7 `spawn`'s
    /// `waitForReady`; the orchestrator calls this once its wrapped CLI
    /// prints its first prompt).
    pub fn announce_ready(&self) -> Result<(), ClientError> {
        let envelope = Envelope::new(EnvelopeType::AgentReady, relay_protocol::AgentReadyPayload { name: self.agent.clone() })
            .with_from(self.agent.clone())
            .with_to("*");
        self.send_raw(envelope)
    }

    /// Terminal shutdown: stop reconnecting and close the socket.
    pub fn destroy(&self) {
        let _ = self.cmd_tx.send(Command::Destroy);
    }
}

/// Per-correlation-id/type waiters the actor resolves as matching traffic
/// arrives. A waiter left unresolved past its caller's own timeout is
/// simply dropped when the caller's `oneshot::Receiver` goes away; the
/// actor's next send on it is a harmless no-op.
#[derive(Default)]
struct Pending {
    acks: HashMap<String, oneshot::Sender<Result<(), ClientError>>>,
    replies: HashMap<String, oneshot::Sender<Envelope>>,
    spawns: HashMap<String, oneshot::Sender<Envelope>>,
    releases: HashMap<String, oneshot::Sender<Envelope>>,
    agent_ready: HashMap<String, oneshot::Sender<()>>,
    /// FIFO per response type: query RPCs have no correlation id on the
    /// wire, but per-connection processing is strictly ordered (spec §5),
    /// so the first pending query of a given type always matches the first
    /// response of that type.
    queries: HashMap<EnvelopeType, VecDeque<oneshot::Sender<Envelope>>>,
}

struct Actor {
    config: ClientConfig,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<ClientEvent>,
    dedupe: DedupeCache,
    pending: Pending,
    destroyed: bool,
}

impl Actor {
    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
        let _ = self.event_tx.send(ClientEvent::StateChange(state));
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>, mut ready_tx: Option<oneshot::Sender<Result<(), ClientError>>>) {
        let mut attempt = 0u32;
        loop {
            self.set_state(ConnectionState::Connecting);
            match self.connect_once().await {
                Ok((stream, outcome)) => {
                    attempt = 0;
                    self.config.resume_token = Some(outcome.resume_token);
                    self.set_state(ConnectionState::Ready);
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                    self.steady_loop(stream, &mut cmd_rx).await;
                    if self.destroyed {
                        break;
                    }
                }
                Err(e) => {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(e));
                        return;
                    }
                    warn!(agent = %self.config.agent, error = %e, "reconnect attempt failed");
                }
            }

            attempt += 1;
            self.set_state(ConnectionState::Backoff);
            let Some(delay) = crate::backoff::delay_for_attempt(&self.config.reconnect, attempt) else {
                warn!(agent = %self.config.agent, "exhausted reconnect attempts, giving up");
                break;
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                cmd = cmd_rx.recv() => {
                    if matches!(cmd, Some(Command::Destroy) | None) {
                        self.destroyed = true;
                        break;
                    }
                }
            }
        }
        self.set_state(ConnectionState::Destroyed);
    }

    async fn connect_once(&mut self) -> Result<(UnixStream, WelcomePayload), ClientError> {
        self.set_state(ConnectionState::Handshaking);
        let mut stream = UnixStream::connect(&self.config.socket_path).await?;

        let hello = Envelope::new(
            EnvelopeType::Hello,
            HelloPayload {
                agent: self.config.agent.clone(),
                entity_type: self.config.entity_type,
                cli: self.config.cli.clone(),
                capabilities: self.config.capabilities.clone(),
                session: self.config.resume_token.clone().map(|resume_token| relay_protocol::SessionClaim { resume_token }),
                is_system_component: self.config.is_system_component,
            },
        )
        .with_from(self.config.agent.clone());

        let mode = negotiate_frame_mode(&self.config.capabilities);
        write_frame(&mut stream, &hello, mode).await?;

        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 16 * 1024];
        let env = tokio::time::timeout(self.config.connect_timeout, next_envelope(&mut stream, &mut decoder, &mut buf))
            .await
            .map_err(|_| ClientError::ConnectTimeout)??;

        match env.typ {
            EnvelopeType::Welcome => {
                let welcome: WelcomePayload = env.payload_as()?;
                Ok((stream, welcome))
            }
            EnvelopeType::Error => {
                let payload: ErrorPayload = env.payload_as().unwrap_or(ErrorPayload {
                    code: "UNKNOWN".into(),
                    message: "handshake rejected".into(),
                    fatal: true,
                    trace_id: None,
                });
                Err(ClientError::HandshakeRejected { code: payload.code, message: payload.message })
            }
            _ => Err(ClientError::HandshakeRejected { code: "UNEXPECTED_FRAME".into(), message: "expected WELCOME".into() }),
        }
    }

    async fn steady_loop(&mut self, stream: UnixStream, cmd_rx: &mut mpsc::UnboundedReceiver<Command>) {
        let (mut read_half, mut write_half) = stream.into_split();
        let mode = negotiate_frame_mode(&self.config.capabilities);
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 16 * 1024];
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();

        loop {
            tokio::select! {
                result = next_envelope(&mut read_half, &mut decoder, &mut buf) => {
                    match result {
                        Ok(env) => self.handle_inbound(env, &outbound_tx).await,
                        Err(_) => {
                            debug!(agent = %self.config.agent, "connection closed");
                            break;
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Destroy) | None => {
                            self.destroyed = true;
                            let bye = Envelope::new(EnvelopeType::Bye, serde_json::Value::Null).with_from(self.config.agent.clone());
                            let _ = write_frame(&mut write_half, &bye, mode).await;
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd, &outbound_tx),
                    }
                }
                outbound = outbound_rx.recv() => {
                    let Some(first) = outbound else { break };
                    let mut batch = vec![first];
                    while let Ok(env) = outbound_rx.try_recv() {
                        batch.push(env);
                    }
                    match encode_batch(&batch, mode) {
                        Ok(bytes) => {
                            if write_half.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(agent = %self.config.agent, error = %e, "failed to encode outbound batch"),
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command, outbound_tx: &mpsc::UnboundedSender<Envelope>) {
        match cmd {
            Command::Send { envelope } => {
                let _ = outbound_tx.send(envelope);
            }
            Command::SendAndWait { envelope, correlation_id, reply } => {
                self.pending.acks.insert(correlation_id, reply);
                let _ = outbound_tx.send(envelope);
            }
            Command::Request { envelope, correlation_id, reply } => {
                self.pending.replies.insert(correlation_id, reply);
                let _ = outbound_tx.send(envelope);
            }
            Command::Spawn { envelope, reply } => {
                self.pending.spawns.insert(envelope.id.clone(), reply);
                let _ = outbound_tx.send(envelope);
            }
            Command::Release { envelope, reply } => {
                self.pending.releases.insert(envelope.id.clone(), reply);
                let _ = outbound_tx.send(envelope);
            }
            Command::WaitForAgentReady { name, reply } => {
                self.pending.agent_ready.insert(name, reply);
            }
            Command::Query { envelope, response_type, reply } => {
                self.pending.queries.entry(response_type).or_default().push_back(reply);
                let _ = outbound_tx.send(envelope);
            }
            Command::Destroy => {}
        }
    }

    async fn handle_inbound(&mut self, env: Envelope, outbound_tx: &mpsc::UnboundedSender<Envelope>) {
        match env.typ {
            EnvelopeType::Ping => {
                let pong = Envelope::new(EnvelopeType::Pong, serde_json::Value::Null);
                let _ = outbound_tx.send(pong);
            }
            EnvelopeType::Deliver => {
                // At-least-once delivery requires an ACK for every DELIVER
                // received, even a duplicate retransmit: the sender's
                // tracker only clears on seeing one (spec §4.4). Dedupe
                // only gates whether we dispatch it again.
                self.ack_deliver(&env, outbound_tx);
                if self.dedupe.check_and_insert(&env.id) {
                    return;
                }
                self.dispatch_deliver(env);
            }
            EnvelopeType::Ack => {
                if let Ok(payload) = env.payload_as::<relay_protocol::AckPayload>() {
                    if let Some(correlation_id) = payload.correlation_id {
                        if let Some(tx) = self.pending.acks.remove(&correlation_id) {
                            let _ = tx.send(Ok(()));
                        }
                    }
                }
            }
            EnvelopeType::Error => {
                if let Ok(payload) = env.payload_as::<ErrorPayload>() {
                    if payload.code == "DELIVERY_FAILED" {
                        if let Some(correlation_id) = payload.trace_id.clone() {
                            if let Some(tx) = self.pending.acks.remove(&correlation_id) {
                                let _ = tx.send(Err(ClientError::Remote { code: payload.code.clone(), message: payload.message.clone() }));
                            }
                        }
                    }
                    let _ = self.event_tx.send(ClientEvent::Error { code: payload.code, message: payload.message, fatal: payload.fatal });
                }
            }
            EnvelopeType::StatusResponse
            | EnvelopeType::InboxResponse
            | EnvelopeType::ListAgentsResponse
            | EnvelopeType::HealthResponse
            | EnvelopeType::MetricsResponse
            | EnvelopeType::RemoveAgentResponse
            | EnvelopeType::MessagesQueryResponse => {
                if let Some(queue) = self.pending.queries.get_mut(&env.typ) {
                    if let Some(tx) = queue.pop_front() {
                        let _ = tx.send(env);
                    }
                }
            }
            other => {
                debug!(agent = %self.config.agent, ?other, "unhandled inbound envelope type");
            }
        }
    }

    fn ack_deliver(&self, env: &Envelope, outbound_tx: &mpsc::UnboundedSender<Envelope>) {
        // The tracker keys pending deliveries by the DELIVER's own id (spec
        // §4.4), so the ACK must carry that same id rather than a fresh one.
        let mut ack = Envelope::new(EnvelopeType::Ack, relay_protocol::AckPayload { correlation_id: correlation_id_of(env) })
            .with_from(self.config.agent.clone());
        ack.id = env.id.clone();
        let _ = outbound_tx.send(ack);
    }

    /// A DELIVER's own `type` is always `DELIVER`; `delivery.original_type`
    /// carries what the sender actually sent (SEND, SPAWN, LOG, ...), since
    /// SPAWN/RELEASE/LOG/AGENT_READY are routed through the very same
    /// address-resolution-and-tracking path as a chat message (spec §4.5).
    fn dispatch_deliver(&mut self, env: Envelope) {
        let original_type = env.delivery.as_ref().map(|d| d.original_type).unwrap_or(EnvelopeType::Send);
        let from = env.from.clone().unwrap_or_default();

        match original_type {
            EnvelopeType::SpawnResult => {
                if let Some(id) = env.payload_meta.as_ref().and_then(|m| m.reply_to.clone()) {
                    if let Some(tx) = self.pending.spawns.remove(&id) {
                        let _ = tx.send(env);
                    }
                }
                return;
            }
            EnvelopeType::ReleaseResult => {
                if let Some(id) = env.payload_meta.as_ref().and_then(|m| m.reply_to.clone()) {
                    if let Some(tx) = self.pending.releases.remove(&id) {
                        let _ = tx.send(env);
                    }
                }
                return;
            }
            EnvelopeType::AgentReady => {
                if let Ok(payload) = env.payload_as::<relay_protocol::AgentReadyPayload>() {
                    if let Some(tx) = self.pending.agent_ready.remove(&payload.name) {
                        let _ = tx.send(());
                    }
                    let _ = self.event_tx.send(ClientEvent::AgentReady { name: payload.name });
                }
                return;
            }
            EnvelopeType::Spawn => {
                if let Ok(payload) = env.payload_as::<SpawnPayload>() {
                    let _ = self.event_tx.send(ClientEvent::SpawnRequested { from, envelope_id: env.id, payload });
                }
                return;
            }
            EnvelopeType::Release => {
                if let Ok(payload) = env.payload_as::<ReleasePayload>() {
                    let _ = self.event_tx.send(ClientEvent::ReleaseRequested { from, envelope_id: env.id, payload });
                }
                return;
            }
            EnvelopeType::Log => {
                if let Ok(payload) = env.payload_as::<SendPayload>() {
                    let _ = self.event_tx.send(ClientEvent::Log { from, body: payload.body });
                }
                return;
            }
            _ => {}
        }

        let Ok(payload) = env.payload_as::<SendPayload>() else { return };

        // A reply to an outstanding `request()`, matched by `replyTo` or
        // `data._correlationId` (spec §4.7 `request`).
        let reply_correlation = env
            .payload_meta
            .as_ref()
            .and_then(|m| m.reply_to.clone())
            .or_else(|| payload.data.as_ref().and_then(|d| d.get("_correlationId")).and_then(|v| v.as_str()).map(str::to_string));
        if let Some(correlation_id) = reply_correlation {
            if let Some(tx) = self.pending.replies.remove(&correlation_id) {
                let _ = tx.send(env);
                return;
            }
        }

        let channel = env.delivery.as_ref().map(|d| d.original_to.clone()).filter(|t| is_channel_target(t));
        if let Some(channel) = channel {
            let _ = self.event_tx.send(ClientEvent::ChannelMessage { from, channel, body: payload.body, data: payload.data });
        } else {
            let _ = self.event_tx.send(ClientEvent::Message {
                from,
                payload,
                payload_meta: env.payload_meta,
                delivery: env.delivery,
            });
        }
    }
}

fn correlation_id_of(env: &Envelope) -> Option<String> {
    env.payload_meta.as_ref().and_then(|m| m.sync.as_ref()).map(|s| s.correlation_id.clone())
}

fn is_channel_target(target: &str) -> bool {
    target.starts_with('#') || target.starts_with("dm:")
}

fn negotiate_frame_mode(caps: &relay_protocol::Capabilities) -> FrameMode {
    match caps.codec.as_deref() {
        Some("cbor") => FrameMode::Current(Codec::Cbor),
        Some("legacy") => FrameMode::Legacy,
        _ => FrameMode::Current(Codec::Json),
    }
}

async fn next_envelope<R: AsyncReadExt + Unpin>(reader: &mut R, decoder: &mut FrameDecoder, buf: &mut [u8]) -> Result<Envelope, ClientError> {
    loop {
        match decoder.next_envelope() {
            Ok(Some(env)) => return Ok(env),
            Ok(None) => {}
            Err(e) => return Err(e.into()),
        }
        let n = reader.read(buf).await?;
        if n == 0 {
            return Err(ClientError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed")));
        }
        decoder.feed(&buf[..n]);
    }
}

async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, env: &Envelope, mode: FrameMode) -> Result<(), ClientError> {
    let bytes = relay_protocol::encode_frame(env, mode)?;
    writer.write_all(&bytes).await?;
    Ok(())
}
