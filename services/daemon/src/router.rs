//! Router (spec §4.5) — address resolution, fan-out, shadow duplication,
//! channel fan-out, storage hook.
//!
//! The router is a single-task actor: every public operation is a message
//! sent over an `mpsc` channel and processed strictly sequentially (spec
//! §5: "all router operations MUST be serialized"). This mirrors the
//! teacher's `ControlService` hub (`sven-node/src/control/service.rs`),
//! which funnels commands from several transports through one sequential
//! loop and broadcasts resulting events back out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use relay_protocol::{
    DeliveryInfo, Envelope, EnvelopeType, ErrorPayload, HelloPayload, PayloadMeta, SendPayload,
    ShadowBindPayload, WelcomePayload,
};

use crate::cloud_sync::CloudSync;
use crate::config::DaemonConfig;
use crate::error::HandshakeError;
use crate::files;
use crate::membership::{MembershipAction, MembershipStore};
use crate::registry::{is_reserved_name, AgentRegistry, EntityType as RegistryEntityType};
use crate::session::{Session, SessionStore};
use crate::storage::{MessageFilter, MessageStatus, StorageAdapter};
use crate::tracker::{DeliveryTracker, TrackerEvent};

/// Reserved names handled by an external control-plane collaborator (spec
/// §4.5 "Consensus and control messages").
const CONTROL_PLANE_NAMES: &[&str] = &["_consensus", "_router"];

/// A shadow binding (spec §3).
#[derive(Debug, Clone)]
pub struct ShadowBinding {
    pub shadow: String,
    pub primary: String,
    pub speak_on: Vec<relay_protocol::ShadowSpeakOn>,
    pub receive_incoming: bool,
    pub receive_outgoing: bool,
}

impl ShadowBinding {
    fn permits(&self, _trigger: relay_protocol::ShadowSpeakOn) -> bool {
        self.speak_on.contains(&relay_protocol::ShadowSpeakOn::AllMessages)
            || self.speak_on.contains(&_trigger)
    }
}

/// Outcome of a successful HELLO handshake, returned to the `Connection`.
#[derive(Debug, Clone)]
pub struct WelcomeOutcome {
    pub session: Session,
    pub replay: Vec<Envelope>,
}

/// A sink the router uses to push envelopes at a specific connection. The
/// router never holds the connection itself — only this sender — so a
/// dropped connection simply makes sends silently no-op until `unregister`
/// catches up (spec §9 cyclic-reference note).
pub type OutboundSink = mpsc::UnboundedSender<Envelope>;

enum Command {
    RegisterConnection {
        connection_id: String,
        sink: OutboundSink,
    },
    UnregisterConnection {
        connection_id: String,
    },
    Hello {
        connection_id: String,
        payload: HelloPayload,
        reply: oneshot::Sender<Result<WelcomeOutcome, HandshakeError>>,
    },
    Route {
        sender_connection_id: String,
        envelope: Envelope,
    },
    Ack {
        connection_id: String,
        envelope_id: String,
    },
    Subscribe {
        agent: String,
        topic: String,
    },
    Unsubscribe {
        agent: String,
        topic: String,
    },
    ChannelJoin {
        agent: String,
        channel: String,
    },
    ChannelLeave {
        agent: String,
        channel: String,
    },
    ChannelMessage {
        sender_connection_id: String,
        envelope: Envelope,
    },
    BindShadow {
        shadow: String,
        payload: ShadowBindPayload,
    },
    UnbindShadow {
        shadow: String,
        primary: String,
    },
    BroadcastSystemMessage {
        envelope: Envelope,
    },
    Touch {
        agent: String,
    },
    SetProcessing {
        agent: String,
        processing: bool,
    },
    ConnectedNames {
        reply: oneshot::Sender<Vec<String>>,
    },
    InboxRequest {
        agent: String,
        reply: oneshot::Sender<Vec<Envelope>>,
    },
    Status {
        agent: Option<String>,
        reply: oneshot::Sender<Vec<relay_protocol::AgentStatus>>,
    },
    Health {
        reply: oneshot::Sender<relay_protocol::HealthResponsePayload>,
    },
    Metrics {
        reply: oneshot::Sender<relay_protocol::MetricsResponsePayload>,
    },
    RemoveAgent {
        agent: String,
        reply: oneshot::Sender<bool>,
    },
    IsProcessing {
        agent: String,
        reply: oneshot::Sender<bool>,
    },
    Tick,
    /// Periodic snapshot-file writer tick (spec §4.3, §4.6: `state_file_interval`).
    FlushSnapshots,
    Shutdown,
}

/// Cheap, clone-able handle callers use to talk to the router task.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl RouterHandle {
    pub fn register_connection(&self, connection_id: String, sink: OutboundSink) {
        let _ = self.tx.send(Command::RegisterConnection { connection_id, sink });
    }

    pub fn unregister_connection(&self, connection_id: String) {
        let _ = self.tx.send(Command::UnregisterConnection { connection_id });
    }

    pub async fn hello(
        &self,
        connection_id: String,
        payload: HelloPayload,
    ) -> Result<WelcomeOutcome, HandshakeError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Hello { connection_id, payload, reply });
        rx.await.unwrap_or(Err(HandshakeError::Timeout))
    }

    pub fn route(&self, sender_connection_id: String, envelope: Envelope) {
        let _ = self.tx.send(Command::Route { sender_connection_id, envelope });
    }

    pub fn ack(&self, connection_id: String, envelope_id: String) {
        let _ = self.tx.send(Command::Ack { connection_id, envelope_id });
    }

    pub fn subscribe(&self, agent: String, topic: String) {
        let _ = self.tx.send(Command::Subscribe { agent, topic });
    }

    pub fn unsubscribe(&self, agent: String, topic: String) {
        let _ = self.tx.send(Command::Unsubscribe { agent, topic });
    }

    pub fn channel_join(&self, agent: String, channel: String) {
        let _ = self.tx.send(Command::ChannelJoin { agent, channel });
    }

    pub fn channel_leave(&self, agent: String, channel: String) {
        let _ = self.tx.send(Command::ChannelLeave { agent, channel });
    }

    pub fn channel_message(&self, sender_connection_id: String, envelope: Envelope) {
        let _ = self
            .tx
            .send(Command::ChannelMessage { sender_connection_id, envelope });
    }

    pub fn bind_shadow(&self, shadow: String, payload: ShadowBindPayload) {
        let _ = self.tx.send(Command::BindShadow { shadow, payload });
    }

    pub fn unbind_shadow(&self, shadow: String, primary: String) {
        let _ = self.tx.send(Command::UnbindShadow { shadow, primary });
    }

    pub fn broadcast_system_message(&self, envelope: Envelope) {
        let _ = self.tx.send(Command::BroadcastSystemMessage { envelope });
    }

    pub fn touch(&self, agent: String) {
        let _ = self.tx.send(Command::Touch { agent });
    }

    pub fn set_processing(&self, agent: String, processing: bool) {
        let _ = self.tx.send(Command::SetProcessing { agent, processing });
    }

    pub async fn connected_names(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::ConnectedNames { reply });
        rx.await.unwrap_or_default()
    }

    pub async fn inbox(&self, agent: String) -> Vec<Envelope> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::InboxRequest { agent, reply });
        rx.await.unwrap_or_default()
    }

    pub async fn status(&self, agent: Option<String>) -> Vec<relay_protocol::AgentStatus> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Status { agent, reply });
        rx.await.unwrap_or_default()
    }

    pub async fn health(&self) -> relay_protocol::HealthResponsePayload {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Health { reply });
        rx.await.unwrap_or(relay_protocol::HealthResponsePayload {
            uptime_ms: 0,
            connected_agents: 0,
            pending_deliveries: 0,
        })
    }

    pub async fn metrics(&self) -> relay_protocol::MetricsResponsePayload {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Metrics { reply });
        rx.await.unwrap_or(relay_protocol::MetricsResponsePayload {
            connected_agents: 0,
            pending_deliveries: 0,
            dedupe_size: 0,
        })
    }

    pub async fn remove_agent(&self, agent: String) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::RemoveAgent { agent, reply });
        rx.await.unwrap_or(false)
    }

    /// Whether `agent` is currently observed as processing (spec §4.2
    /// heartbeat exemption).
    pub async fn is_processing(&self, agent: String) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::IsProcessing { agent, reply });
        rx.await.unwrap_or(false)
    }

    pub fn tick(&self) {
        let _ = self.tx.send(Command::Tick);
    }

    pub fn flush_snapshots(&self) {
        let _ = self.tx.send(Command::FlushSnapshots);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// Router task state, owned exclusively by the loop in `run`.
pub struct Router {
    config: DaemonConfig,
    registry: AgentRegistry,
    sessions: SessionStore,
    tracker: DeliveryTracker,
    connections: HashMap<String, OutboundSink>,
    seq_counters: HashMap<(String, String), u64>,
    subscriptions: HashMap<String, HashSet<String>>,
    shadows: Vec<ShadowBinding>,
    processing: HashSet<String>,
    storage: Arc<dyn StorageAdapter>,
    membership: Arc<dyn MembershipStore>,
    cloud_sync: Arc<dyn CloudSync>,
    /// Set whenever the connected-agent set changes, cleared once the
    /// debounced cloud-sync flush picks it up (spec §4.6 `cloud_sync_debounce`).
    cloud_sync_dirty: bool,
    started_at: std::time::Instant,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl Router {
    pub fn spawn(
        config: DaemonConfig,
        storage: Arc<dyn StorageAdapter>,
        membership: Arc<dyn MembershipStore>,
        cloud_sync: Arc<dyn CloudSync>,
    ) -> (RouterHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Router {
            tracker: DeliveryTracker::new(config.ack_timeout, config.max_attempts, config.delivery_ttl),
            registry: AgentRegistry::new(),
            sessions: SessionStore::new(),
            connections: HashMap::new(),
            seq_counters: HashMap::new(),
            subscriptions: HashMap::new(),
            shadows: Vec::new(),
            processing: HashSet::new(),
            storage,
            membership,
            cloud_sync,
            cloud_sync_dirty: false,
            started_at: std::time::Instant::now(),
            rx,
            config,
        };
        let handle = RouterHandle { tx: tx.clone() };
        let tracker_tick_handle = RouterHandle { tx: tx.clone() };
        let snapshot_tick_handle = RouterHandle { tx };
        let tracker_interval = router.config.tracker_tick_interval;
        let state_file_interval = router.config.state_file_interval;
        let join = tokio::spawn(async move {
            let mut tracker_ticker = tokio::time::interval(tracker_interval);
            let mut snapshot_ticker = tokio::time::interval(state_file_interval);
            let run = router.run();
            tokio::pin!(run);
            loop {
                tokio::select! {
                    _ = tracker_ticker.tick() => tracker_tick_handle.tick(),
                    _ = snapshot_ticker.tick() => snapshot_tick_handle.flush_snapshots(),
                    _ = &mut run => break,
                }
            }
        });
        (handle, join)
    }

    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Shutdown => break,
                other => self.handle(other).await,
            }
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::RegisterConnection { connection_id, sink } => {
                self.connections.insert(connection_id, sink);
            }
            Command::UnregisterConnection { connection_id } => {
                self.connections.remove(&connection_id);
                self.tracker.clear_for_connection(&connection_id);
                if let Some(name) = self.registry.all().find(|a| a.connection_id.as_deref() == Some(connection_id.as_str())).map(|a| a.name.clone()) {
                    self.registry.mark_offline(&name);
                    self.processing.remove(&name);
                    self.cloud_sync_dirty = true;
                }
            }
            Command::Hello { connection_id, payload, reply } => {
                let result = self.do_hello(&connection_id, payload).await;
                let _ = reply.send(result);
            }
            Command::Route { sender_connection_id, envelope } => {
                self.do_route(&sender_connection_id, envelope).await;
            }
            Command::Ack { connection_id, envelope_id } => {
                self.do_ack(&connection_id, &envelope_id).await;
            }
            Command::Subscribe { agent, topic } => {
                self.subscriptions.entry(topic).or_default().insert(agent);
            }
            Command::Unsubscribe { agent, topic } => {
                if let Some(set) = self.subscriptions.get_mut(&topic) {
                    set.remove(&agent);
                }
            }
            Command::ChannelJoin { agent, channel } => {
                self.registry.join_channel(&agent, &channel);
                let workspace = self.config.workspace_id.clone().unwrap_or_default();
                self.membership.upsert(&workspace, &channel, &agent, MembershipAction::Join).await;
            }
            Command::ChannelLeave { agent, channel } => {
                self.registry.leave_channel(&agent, &channel);
                let workspace = self.config.workspace_id.clone().unwrap_or_default();
                self.membership.upsert(&workspace, &channel, &agent, MembershipAction::Leave).await;
            }
            Command::ChannelMessage { sender_connection_id, envelope } => {
                self.do_channel_message(&sender_connection_id, envelope).await;
            }
            Command::BindShadow { shadow, payload } => {
                self.shadows.retain(|b| !(b.shadow == shadow && b.primary == payload.primary));
                self.shadows.push(ShadowBinding {
                    shadow,
                    primary: payload.primary,
                    speak_on: payload.speak_on,
                    receive_incoming: payload.receive_incoming,
                    receive_outgoing: payload.receive_outgoing,
                });
            }
            Command::UnbindShadow { shadow, primary } => {
                self.shadows.retain(|b| !(b.shadow == shadow && b.primary == primary));
            }
            Command::BroadcastSystemMessage { envelope } => {
                let names = self.registry.connected_names();
                for name in names {
                    self.send_to_agent(&name, envelope.clone()).await;
                }
            }
            Command::Touch { agent } => {
                self.registry.touch(&agent);
            }
            Command::SetProcessing { agent, processing } => {
                if processing {
                    self.processing.insert(agent);
                } else {
                    self.processing.remove(&agent);
                }
            }
            Command::ConnectedNames { reply } => {
                let _ = reply.send(self.registry.connected_names());
            }
            Command::InboxRequest { agent, reply } => {
                let messages = self
                    .storage
                    .get_messages(MessageFilter { agent: Some(agent), ..Default::default() })
                    .await
                    .unwrap_or_default();
                let _ = reply.send(messages);
            }
            Command::Status { agent, reply } => {
                let statuses = self.do_status(agent);
                let _ = reply.send(statuses);
            }
            Command::Health { reply } => {
                let _ = reply.send(relay_protocol::HealthResponsePayload {
                    uptime_ms: self.started_at.elapsed().as_millis() as u64,
                    connected_agents: self.registry.connected_names().len() as u32,
                    pending_deliveries: self.tracker.pending_count() as u32,
                });
            }
            Command::Metrics { reply } => {
                let _ = reply.send(relay_protocol::MetricsResponsePayload {
                    connected_agents: self.registry.connected_names().len() as u32,
                    pending_deliveries: self.tracker.pending_count() as u32,
                    dedupe_size: 0,
                });
            }
            Command::RemoveAgent { agent, reply } => {
                let existed = self.registry.get(&agent).is_some();
                if let Some(connection_id) = self.registry.connection_id_for(&agent) {
                    self.connections.remove(&connection_id);
                    self.tracker.clear_for_connection(&connection_id);
                }
                self.registry.mark_offline(&agent);
                self.processing.remove(&agent);
                self.cloud_sync_dirty = true;
                let _ = reply.send(existed);
            }
            Command::IsProcessing { agent, reply } => {
                let _ = reply.send(self.processing.contains(&agent));
            }
            Command::Tick => self.do_tick().await,
            Command::FlushSnapshots => self.flush_snapshots().await,
            Command::Shutdown => unreachable!("handled in run()"),
        }
    }

    async fn do_hello(&mut self, connection_id: &str, payload: HelloPayload) -> Result<WelcomeOutcome, HandshakeError> {
        if is_reserved_name(&payload.agent) && !payload.is_system_component {
            return Err(HandshakeError::UnauthorizedName);
        }

        let session = if let Some(claim) = &payload.session {
            match self.sessions.resume(&claim.resume_token, &payload.agent) {
                Some(session) => session,
                None => return Err(HandshakeError::ResumeTooOld),
            }
        } else {
            self.sessions.create(&payload.agent)
        };

        let entity_type = match payload.entity_type {
            relay_protocol::EntityType::Agent => RegistryEntityType::Agent,
            relay_protocol::EntityType::User => RegistryEntityType::User,
        };

        if !self.registry.register(&payload.agent, entity_type, connection_id, &session.id) {
            return Err(HandshakeError::DuplicateConnection);
        }

        if let Some(record) = self.registry.get_mut(&payload.agent) {
            record.cli = payload.cli.clone();
        }

        // Auto-join #general happens in exactly one place: here (spec §9
        // Open Question).
        self.registry.join_channel(&payload.agent, "#general");

        let replay = self.tracker.replay_pending(&session.id, connection_id);
        self.cloud_sync_dirty = true;

        Ok(WelcomeOutcome { session, replay })
    }

    async fn do_route(&mut self, sender_connection_id: &str, mut envelope: Envelope) {
        let Some(to) = envelope.to.clone() else {
            self.send_error(sender_connection_id, "MISSING_TO", "SEND requires `to`", false).await;
            return;
        };
        let from = envelope.from.clone().unwrap_or_default();

        let echo_self = envelope
            .payload_as::<SendPayload>()
            .map(|p| p.echo_self())
            .unwrap_or(false);
        if to == from && !echo_self {
            self.send_error(sender_connection_id, "SELF_ADDRESSED", "a message may not target its own sender", false).await;
            return;
        }

        if CONTROL_PLANE_NAMES.contains(&to.as_str()) {
            debug!(target = %to, "control-plane envelope bypasses delivery, awaiting external handler");
            return;
        }

        if to == "*" {
            let names: Vec<String> = self.registry.connected_names().into_iter().filter(|n| n != &from).collect();
            for name in names {
                self.deliver_to(&name, envelope.clone(), "*").await;
            }
            return;
        }

        if to.starts_with('#') || is_dm_channel(&to) {
            self.fan_out_channel(&to, envelope, &from).await;
            return;
        }

        if self.registry.is_online(&to) {
            let original_to = to.clone();
            self.deliver_to(&to, envelope, &original_to).await;
            return;
        }

        if let Some(daemon_id) = self.cloud_sync.resolve_remote(&to).await {
            let payload: SendPayload = envelope.payload_as().unwrap_or_else(|_| SendPayload::message(""));
            self.cloud_sync
                .send_cross_machine_message(&daemon_id, &to, &from, &payload.body)
                .await;
            return;
        }

        // Store-and-forward: unknown recipient.
        let _ = self.storage.save_message(&envelope).await;
        envelope.delivery = None;
        let strict = envelope
            .payload_meta
            .as_ref()
            .and_then(|m| m.strict)
            .unwrap_or(false);
        if strict {
            self.send_error(sender_connection_id, "UNKNOWN_RECIPIENT", &format!("no such agent: {to}"), false).await;
        }
    }

    async fn fan_out_channel(&mut self, channel: &str, envelope: Envelope, from: &str) {
        let mut members: Vec<String> = self.registry.local_channel_members(channel);
        let workspace = self.config.workspace_id.clone().unwrap_or_default();
        let persisted = self.membership.list(&workspace, channel).await;
        for member in persisted {
            if !members.contains(&member) && self.registry.is_online(&member) {
                members.push(member);
            } else if !members.contains(&member) {
                if let Some(daemon_id) = self.cloud_sync.resolve_remote(&member).await {
                    let payload: SendPayload = envelope.payload_as().unwrap_or_else(|_| SendPayload::message(""));
                    self.cloud_sync.send_cross_machine_message(&daemon_id, &member, from, &payload.body).await;
                }
            }
        }

        for member in members {
            if member == from {
                continue;
            }
            self.deliver_to(&member, envelope.clone(), channel).await;
        }
    }

    async fn do_channel_message(&mut self, sender_connection_id: &str, envelope: Envelope) {
        let Some(channel) = envelope.topic.clone().or_else(|| envelope.to.clone()) else {
            self.send_error(sender_connection_id, "MISSING_CHANNEL", "CHANNEL_MESSAGE requires a topic/to", false).await;
            return;
        };
        let from = envelope.from.clone().unwrap_or_default();
        self.fan_out_channel(&channel, envelope, &from).await;
    }

    /// Resolve the next monotonic seq for (recipient, session).
    fn next_seq(&mut self, recipient: &str, session_id: &str) -> u64 {
        let key = (recipient.to_string(), session_id.to_string());
        let counter = self.seq_counters.entry(key).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Build and send one DELIVER to a single online recipient, tracking it
    /// for ack/retry and duplicating to any bound shadows (spec §4.5 steps 1-5).
    async fn deliver_to(&mut self, recipient: &str, envelope: Envelope, original_to: &str) {
        let Some(session_id) = self.registry.get(recipient).and_then(|a| a.session_id.clone()) else {
            return;
        };
        let Some(connection_id) = self.registry.connection_id_for(recipient) else {
            return;
        };

        if self.tracker.inflight_for_connection(&connection_id) as u32 >= self.config.default_max_inflight {
            warn!(recipient, "max_inflight exceeded, deferring delivery to session pending list");
            // The session's pending list already carries anything beyond
            // in-flight capacity once it is tracked below; for a delivery
            // that can't even start, store-and-forward instead.
            let _ = self.storage.save_message(&envelope).await;
            return;
        }

        let seq = self.next_seq(recipient, &session_id);
        let deliver = Envelope::new(EnvelopeType::Deliver, envelope.payload.clone())
            .with_from(envelope.from.clone().unwrap_or_default())
            .with_to(recipient)
            .with_delivery(DeliveryInfo {
                seq,
                session_id: session_id.clone(),
                original_to: original_to.to_string(),
                original_type: envelope.typ,
            });
        let deliver = match envelope.payload_meta.clone() {
            Some(meta) => deliver.with_meta(meta),
            None => deliver,
        };

        self.send_on_connection(&connection_id, deliver.clone());
        self.tracker.track(
            deliver.clone(),
            connection_id,
            recipient.to_string(),
            session_id,
            envelope.from.clone(),
        );
        self.processing.insert(recipient.to_string());

        let trigger = relay_protocol::ShadowSpeakOn::AllMessages;
        let shadow_targets: Vec<ShadowBinding> = self
            .shadows
            .iter()
            .filter(|b| b.primary.eq_ignore_ascii_case(recipient) && b.receive_incoming && b.permits(trigger))
            .cloned()
            .collect();
        for shadow in shadow_targets {
            if self.registry.is_online(&shadow.shadow) {
                Box::pin(self.deliver_to(&shadow.shadow, envelope.clone(), original_to)).await;
            }
        }

        let _ = self.storage.save_message(&envelope).await;
    }

    async fn send_to_agent(&mut self, agent: &str, envelope: Envelope) {
        if let Some(connection_id) = self.registry.connection_id_for(agent) {
            self.send_on_connection(&connection_id, envelope);
        }
    }

    fn send_on_connection(&self, connection_id: &str, envelope: Envelope) {
        if let Some(sink) = self.connections.get(connection_id) {
            let _ = sink.send(envelope);
        }
    }

    async fn send_error(&self, connection_id: &str, code: &str, message: &str, fatal: bool) {
        let env = Envelope::new(
            EnvelopeType::Error,
            ErrorPayload { code: code.into(), message: message.into(), fatal, trace_id: None },
        );
        self.send_on_connection(connection_id, env);
    }

    /// Forward an ACK's correlation id back to the agent that originated
    /// the SEND, so a `sendAndWait` caller can resolve (spec §4.7) — the
    /// recipient's ACK only reaches the tracker directly; nothing else
    /// notifies the original sender without this.
    async fn do_ack(&mut self, connection_id: &str, envelope_id: &str) {
        let Some(cleared) = self.tracker.ack(envelope_id, connection_id) else {
            return;
        };
        let Some(sender) = cleared.sender else {
            return;
        };
        let correlation_id = cleared
            .envelope
            .payload_meta
            .as_ref()
            .and_then(|m| m.sync.as_ref())
            .map(|s| s.correlation_id.clone());
        let ack = Envelope::new(EnvelopeType::Ack, relay_protocol::AckPayload { correlation_id })
            .with_from(cleared.recipient)
            .with_to(&sender);
        self.send_to_agent(&sender, ack).await;
    }

    async fn do_tick(&mut self) {
        let events = self.tracker.tick();
        for event in events {
            match event {
                TrackerEvent::Retransmit { envelope, target_connection_id } => {
                    self.send_on_connection(&target_connection_id, envelope);
                }
                TrackerEvent::Failed { envelope_id, recipient, sender, correlation_id } => {
                    let _ = self.storage.update_message_status(&envelope_id, MessageStatus::Failed).await;
                    info!(envelope_id, recipient, "delivery-failed");
                    if let Some(sender) = sender {
                        let err = Envelope::new(
                            EnvelopeType::Error,
                            ErrorPayload {
                                code: "DELIVERY_FAILED".into(),
                                message: format!("delivery to {recipient} failed after max attempts/ttl"),
                                fatal: false,
                                trace_id: correlation_id.or(Some(envelope_id)),
                            },
                        );
                        self.send_to_agent(&sender, err).await;
                    }
                }
            }
        }
    }

    /// Rewrite `agents.json`/`connected-agents.json`/`processing-state.json`
    /// and, if the connected-agent set changed since the last flush, push a
    /// debounced cloud-sync update (spec §4.3, §4.6).
    async fn flush_snapshots(&mut self) {
        files::write_agents_file(&self.config.state_dir, &self.registry);
        files::write_connected_agents_file(&self.config.state_dir, &self.registry);
        files::write_processing_state_file(&self.config.state_dir, &self.processing);

        if self.cloud_sync_dirty {
            self.cloud_sync_dirty = false;
            self.cloud_sync.update_agents(self.registry.connected_names()).await;
        }
    }

    fn do_status(&self, agent: Option<String>) -> Vec<relay_protocol::AgentStatus> {
        self.registry
            .all()
            .filter(|a| agent.as_deref().map(|want| a.name.eq_ignore_ascii_case(want)).unwrap_or(true))
            .map(|a| relay_protocol::AgentStatus {
                name: a.name.clone(),
                online: self.registry.is_online(&a.name),
                cli: a.cli.clone(),
                processing: self.processing.contains(&a.name),
                joined_channels: a.joined_channels.iter().cloned().collect(),
                last_seen_ms: a.last_seen_ms,
            })
            .collect()
    }
}

fn is_dm_channel(to: &str) -> bool {
    to.starts_with("dm:") && to.matches(':').count() == 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::membership::InMemoryMembershipStore;
    use crate::cloud_sync::NoopCloudSync;
    use relay_protocol::{EntityType, SendKind};
    use tokio::sync::mpsc::unbounded_channel;

    fn hello(agent: &str) -> HelloPayload {
        HelloPayload {
            agent: agent.to_string(),
            entity_type: EntityType::Agent,
            cli: None,
            capabilities: Default::default(),
            session: None,
            is_system_component: false,
        }
    }

    fn test_router() -> RouterHandle {
        let (handle, _join) = Router::spawn(
            DaemonConfig::default(),
            Arc::new(InMemoryStorage::default()),
            Arc::new(InMemoryMembershipStore::default()),
            Arc::new(NoopCloudSync),
        );
        handle
    }

    async fn connect(router: &RouterHandle, agent: &str) -> (String, mpsc::UnboundedReceiver<Envelope>) {
        let conn_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = unbounded_channel();
        router.register_connection(conn_id.clone(), tx);
        router.hello(conn_id.clone(), hello(agent)).await.unwrap();
        (conn_id, rx)
    }

    #[tokio::test]
    async fn ping_pong_delivers_and_acks() {
        let router = test_router();
        let (_alice_conn, _alice_rx) = connect(&router, "Alice").await;
        let (_bob_conn, mut bob_rx) = connect(&router, "Bob").await;

        let send = Envelope::new(EnvelopeType::Send, SendPayload::message("hi"))
            .with_from("Alice")
            .with_to("Bob");
        router.route("alice-sender-conn".into(), send);

        let deliver = bob_rx.recv().await.expect("bob should receive a DELIVER");
        assert_eq!(deliver.typ, EnvelopeType::Deliver);
        let payload: SendPayload = deliver.payload_as().unwrap();
        assert_eq!(payload.body, "hi");
        assert_eq!(payload.kind, SendKind::Message);
    }

    #[tokio::test]
    async fn broadcast_excludes_sender() {
        let router = test_router();
        let (alice_conn, mut alice_rx) = connect(&router, "Alice").await;
        let (_, mut bob_rx) = connect(&router, "Bob").await;
        let (_, mut carol_rx) = connect(&router, "Carol").await;

        let send = Envelope::new(EnvelopeType::Send, SendPayload::message("hello"))
            .with_from("Alice")
            .with_to("*");
        router.route(alice_conn, send);

        let bob_deliver = bob_rx.recv().await.unwrap();
        let carol_deliver = carol_rx.recv().await.unwrap();
        assert_eq!(bob_deliver.delivery.unwrap().original_to, "*");
        assert_eq!(carol_deliver.delivery.unwrap().original_to, "*");
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn channel_fan_out_never_echoes_sender() {
        let router = test_router();
        let (alice_conn, mut alice_rx) = connect(&router, "Alice").await;
        let (_, mut bob_rx) = connect(&router, "Bob").await;
        let (_, mut carol_rx) = connect(&router, "Carol").await;

        for agent in ["Alice", "Bob", "Carol"] {
            router.channel_join(agent.to_string(), "#room".to_string());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let msg = Envelope::new(EnvelopeType::ChannelMessage, SendPayload::message("yo"))
            .with_from("Alice")
            .with_topic("#room");
        router.channel_message(alice_conn, msg);

        assert!(bob_rx.recv().await.is_some());
        assert!(carol_rx.recv().await.is_some());
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shadow_receives_copy_with_original_to_preserved() {
        let router = test_router();
        let (_, mut primary_rx) = connect(&router, "Primary").await;
        let (_, mut shadow_rx) = connect(&router, "Shadow").await;

        router.bind_shadow(
            "Shadow".into(),
            ShadowBindPayload {
                primary: "Primary".into(),
                speak_on: vec![relay_protocol::ShadowSpeakOn::AllMessages],
                receive_incoming: true,
                receive_outgoing: false,
            },
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        let send = Envelope::new(EnvelopeType::Send, SendPayload::message("x"))
            .with_from("X")
            .with_to("Primary");
        router.route("x-conn".into(), send);

        let primary_deliver = primary_rx.recv().await.unwrap();
        let shadow_deliver = shadow_rx.recv().await.unwrap();
        assert_eq!(primary_deliver.delivery.unwrap().original_to, "Primary");
        assert_eq!(shadow_deliver.delivery.unwrap().original_to, "Primary");

        router.unbind_shadow("Shadow".into(), "Primary".into());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let send2 = Envelope::new(EnvelopeType::Send, SendPayload::message("y"))
            .with_from("X")
            .with_to("Primary");
        router.route("x-conn".into(), send2);
        assert!(primary_rx.recv().await.is_some());
        assert!(shadow_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn self_addressed_without_echo_flag_is_rejected() {
        let router = test_router();
        let conn_id = uuid::Uuid::new_v4().to_string();
        let (tx, mut rx) = unbounded_channel();
        router.register_connection(conn_id.clone(), tx);
        router.hello(conn_id.clone(), hello("Alice")).await.unwrap();

        let send = Envelope::new(EnvelopeType::Send, SendPayload::message("hi"))
            .with_from("Alice")
            .with_to("Alice");
        router.route(conn_id, send);

        let error = rx.recv().await.unwrap();
        assert_eq!(error.typ, EnvelopeType::Error);
    }
}
