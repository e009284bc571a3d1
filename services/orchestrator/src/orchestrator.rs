//! The PTY orchestrator itself (spec §4.8): owns the wrapped child process,
//! feeds its output to the parser and idle detector, and injects inbound
//! relay messages back into its stdin at safe moments.
//!
//! Shaped as a single-task actor like `relay-client::client::Actor` and the
//! daemon's `Router`: one `tokio::select!` loop, no shared mutable state
//! reachable from outside it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use regex::Regex;
use relay_client::{ClientConfig, ClientEvent, RelayClient};
use relay_protocol::Importance;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::OrchestratorError;
use crate::events::OrchestratorEvent;
use crate::idle::IdleDetector;
use crate::parser::{OutputParser, ParsedCommand};
use crate::pty::PtyHandle;

/// How often the queue is re-checked against the idle detector while
/// messages are waiting (distinct from the 30s defensive stuck-queue poke
/// in spec §4.8, which this loop also implements via `STUCK_QUEUE_INTERVAL`).
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STUCK_QUEUE_INTERVAL: Duration = Duration::from_secs(30);
/// Spawn commands with identical (name, cli, task) within this window are
/// suppressed as duplicates (spec §4.8).
const SPAWN_DEDUPE_WINDOW: Duration = Duration::from_secs(10);
/// How much recently-observed stdout the injection verifier searches for the
/// echoed text (spec §4.8: "observing the exact injected text reappearing").
const VERIFY_WINDOW_BYTES: usize = 64 * 1024;

struct QueuedMessage {
    id: String,
    from: String,
    body: String,
    thread: Option<String>,
    channel: Option<String>,
    importance: Importance,
    retries: u32,
}

impl QueuedMessage {
    /// Format for injection, with the `[RETRY]`/`[URGENT - PLEASE
    /// ACKNOWLEDGE]` escalation applied for the 2nd/3rd+ attempt (spec
    /// §4.8 `buildInjectionString`, refined per SPEC_FULL §4.8 to match the
    /// original relay-pty's `format_for_injection`).
    fn build_injection_string(&self) -> String {
        let short_id: String = self.id.chars().take(7).collect();
        let mut line = format!("Relay message from {} [{}]", self.from, short_id);
        if let Some(thread) = &self.thread {
            line.push_str(&format!("[thread:{thread}]"));
        }
        if let Some(channel) = &self.channel {
            line.push_str(&format!("[{channel}]"));
        }
        match self.importance {
            Importance::Urgent => line.push_str("[!!]"),
            Importance::High => line.push_str("[!]"),
            Importance::Normal => {}
        }
        line.push_str(&format!(": {}", self.body));

        match self.retries {
            0 => line,
            1 => format!("[RETRY] {line}"),
            _ => format!("[URGENT - PLEASE ACKNOWLEDGE] {line}"),
        }
    }
}

struct PendingVerify {
    message_id: String,
    injected_text: String,
    deadline: Instant,
}

/// Scans accumulated stdout for `[[SUMMARY]]...[[/SUMMARY]]` and
/// `[[SESSION_END]]...[[/SESSION_END]]` markers (spec §4.8 "State
/// detection"), independent of the relay-command parser in `parser.rs`.
struct StateScanner {
    buffer: String,
    seen_summaries: std::collections::HashSet<String>,
    session_ended: bool,
    summary_re: Regex,
    session_end_re: Regex,
}

impl StateScanner {
    fn new() -> Self {
        Self {
            buffer: String::new(),
            seen_summaries: std::collections::HashSet::new(),
            session_ended: false,
            summary_re: Regex::new(r"(?s)\[\[SUMMARY\]\](.*?)\[\[/SUMMARY\]\]").unwrap(),
            session_end_re: Regex::new(r"(?s)\[\[SESSION_END\]\](.*?)\[\[/SESSION_END\]\]").unwrap(),
        }
    }

    fn feed(&mut self, chunk: &str) -> Vec<OrchestratorEvent> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();

        let snapshot = self.buffer.clone();
        for cap in self.summary_re.captures_iter(&snapshot) {
            let raw = cap.get(1).unwrap().as_str().trim().to_string();
            if self.seen_summaries.insert(raw.clone()) {
                out.push(OrchestratorEvent::Summary { raw_json: raw });
            }
        }
        if !self.session_ended {
            if let Some(cap) = self.session_end_re.captures(&snapshot) {
                self.session_ended = true;
                out.push(OrchestratorEvent::SessionEnd { raw: cap.get(1).unwrap().as_str().trim().to_string() });
            }
        }
        out
    }
}

pub struct Orchestrator {
    config: WorkerConfig,
}

impl Orchestrator {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    /// Run until the wrapped child exits or the relay client is destroyed.
    /// Emits observable events (summaries, session end, injection
    /// failures, spawn/release delegation requests) on `events_tx`.
    pub async fn run(self, events_tx: mpsc::UnboundedSender<OrchestratorEvent>) -> Result<(), OrchestratorError> {
        let agent = self.config.agent.clone();

        let mut client_config = ClientConfig::new(agent.clone(), self.config.daemon_socket.clone());
        client_config.cli = self.config.cli.clone();
        let client = RelayClient::connect(client_config).await?;
        // The orchestrator announces readiness once its own HELLO/WELCOME
        // completes (spec §4.7 `spawn`'s `waitForReady`/AGENT_READY note).
        let _ = client.announce_ready();

        let pty = PtyHandle::spawn(&self.config.command)?;
        info!(agent = %agent, command = ?self.config.command, "spawned wrapped CLI under pty");

        let mut idle = IdleDetector::new();
        let mut parser = OutputParser::with_prefix(self.config.relay_prefix.clone());
        let mut state_scanner = StateScanner::new();
        let mut recent_raw = String::new();

        let mut queue: VecDeque<QueuedMessage> = VecDeque::new();
        let mut backpressure = false;
        let mut verifying: Option<PendingVerify> = None;
        let mut recent_spawns: Vec<(String, String, String, Instant)> = Vec::new();

        let mut client_events = client.subscribe_events();
        let mut queue_poll = tokio::time::interval(QUEUE_POLL_INTERVAL);
        let mut stuck_monitor = tokio::time::interval(STUCK_QUEUE_INTERVAL);

        let mut pty = pty;
        loop {
            tokio::select! {
                chunk = pty.stdout_rx.recv() => {
                    match chunk {
                        Some(bytes) => {
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            idle.note_output(&text);

                            recent_raw.push_str(&text);
                            if recent_raw.len() > VERIFY_WINDOW_BYTES {
                                let cut = recent_raw.len() - VERIFY_WINDOW_BYTES;
                                let cut = recent_raw.char_indices().map(|(i, _)| i).take_while(|&i| i <= cut).last().unwrap_or(0);
                                recent_raw.drain(..cut);
                            }

                            if let Some(pending) = &verifying {
                                if recent_raw.contains(&pending.injected_text) {
                                    debug!(agent = %agent, id = %pending.message_id, "injection verified");
                                    queue.pop_front();
                                    verifying = None;
                                }
                            }

                            for event in state_scanner.feed(&text) {
                                let _ = events_tx.send(event);
                            }

                            for command in parser.feed(&text) {
                                self.handle_parsed_command(command, &client, &mut recent_spawns, &events_tx);
                            }
                        }
                        None => {
                            let code = pty.try_wait();
                            let _ = events_tx.send(OrchestratorEvent::Exit { code });
                            break;
                        }
                    }
                }
                event = client_events.recv() => {
                    match event {
                        Ok(ClientEvent::Message { from, payload, payload_meta, delivery }) => {
                            let effective_from = if from == "_DashboardUI" {
                                payload.data.as_ref()
                                    .and_then(|d| d.get("senderName"))
                                    .and_then(|v| v.as_str())
                                    .filter(|s| !s.is_empty())
                                    .map(str::to_string)
                                    .unwrap_or(from)
                            } else {
                                from
                            };
                            let channel = delivery.as_ref().map(|d| d.original_to.clone()).filter(|t| t.starts_with('#') || t.starts_with("dm:"));
                            let importance = payload_meta.as_ref().and_then(|m| m.importance).unwrap_or_default();
                            queue.push_back(QueuedMessage {
                                id: uuid::Uuid::new_v4().to_string(),
                                from: effective_from,
                                body: payload.body,
                                thread: payload.thread,
                                channel,
                                importance,
                                retries: 0,
                            });
                            if queue.len() > self.config.queue_max {
                                backpressure = true;
                                warn!(agent = %agent, queue_len = queue.len(), "injection queue over cap, engaging backpressure");
                            }
                        }
                        Ok(ClientEvent::StateChange(_)) | Ok(ClientEvent::Error { .. }) | Ok(ClientEvent::ChannelMessage { .. }) | Ok(ClientEvent::AgentReady { .. }) | Ok(ClientEvent::Log { .. }) => {}
                        Ok(other) => {
                            debug!(agent = %agent, ?other, "unhandled client event in orchestrator");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = queue_poll.tick() => {
                    if backpressure && queue.len() < self.config.queue_max / 2 {
                        backpressure = false;
                    }
                    if idle.check_idle().is_idle {
                        self.try_inject_next(&mut queue, &mut verifying, backpressure, &pty, &agent, &events_tx);
                    }
                    self.expire_verify_if_overdue(&mut queue, &mut verifying, &agent, &events_tx);
                }
                _ = stuck_monitor.tick() => {
                    // Defensive: if the queue is non-empty, idle, and not
                    // backpressured/mid-injection, nudge it (spec §4.8).
                    if !queue.is_empty() && verifying.is_none() && !backpressure {
                        let status = idle.check_idle();
                        if status.is_idle {
                            self.try_inject_next(&mut queue, &mut verifying, backpressure, &pty, &agent, &events_tx);
                        }
                    }
                }
            }
        }

        pty.kill();
        Ok(())
    }

    fn handle_parsed_command(
        &self,
        command: ParsedCommand,
        client: &RelayClient,
        recent_spawns: &mut Vec<(String, String, String, Instant)>,
        events_tx: &mpsc::UnboundedSender<OrchestratorEvent>,
    ) {
        match command {
            ParsedCommand::Message { to, thread: _, body, .. } => {
                // `thread` correlation isn't exposed by `send_message`'s
                // simple signature; parsed relay commands are fire-and-forget
                // sends, same as a plain SEND envelope.
                if let Err(e) = client.send_message(&to, &body) {
                    warn!(to = %to, error = %e, "failed to forward parsed relay message");
                }
            }
            ParsedCommand::Spawn { name, cli, task, .. } => {
                let now = Instant::now();
                recent_spawns.retain(|(_, _, _, at)| now.duration_since(*at) < SPAWN_DEDUPE_WINDOW);
                if recent_spawns.iter().any(|(n, c, t, _)| *n == name && *c == cli && *t == task) {
                    debug!(name = %name, "suppressing duplicate spawn command within dedupe window");
                    return;
                }
                recent_spawns.push((name.clone(), cli.clone(), task.clone(), now));

                if let Some(port) = self.config.dashboard_port {
                    let name2 = name.clone();
                    let cli2 = cli.clone();
                    let task2 = task.clone();
                    tokio::spawn(async move {
                        let body = serde_json::json!({"name": name2, "cli": cli2, "task": task2});
                        let url = format!("http://localhost:{port}/api/spawn");
                        if let Err(e) = reqwest::Client::new().post(&url).json(&body).send().await {
                            warn!(url = %url, error = %e, "spawn delegation POST failed");
                        }
                    });
                } else {
                    let _ = events_tx.send(OrchestratorEvent::SpawnCommand { name, cli, task });
                }
            }
            ParsedCommand::Release { name, .. } => {
                let _ = events_tx.send(OrchestratorEvent::ReleaseCommand { name });
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn try_inject_next(
        &self,
        queue: &mut VecDeque<QueuedMessage>,
        verifying: &mut Option<PendingVerify>,
        backpressure: bool,
        pty: &PtyHandle,
        agent: &str,
        events_tx: &mpsc::UnboundedSender<OrchestratorEvent>,
    ) {
        if backpressure || verifying.is_some() || queue.is_empty() {
            return;
        }
        let Some(msg) = queue.front() else { return };
        let text = msg.build_injection_string();

        // Idle gating is approximated by the caller's polling cadence: this
        // method is only reached from a tick that already confirmed idle, or
        // from the defensive stuck-queue nudge which checks idle itself.
        let mut line = text.clone();
        line.push('\r');
        if let Err(e) = pty.write_stdin(line.into_bytes()) {
            warn!(agent, error = %e, "failed to write injection to pty stdin");
            return;
        }

        debug!(agent, id = %msg.id, "issued injection");
        *verifying = Some(PendingVerify {
            message_id: msg.id.clone(),
            injected_text: text,
            deadline: Instant::now() + self.config.injection_verify_timeout,
        });
        let _ = events_tx;
    }

    fn expire_verify_if_overdue(
        &self,
        queue: &mut VecDeque<QueuedMessage>,
        verifying: &mut Option<PendingVerify>,
        agent: &str,
        events_tx: &mpsc::UnboundedSender<OrchestratorEvent>,
    ) {
        let Some(pending) = verifying.as_ref() else { return };
        if Instant::now() < pending.deadline {
            return;
        }
        let message_id = pending.message_id.clone();
        *verifying = None;

        let Some(front) = queue.front_mut() else { return };
        if front.id != message_id {
            return;
        }
        if front.retries + 1 >= self.config.max_injection_retries {
            warn!(agent, id = %message_id, "injection failed after max retries");
            let _ = events_tx.send(OrchestratorEvent::InjectionFailed { message_id, error: "max retries exceeded".into() });
            queue.pop_front();
        } else {
            front.retries += 1;
            debug!(agent, id = %message_id, retries = front.retries, "injection not verified, will retry");
        }
    }
}
