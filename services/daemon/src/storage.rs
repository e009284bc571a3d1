//! Storage adapter interface (spec §6 "Storage adapter interface").
//!
//! Message persistence is advisory: every method may fail, and the core
//! treats failures as non-fatal, logged events (spec §7 "External hook
//! failure"). This mirrors the teacher's pattern of keeping external
//! collaborators behind a trait so the core never depends on a concrete
//! backend (`sven-node`'s `ControlService` takes an `Agent`, not a database).

use async_trait::async_trait;
use relay_protocol::Envelope;

use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Delivered,
    Pending,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub agent: Option<String>,
    pub since_ms: Option<u64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct MaxSeq {
    pub topic: String,
    pub peer: String,
    pub max_seq: u64,
}

/// Pluggable, best-effort persistence backend.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn save_message(&self, envelope: &Envelope) -> anyhow::Result<()>;

    async fn get_messages(&self, filter: MessageFilter) -> anyhow::Result<Vec<Envelope>>;

    async fn update_message_status(&self, id: &str, status: MessageStatus) -> anyhow::Result<()>;

    async fn get_session_by_resume_token(&self, _token: &str) -> anyhow::Result<Option<Session>> {
        Ok(None)
    }

    async fn get_max_seq_by_stream(&self, _agent: &str, _session: &str) -> anyhow::Result<Vec<MaxSeq>> {
        Ok(Vec::new())
    }

    async fn start_session(&self, _session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    async fn end_session(&self, _id: &str, _closed_by: Option<String>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Default no-op adapter: the daemon runs perfectly well with no durable
/// history (spec §1 Non-goals: "persistence of full message history" is
/// explicitly delegated, not required).
#[derive(Debug, Default)]
pub struct NullStorage;

#[async_trait]
impl StorageAdapter for NullStorage {
    async fn save_message(&self, _envelope: &Envelope) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_messages(&self, _filter: MessageFilter) -> anyhow::Result<Vec<Envelope>> {
        Ok(Vec::new())
    }

    async fn update_message_status(&self, _id: &str, _status: MessageStatus) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-memory adapter used by tests and as a reference implementation:
/// append-only, bounded by nothing but process memory.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    messages: tokio::sync::Mutex<Vec<(Envelope, MessageStatus)>>,
}

#[async_trait]
impl StorageAdapter for InMemoryStorage {
    async fn save_message(&self, envelope: &Envelope) -> anyhow::Result<()> {
        self.messages.lock().await.push((envelope.clone(), MessageStatus::Pending));
        Ok(())
    }

    async fn get_messages(&self, filter: MessageFilter) -> anyhow::Result<Vec<Envelope>> {
        let messages = self.messages.lock().await;
        let mut out: Vec<Envelope> = messages
            .iter()
            .filter(|(env, _)| match &filter.agent {
                Some(agent) => env.to.as_deref() == Some(agent.as_str()),
                None => true,
            })
            .filter(|(env, _)| match filter.since_ms {
                Some(since) => env.ts >= since,
                None => true,
            })
            .map(|(env, _)| env.clone())
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn update_message_status(&self, id: &str, status: MessageStatus) -> anyhow::Result<()> {
        let mut messages = self.messages.lock().await;
        if let Some(entry) = messages.iter_mut().find(|(env, _)| env.id == id) {
            entry.1 = status;
        }
        Ok(())
    }
}
