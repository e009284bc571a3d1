//! Session lifecycle (spec §3 "Session").
//!
//! A session survives reconnects: the daemon hands out a `resume_token` in
//! WELCOME, and a client replaying that token for the same agent name gets
//! its old session id (and replayed pending deliveries) back.

use std::collections::HashMap;

use rand::RngCore;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub agent_name: String,
    pub resume_token: String,
    pub started_at_ms: u64,
    pub closed_by: Option<String>,
    pub cli: Option<String>,
    pub project_id: Option<String>,
}

impl Session {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_name: agent_name.into(),
            resume_token: generate_resume_token(),
            started_at_ms: now_ms(),
            closed_by: None,
            cli: None,
            project_id: None,
        }
    }
}

fn generate_resume_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// In-memory session store, keyed by both session id and resume token.
#[derive(Debug, Default)]
pub struct SessionStore {
    by_id: HashMap<String, Session>,
    by_token: HashMap<String, String>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, agent_name: impl Into<String>) -> Session {
        let session = Session::new(agent_name);
        self.by_token.insert(session.resume_token.clone(), session.id.clone());
        self.by_id.insert(session.id.clone(), session.clone());
        session
    }

    /// Resolve a resume token. Succeeds only if the stored session's agent
    /// name matches `claimed_agent` (spec §3: "resume succeeds iff stored
    /// session matches the claimed agent").
    pub fn resume(&self, token: &str, claimed_agent: &str) -> Option<Session> {
        let id = self.by_token.get(token)?;
        let session = self.by_id.get(id)?;
        if session.agent_name.eq_ignore_ascii_case(claimed_agent) {
            Some(session.clone())
        } else {
            None
        }
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.by_id.get(id)
    }

    pub fn close(&mut self, id: &str, closed_by: Option<String>) {
        if let Some(session) = self.by_id.get_mut(id) {
            session.closed_by = closed_by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_requires_matching_agent_name() {
        let mut store = SessionStore::new();
        let session = store.create("Alice");
        assert!(store.resume(&session.resume_token, "Alice").is_some());
        assert!(store.resume(&session.resume_token, "Bob").is_none());
    }

    #[test]
    fn unknown_token_does_not_resume() {
        let store = SessionStore::new();
        assert!(store.resume("nonsense", "Alice").is_none());
    }
}
