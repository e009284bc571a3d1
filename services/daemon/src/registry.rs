//! Agent registry (spec §4.3).
//!
//! An in-memory, case-insensitive name → agent record map. Snapshot files
//! are the responsibility of `files.rs`; this module only owns the live
//! state and the freshness/online rules.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reserved agent names that require `_isSystemComponent` (spec §4.2).
const RESERVED_NAMES: &[&str] = &["dashboard", "cli", "system"];

pub fn is_reserved_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    RESERVED_NAMES.contains(&lower.as_str()) || name.starts_with('_') || name.starts_with("__")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Agent,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    pub entity_type: EntityType,
    pub cli: Option<String>,
    pub role: Option<String>,
    pub task: Option<String>,
    pub working_directory: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub last_seen_ms: u64,
    pub online: bool,
    pub joined_channels: HashSet<String>,
    /// Connection currently bound to this name, if any.
    pub connection_id: Option<String>,
    pub session_id: Option<String>,
}

impl AgentRecord {
    pub fn new(name: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            name: name.into(),
            entity_type,
            cli: None,
            role: None,
            task: None,
            working_directory: None,
            display_name: None,
            avatar_url: None,
            last_seen_ms: now_ms(),
            online: true,
            joined_channels: HashSet::new(),
            connection_id: None,
            session_id: None,
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Freshness window for "online" (spec §4.3: 30s).
pub const FRESH_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentRecord>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str) -> String {
        name.to_ascii_lowercase()
    }

    /// Register a name as connected; fails with `false` if the name is
    /// already bound to a different live connection (DUPLICATE_CONNECTION).
    pub fn register(
        &mut self,
        name: &str,
        entity_type: EntityType,
        connection_id: &str,
        session_id: &str,
    ) -> bool {
        let key = Self::key(name);
        if let Some(existing) = self.agents.get(&key) {
            if existing.online && existing.connection_id.as_deref() != Some(connection_id) {
                return false;
            }
        }
        let record = self.agents.entry(key).or_insert_with(|| AgentRecord::new(name, entity_type));
        record.online = true;
        record.connection_id = Some(connection_id.to_string());
        record.session_id = Some(session_id.to_string());
        record.last_seen_ms = now_ms();
        true
    }

    pub fn touch(&mut self, name: &str) {
        if let Some(record) = self.agents.get_mut(&Self::key(name)) {
            record.last_seen_ms = now_ms();
        }
    }

    pub fn mark_offline(&mut self, name: &str) {
        if let Some(record) = self.agents.get_mut(&Self::key(name)) {
            record.online = false;
            record.connection_id = None;
        }
    }

    pub fn get(&self, name: &str) -> Option<&AgentRecord> {
        self.agents.get(&Self::key(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut AgentRecord> {
        self.agents.get_mut(&Self::key(name))
    }

    pub fn is_online(&self, name: &str) -> bool {
        self.agents
            .get(&Self::key(name))
            .map(|a| a.online && now_ms().saturating_sub(a.last_seen_ms) < FRESH_WINDOW.as_millis() as u64)
            .unwrap_or(false)
    }

    pub fn connection_id_for(&self, name: &str) -> Option<String> {
        self.agents.get(&Self::key(name)).and_then(|a| a.connection_id.clone())
    }

    pub fn connected_names(&self) -> Vec<String> {
        self.agents
            .values()
            .filter(|a| a.online)
            .map(|a| a.name.clone())
            .collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &AgentRecord> {
        self.agents.values()
    }

    pub fn join_channel(&mut self, name: &str, channel: &str) {
        if let Some(record) = self.agents.get_mut(&Self::key(name)) {
            record.joined_channels.insert(channel.to_string());
        }
    }

    pub fn leave_channel(&mut self, name: &str, channel: &str) {
        if let Some(record) = self.agents.get_mut(&Self::key(name)) {
            record.joined_channels.remove(channel);
        }
    }

    /// Local channel members currently connected (spec §3 "Channel"; local
    /// half of the membership union — the other half comes from the
    /// external membership store).
    pub fn local_channel_members(&self, channel: &str) -> Vec<String> {
        self.agents
            .values()
            .filter(|a| a.online && a.joined_channels.contains(channel))
            .map(|a| a.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names_require_system_flag_elsewhere() {
        assert!(is_reserved_name("Dashboard"));
        assert!(is_reserved_name("_hidden"));
        assert!(is_reserved_name("cli"));
        assert!(!is_reserved_name("Alice"));
    }

    #[test]
    fn duplicate_connection_rejected() {
        let mut reg = AgentRegistry::new();
        assert!(reg.register("Alice", EntityType::Agent, "conn-1", "sess-1"));
        assert!(!reg.register("Alice", EntityType::Agent, "conn-2", "sess-2"));
    }

    #[test]
    fn reconnect_with_same_connection_id_is_allowed() {
        let mut reg = AgentRegistry::new();
        assert!(reg.register("Alice", EntityType::Agent, "conn-1", "sess-1"));
        assert!(reg.register("Alice", EntityType::Agent, "conn-1", "sess-1"));
    }

    #[test]
    fn name_lookup_is_case_insensitive() {
        let mut reg = AgentRegistry::new();
        reg.register("Alice", EntityType::Agent, "conn-1", "sess-1");
        assert!(reg.get("alice").is_some());
        assert!(reg.is_online("ALICE"));
    }

    #[test]
    fn offline_after_disconnect() {
        let mut reg = AgentRegistry::new();
        reg.register("Alice", EntityType::Agent, "conn-1", "sess-1");
        reg.mark_offline("Alice");
        assert!(!reg.is_online("Alice"));
        // reconnecting under a fresh connection id now succeeds
        assert!(reg.register("Alice", EntityType::Agent, "conn-2", "sess-1"));
    }

    #[test]
    fn channel_membership_union_is_local_only_here() {
        let mut reg = AgentRegistry::new();
        reg.register("Alice", EntityType::Agent, "conn-1", "sess-1");
        reg.register("Bob", EntityType::Agent, "conn-2", "sess-2");
        reg.join_channel("Alice", "#general");
        reg.join_channel("Bob", "#general");
        let mut members = reg.local_channel_members("#general");
        members.sort();
        assert_eq!(members, vec!["Alice".to_string(), "Bob".to_string()]);
    }
}
