//! Periodic state-file writers (spec §4.3, §4.6, §6).
//!
//! Every snapshot is written atomically: serialize to a temp file in the
//! same directory, then `rename` over the final path. A reader can never
//! observe a torn write, since `rename` within one filesystem is atomic.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;

use crate::registry::AgentRegistry;

#[derive(Debug, Serialize)]
struct AgentsFile {
    agents: Vec<AgentFileEntry>,
}

#[derive(Debug, Serialize)]
struct AgentFileEntry {
    name: String,
    #[serde(rename = "entityType")]
    entity_type: &'static str,
    cli: Option<String>,
    role: Option<String>,
    task: Option<String>,
    #[serde(rename = "workingDirectory")]
    working_directory: Option<String>,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    #[serde(rename = "avatarUrl")]
    avatar_url: Option<String>,
    #[serde(rename = "lastSeen")]
    last_seen: u64,
    online: bool,
}

#[derive(Debug, Serialize)]
struct ConnectedAgentsFile {
    agents: Vec<String>,
    users: Vec<String>,
    #[serde(rename = "updatedAt")]
    updated_at: u64,
}

#[derive(Debug, Serialize)]
struct ProcessingStateFile {
    #[serde(rename = "processingAgents")]
    processing_agents: Vec<String>,
    #[serde(rename = "updatedAt")]
    updated_at: u64,
}

#[derive(Debug, Serialize)]
struct RemoteAgentsFile {
    agents: Vec<String>,
    #[serde(rename = "updatedAt")]
    updated_at: u64,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Write `value` to `path` via a same-directory temp file plus rename.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let body = serde_json::to_vec_pretty(value)?;
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::fs::write(tmp.path(), &body)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn write_or_warn<T: Serialize>(path: &Path, value: &T) {
    if let Err(e) = write_atomic(path, value) {
        warn!(path = %path.display(), error = %e, "failed to write state snapshot");
    }
}

/// `agents.json` — written on every registry mutation (spec §4.3).
pub fn write_agents_file(state_dir: &Path, registry: &AgentRegistry) {
    let agents = registry
        .all()
        .map(|a| AgentFileEntry {
            name: a.name.clone(),
            entity_type: match a.entity_type {
                crate::registry::EntityType::Agent => "agent",
                crate::registry::EntityType::User => "user",
            },
            cli: a.cli.clone(),
            role: a.role.clone(),
            task: a.task.clone(),
            working_directory: a.working_directory.clone(),
            display_name: a.display_name.clone(),
            avatar_url: a.avatar_url.clone(),
            last_seen: a.last_seen_ms,
            online: a.online,
        })
        .collect();
    write_or_warn(&agents_path(state_dir), &AgentsFile { agents });
}

/// `connected-agents.json` — written on every connect/disconnect (spec §4.3).
pub fn write_connected_agents_file(state_dir: &Path, registry: &AgentRegistry) {
    let mut agents = Vec::new();
    let mut users = Vec::new();
    for record in registry.all() {
        if !record.online {
            continue;
        }
        match record.entity_type {
            crate::registry::EntityType::Agent => agents.push(record.name.clone()),
            crate::registry::EntityType::User => users.push(record.name.clone()),
        }
    }
    write_or_warn(
        &connected_agents_path(state_dir),
        &ConnectedAgentsFile { agents, users, updated_at: now_ms() },
    );
}

/// `processing-state.json` — rewritten every 500ms with the processing set
/// (spec §4.3, §4.5).
pub fn write_processing_state_file(state_dir: &Path, processing: &std::collections::HashSet<String>) {
    let mut processing_agents: Vec<String> = processing.iter().cloned().collect();
    processing_agents.sort();
    write_or_warn(
        &processing_state_path(state_dir),
        &ProcessingStateFile { processing_agents, updated_at: now_ms() },
    );
}

/// `remote-agents.json` / `remote-users.json` — only written while cloud
/// sync is active (spec §6).
pub fn write_remote_agents_file(state_dir: &Path, agents: Vec<String>) {
    write_or_warn(
        &state_dir.join("remote-agents.json"),
        &RemoteAgentsFile { agents, updated_at: now_ms() },
    );
}

pub fn agents_path(state_dir: &Path) -> PathBuf {
    state_dir.join("agents.json")
}

pub fn connected_agents_path(state_dir: &Path) -> PathBuf {
    state_dir.join("connected-agents.json")
}

pub fn processing_state_path(state_dir: &Path) -> PathBuf {
    state_dir.join("processing-state.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EntityType;

    #[test]
    fn writes_are_readable_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = AgentRegistry::new();
        registry.register("Alice", EntityType::Agent, "conn-1", "sess-1");

        write_agents_file(dir.path(), &registry);
        write_connected_agents_file(dir.path(), &registry);

        let agents_raw = std::fs::read_to_string(agents_path(dir.path())).unwrap();
        assert!(agents_raw.contains("Alice"));

        let connected_raw = std::fs::read_to_string(connected_agents_path(dir.path())).unwrap();
        let parsed: ConnectedAgentsFileTest = serde_json::from_str(&connected_raw).unwrap();
        assert_eq!(parsed.agents, vec!["Alice".to_string()]);
    }

    #[derive(serde::Deserialize)]
    struct ConnectedAgentsFileTest {
        agents: Vec<String>,
    }

    #[test]
    fn processing_state_snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = std::collections::HashSet::new();
        set.insert("Bob".to_string());
        write_processing_state_file(dir.path(), &set);
        let raw = std::fs::read_to_string(processing_state_path(dir.path())).unwrap();
        assert!(raw.contains("Bob"));
    }
}
