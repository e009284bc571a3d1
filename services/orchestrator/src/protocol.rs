//! Control-socket protocol between the orchestrator and the wrapped child
//! (spec §4.8, §6 "Control-socket protocol to the native pty binary").
//!
//! Grounded directly on the retrieved original relay-pty protocol module
//! (`other_examples/f5dbe03a_harveyfullstack-relay__relay-pty-src-protocol.rs.rs`):
//! same request/response shapes and field names, renamed to this crate's
//! naming conventions. SPEC_FULL §4.8 notes that no native pty-spawning
//! binary survived retrieval, so here the orchestrator plays both ends: it
//! owns the pseudo-terminal directly (`pty.rs`, via `portable-pty`, a crate
//! already in the teacher's own dependency stack) and drives this protocol
//! in-process against its own injection actor, rather than across a real
//! Unix socket to a separate process. See DESIGN.md for the record of that
//! decision.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InjectRequest {
    Inject {
        id: String,
        from: String,
        body: String,
        #[serde(default)]
        priority: i32,
    },
    Status,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InjectResponse {
    InjectResult {
        id: String,
        status: InjectStatus,
        timestamp: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Status {
        agent_idle: bool,
        queue_length: usize,
        cursor_position: Option<[u16; 2]>,
        last_output_ms: u64,
    },
    Backpressure {
        queue_length: usize,
        accept: bool,
    },
    ShutdownAck,
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectStatus {
    Queued,
    Injecting,
    Delivered,
    Failed,
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_request_serializes_with_snake_case_tag() {
        let req = InjectRequest::Inject { id: "msg-1".into(), from: "Alice".into(), body: "hi".into(), priority: 0 };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"inject\""));
    }

    #[test]
    fn inject_request_defaults_priority_to_zero() {
        let json = r#"{"type":"inject","id":"msg-1","from":"Alice","body":"hi"}"#;
        let req: InjectRequest = serde_json::from_str(json).unwrap();
        assert!(matches!(req, InjectRequest::Inject { priority: 0, .. }));
    }
}
