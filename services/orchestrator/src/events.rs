//! Orchestrator-observable events (spec §4.8 "emits `summary` / `session-end`
//! events", "emit `exit(code)`", `onInjectionFailed`).

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// `[[SUMMARY]]...[[/SUMMARY]]` JSON block observed in stdout, emitted
    /// once per distinct raw content.
    Summary { raw_json: String },
    /// `[[SESSION_END]]...[[/SESSION_END]]` observed, once per session.
    SessionEnd { raw: String },
    /// The wrapped child process exited.
    Exit { code: Option<i32> },
    /// An injection request never delivered (spec §4.8: `inject_result` was
    /// not `delivered`, or the verifier never saw the text echoed back).
    InjectionFailed { message_id: String, error: String },
    /// The wrapped CLI emitted a spawn command and no dashboard HTTP port is
    /// configured; an external spawner is expected to act on this (spec
    /// §4.8 "Spawn/release delegation").
    SpawnCommand { name: String, cli: String, task: String },
    ReleaseCommand { name: String },
}
