//! Idle detector (spec §4.10) — fuses output-silence, prompt-cue, and
//! control-socket signals into a confidence score the orchestrator gates
//! injection on.
//!
//! Shaped like the teacher's own signal-fusion code for TUI input readiness
//! (`sven-tui`'s redraw/idle throttling predates this, but the "rising
//! weight over an elapsed window" shape is the same one used there for
//! debounced redraws): a handful of named signals, each independently
//! scored, combined by taking the max rather than a sum so no single signal
//! can be diluted by the others' absence.

use std::time::{Duration, Instant};

use regex::RegexSet;

/// Weight rises from 0 to 1 as time-since-last-output grows from this...
const SILENCE_RISE_START: Duration = Duration::from_millis(200);
/// ...to this.
const SILENCE_RISE_END: Duration = Duration::from_millis(2000);
/// A prompt-cue match only counts if seen within this long of "now".
const PROMPT_CUE_WINDOW: Duration = Duration::from_millis(200);
/// Dwell time false→true must hold before `is_idle` flips (anti-flap).
const DWELL: Duration = Duration::from_millis(50);
/// Confidence at/above which the orchestrator treats the detector as idle.
pub const IDLE_CONFIDENCE_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    OutputSilence,
    PromptCue,
    ControlSocket,
}

#[derive(Debug, Clone)]
pub struct IdleStatus {
    pub is_idle: bool,
    pub confidence: f64,
    pub signals: Vec<Signal>,
}

/// Default prompt-cue patterns recognized across common CLIs: a shell-style
/// `$ `/`> `/`# ` prompt at end of output, or a lone `>` continuation used by
/// several AI-CLI REPLs.
fn default_prompt_patterns() -> Vec<String> {
    vec![
        r"[$#%>]\s*$".to_string(),
        r"^\s*>\s*$".to_string(),
    ]
}

pub struct IdleDetector {
    last_output_at: Instant,
    last_prompt_cue_at: Option<Instant>,
    control_socket_idle: bool,
    idle_since: Option<Instant>,
    was_idle: bool,
    prompt_patterns: RegexSet,
}

impl IdleDetector {
    pub fn new() -> Self {
        Self::with_patterns(default_prompt_patterns())
    }

    pub fn with_patterns(patterns: Vec<String>) -> Self {
        let prompt_patterns = RegexSet::new(&patterns).unwrap_or_else(|_| RegexSet::new(default_prompt_patterns()).unwrap());
        Self {
            last_output_at: Instant::now(),
            last_prompt_cue_at: None,
            control_socket_idle: false,
            idle_since: None,
            was_idle: false,
            prompt_patterns,
        }
    }

    /// Record a chunk of freshly observed stdout; scans its tail line for a
    /// prompt cue and resets the silence clock.
    pub fn note_output(&mut self, chunk: &str) {
        self.last_output_at = Instant::now();
        let tail = chunk.lines().last().unwrap_or(chunk);
        if self.prompt_patterns.is_match(tail) {
            self.last_prompt_cue_at = Some(Instant::now());
        }
    }

    /// The native control channel (when present) explicitly reports the
    /// wrapped CLI as idle or not.
    pub fn set_control_socket_idle(&mut self, idle: bool) {
        self.control_socket_idle = idle;
    }

    pub fn check_idle(&mut self) -> IdleStatus {
        let now = Instant::now();
        let mut signals = Vec::new();
        let mut confidence = 0.0f64;

        let silence = now.duration_since(self.last_output_at);
        let silence_weight = if silence >= SILENCE_RISE_END {
            1.0
        } else if silence <= SILENCE_RISE_START {
            0.0
        } else {
            let span = (SILENCE_RISE_END - SILENCE_RISE_START).as_secs_f64();
            (silence - SILENCE_RISE_START).as_secs_f64() / span
        };
        if silence_weight > 0.0 {
            signals.push(Signal::OutputSilence);
            confidence = confidence.max(silence_weight);
        }

        if let Some(at) = self.last_prompt_cue_at {
            if now.duration_since(at) <= PROMPT_CUE_WINDOW {
                signals.push(Signal::PromptCue);
                confidence = confidence.max(1.0);
            }
        }

        if self.control_socket_idle {
            signals.push(Signal::ControlSocket);
            confidence = confidence.max(1.0);
        }

        let above_threshold = confidence >= IDLE_CONFIDENCE_THRESHOLD;
        let is_idle = if above_threshold {
            let since = *self.idle_since.get_or_insert(now);
            now.duration_since(since) >= DWELL
        } else {
            self.idle_since = None;
            false
        };
        self.was_idle = is_idle;

        IdleStatus { is_idle, confidence, signals }
    }
}

impl Default for IdleDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_output_is_not_idle() {
        let mut d = IdleDetector::new();
        d.note_output("building...\n");
        let status = d.check_idle();
        assert!(!status.is_idle);
    }

    #[test]
    fn prompt_cue_drives_confidence_to_one_immediately() {
        let mut d = IdleDetector::new();
        d.note_output("done\n$ ");
        let status = d.check_idle();
        assert!(status.confidence >= IDLE_CONFIDENCE_THRESHOLD);
        assert!(status.signals.contains(&Signal::PromptCue));
    }

    #[test]
    fn control_socket_signal_forces_idle_confidence() {
        let mut d = IdleDetector::new();
        d.note_output("still computing\n");
        d.set_control_socket_idle(true);
        let status = d.check_idle();
        assert!(status.confidence >= IDLE_CONFIDENCE_THRESHOLD);
        assert!(status.signals.contains(&Signal::ControlSocket));
    }

    #[test]
    fn dwell_time_prevents_instant_flap_to_idle() {
        let mut d = IdleDetector::new();
        d.note_output("x\n$ ");
        let first = d.check_idle();
        // Prompt cue gives full confidence right away, but dwell requires the
        // condition to *hold* for DWELL before flipping to idle=true.
        assert!(first.confidence >= IDLE_CONFIDENCE_THRESHOLD);
        std::thread::sleep(Duration::from_millis(60));
        let second = d.check_idle();
        assert!(second.is_idle);
    }
}
