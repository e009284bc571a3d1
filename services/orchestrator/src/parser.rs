//! Output parser (spec §4.9) — scans a wrapped CLI's stdout for embedded
//! relay commands in three shapes (inline, fenced, JSON block) and yields
//! them in textual order, exactly once each, as the buffer grows.
//!
//! Grounded on the retrieved original relay-pty's `ParsedRelayCommand`
//! shape (`other_examples/f5dbe03a_harveyfullstack-relay__relay-pty-src-protocol.rs.rs`),
//! generalized into three typed command variants instead of one struct with
//! many optional fields, in the style of the teacher's own typed-variant
//! wire payloads (`relay-protocol::envelope`).

use std::collections::HashSet;

use regex::Regex;

/// Default command prefix recognized at the start of a line (spec §4.9).
pub const DEFAULT_PREFIX: &str = "->relay:";
/// Fenced message bodies longer than this are discarded with a warning.
pub const MAX_FENCE_BYTES: usize = 1024 * 1024;
/// How far back from the last scan point we re-include, to catch a fence
/// whose opening line arrived in a prior chunk.
const LOOKBACK_BYTES: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    Message {
        to: String,
        thread: Option<String>,
        body: String,
        raw: String,
    },
    Spawn {
        name: String,
        cli: String,
        task: String,
        raw: String,
    },
    Release {
        name: String,
        raw: String,
    },
}

pub struct OutputParser {
    prefix: String,
    buffer: String,
    /// Start byte offsets of commands already emitted, or of fenced bodies
    /// already discarded for exceeding the size cap — either way, never
    /// revisited.
    handled: HashSet<usize>,
    ansi_re: Regex,
    code_fence_re: Regex,
    json_block_re: Regex,
    fenced_cmd_re: Regex,
    fence_open_re: Regex,
    inline_re: Regex,
}

impl OutputParser {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let escaped = regex::escape(&prefix);
        Self {
            ansi_re: Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap(),
            code_fence_re: Regex::new(r"(?s)```.*?```").unwrap(),
            json_block_re: Regex::new(r"(?s)\[\[RELAY\]\]\s*(\{.*?\})\s*\[\[/RELAY\]\]").unwrap(),
            fenced_cmd_re: Regex::new(&format!(
                r"(?ms)^(\\?){escaped}(\S+)(?:\s+\[thread:([^\]]+)\])?\s+<<<(.*?)>>>"
            ))
            .unwrap(),
            fence_open_re: Regex::new(&format!(r"(?m)^\\?{escaped}\S+(?:\s+\[thread:[^\]]+\])?\s+<<<")).unwrap(),
            inline_re: Regex::new(&format!(
                r"(?m)^(\\?){escaped}(\S+)(?:\s+\[thread:([^\]]+)\])?\s+(.*)$"
            ))
            .unwrap(),
            prefix,
            buffer: String::new(),
            handled: HashSet::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Feed a freshly observed stdout chunk (already expected to be whatever
    /// the child wrote — ANSI is stripped here). Returns newly completed
    /// commands, in the order they appear in the stream. Idempotent: the
    /// same textual command is never returned twice.
    pub fn feed(&mut self, chunk: &str) -> Vec<ParsedCommand> {
        let stripped = self.ansi_re.replace_all(chunk, "");
        self.buffer.push_str(&stripped);

        let masked_fences = mask_spans(&self.buffer, self.code_fence_re.find_iter(&self.buffer).map(|m| (m.start(), m.end())));

        let mut found: Vec<(usize, ParsedCommand)> = Vec::new();
        let mut consumed_spans: Vec<(usize, usize)> = Vec::new();

        for cap in self.json_block_re.captures_iter(&masked_fences) {
            let whole = cap.get(0).unwrap();
            consumed_spans.push((whole.start(), whole.end()));
            if self.handled.contains(&whole.start()) {
                continue;
            }
            self.handled.insert(whole.start());
            if let Some(cmd) = parse_json_block(cap.get(1).unwrap().as_str(), whole.as_str()) {
                found.push((whole.start(), cmd));
            }
        }

        let masked_json = mask_spans(&masked_fences, consumed_spans.iter().copied());

        for cap in self.fenced_cmd_re.captures_iter(&masked_json) {
            let whole = cap.get(0).unwrap();
            consumed_spans.push((whole.start(), whole.end()));
            if self.handled.contains(&whole.start()) {
                continue;
            }
            self.handled.insert(whole.start());

            let escaped = !cap.get(1).unwrap().as_str().is_empty();
            if escaped {
                continue;
            }
            let target = cap.get(2).unwrap().as_str();
            let thread = cap.get(3).map(|m| m.as_str().to_string());
            let body = cap.get(4).unwrap().as_str();
            if body.len() > MAX_FENCE_BYTES {
                tracing::warn!(bytes = body.len(), "discarding oversized fenced relay command");
                continue;
            }
            let raw = whole.as_str().to_string();
            found.push((whole.start(), command_for_target(target, thread, body.trim(), raw)));
        }

        // An opening `<<<` with no closing `>>>` yet anywhere in the buffer
        // is not a complete fenced command, but its opener line (e.g.
        // `->relay:Bob <<<`) would otherwise also satisfy the inline-command
        // regex below, with the body captured as just `<<<`. Mask every such
        // opener's line out of the inline pass, without marking it
        // `handled`, since the real fence still needs to match once its
        // `>>>` arrives in a later chunk (spec §4.9 cross-chunk fence
        // handling).
        let mut unclosed_opener_lines: Vec<(usize, usize)> = Vec::new();
        for m in self.fence_open_re.find_iter(&masked_json) {
            if self.handled.contains(&m.start()) || masked_json[m.end()..].contains(">>>") {
                continue;
            }
            let line_end = masked_json[m.start()..]
                .find('\n')
                .map(|i| m.start() + i)
                .unwrap_or(masked_json.len());
            unclosed_opener_lines.push((m.start(), line_end));

            // If the unclosed tail has already grown past the cap, give up
            // on it now rather than buffering forever (spec §4.9 "longer
            // fences are discarded with a warning").
            let remaining = masked_json.len() - m.end();
            if remaining > MAX_FENCE_BYTES {
                tracing::warn!("discarding fenced relay command that exceeded the size cap before closing");
                self.handled.insert(m.start());
            }
        }

        let masked_fenced_cmds = mask_spans(
            &masked_json,
            consumed_spans.iter().copied().chain(unclosed_opener_lines.iter().copied()),
        );

        for cap in self.inline_re.captures_iter(&masked_fenced_cmds) {
            let whole = cap.get(0).unwrap();
            if self.handled.contains(&whole.start()) {
                continue;
            }
            self.handled.insert(whole.start());

            let escaped = !cap.get(1).unwrap().as_str().is_empty();
            if escaped {
                continue;
            }
            let target = cap.get(2).unwrap().as_str();
            let thread = cap.get(3).map(|m| m.as_str().to_string());
            let body = cap.get(4).unwrap().as_str();
            let raw = whole.as_str().to_string();
            found.push((whole.start(), command_for_target(target, thread, body.trim(), raw)));
        }

        found.sort_by_key(|(offset, _)| *offset);

        // Trim the front of the buffer once it's grown well past anything a
        // future fence could still need to look back across, so a
        // long-running wrapped CLI doesn't grow this buffer unboundedly.
        if self.buffer.len() > 4 * MAX_FENCE_BYTES {
            let cut = self.buffer.len() - LOOKBACK_BYTES;
            let cut = self.buffer.char_indices().map(|(i, _)| i).take_while(|&i| i <= cut).last().unwrap_or(0);
            self.buffer.drain(..cut);
            self.handled.retain(|&offset| offset >= cut);
            self.handled = self.handled.iter().map(|&offset| offset - cut).collect();
        }

        found.into_iter().map(|(_, cmd)| cmd).collect()
    }
}

impl Default for OutputParser {
    fn default() -> Self {
        Self::new()
    }
}

fn command_for_target(target: &str, thread: Option<String>, body: &str, raw: String) -> ParsedCommand {
    match target {
        "spawn" => {
            let mut parts = body.splitn(3, char::is_whitespace);
            let name = parts.next().unwrap_or_default().to_string();
            let cli = parts.next().unwrap_or_default().to_string();
            let task = parts.next().unwrap_or_default().to_string();
            ParsedCommand::Spawn { name, cli, task, raw }
        }
        "release" => ParsedCommand::Release { name: body.trim().to_string(), raw },
        target => ParsedCommand::Message { to: target.to_string(), thread, body: body.to_string(), raw },
    }
}

fn parse_json_block(json: &str, raw: &str) -> Option<ParsedCommand> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    let to = value.get("to")?.as_str()?.to_string();
    let thread = value.get("thread").and_then(|v| v.as_str()).map(str::to_string);

    match to.as_str() {
        "spawn" => {
            let name = value.get("name")?.as_str()?.to_string();
            let cli = value.get("cli").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let task = value.get("task").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            Some(ParsedCommand::Spawn { name, cli, task, raw: raw.to_string() })
        }
        "release" => {
            let name = value.get("name")?.as_str()?.to_string();
            Some(ParsedCommand::Release { name, raw: raw.to_string() })
        }
        to => {
            let body = value.get("body").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            Some(ParsedCommand::Message { to: to.to_string(), thread, body, raw: raw.to_string() })
        }
    }
}

/// Replace every byte of each span with an ASCII space (newlines preserved),
/// so later passes can't re-match text already claimed by an earlier one,
/// while byte offsets into the original buffer stay stable.
fn mask_spans(text: &str, spans: impl Iterator<Item = (usize, usize)>) -> String {
    let mut bytes = text.as_bytes().to_vec();
    for (start, end) in spans {
        for b in &mut bytes[start..end] {
            if *b != b'\n' {
                *b = b' ';
            }
        }
    }
    String::from_utf8(bytes).unwrap_or_else(|_| text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inline_command() {
        let mut p = OutputParser::new();
        let cmds = p.feed("hello\n->relay:Bob hi there\nmore output\n");
        assert_eq!(cmds, vec![ParsedCommand::Message { to: "Bob".into(), thread: None, body: "hi there".into(), raw: "->relay:Bob hi there".into() }]);
    }

    #[test]
    fn parses_inline_command_with_thread() {
        let mut p = OutputParser::new();
        let cmds = p.feed("->relay:Bob [thread:t1] hi\n");
        assert_eq!(cmds, vec![ParsedCommand::Message { to: "Bob".into(), thread: Some("t1".into()), body: "hi".into(), raw: "->relay:Bob [thread:t1] hi".into() }]);
    }

    #[test]
    fn escaped_prefix_is_not_parsed() {
        let mut p = OutputParser::new();
        let cmds = p.feed("\\->relay:Bob not a command\n");
        assert!(cmds.is_empty());
    }

    #[test]
    fn parses_fenced_command_spanning_multiple_lines() {
        let mut p = OutputParser::new();
        let cmds = p.feed("->relay:Bob <<<\nline one\nline two\n>>>\n");
        match &cmds[0] {
            ParsedCommand::Message { to, body, .. } => {
                assert_eq!(to, "Bob");
                assert_eq!(body, "line one\nline two");
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn fenced_command_spanning_chunks_is_caught_via_lookback() {
        let mut p = OutputParser::new();
        let first = p.feed("->relay:Bob <<<\npart one\n");
        assert!(first.is_empty());
        let second = p.feed("part two\n>>>\n");
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn parses_json_block() {
        let mut p = OutputParser::new();
        let cmds = p.feed(r#"[[RELAY]] {"to":"Bob","type":"message","body":"hey"} [[/RELAY]]"#);
        assert_eq!(cmds, vec![ParsedCommand::Message { to: "Bob".into(), thread: None, body: "hey".into(), raw: r#"[[RELAY]] {"to":"Bob","type":"message","body":"hey"} [[/RELAY]]"#.into() }]);
    }

    #[test]
    fn spawn_and_release_are_split_out_as_control_commands() {
        let mut p = OutputParser::new();
        let cmds = p.feed("->relay:spawn Helper claude do the thing\n->relay:release Helper\n");
        assert_eq!(cmds.len(), 2);
        assert!(matches!(&cmds[0], ParsedCommand::Spawn { name, cli, task, .. } if name == "Helper" && cli == "claude" && task == "do the thing"));
        assert!(matches!(&cmds[1], ParsedCommand::Release { name, .. } if name == "Helper"));
    }

    #[test]
    fn lines_inside_markdown_code_fences_are_not_parsed() {
        let mut p = OutputParser::new();
        let cmds = p.feed("```\n->relay:Bob should not fire\n```\n->relay:Carol should fire\n");
        assert_eq!(cmds.len(), 1);
        assert!(matches!(&cmds[0], ParsedCommand::Message { to, .. } if to == "Carol"));
    }

    #[test]
    fn identical_input_never_reemits_on_append() {
        let mut p = OutputParser::new();
        let first = p.feed("->relay:Bob hi\n");
        assert_eq!(first.len(), 1);
        let second = p.feed("more text with no new commands\n");
        assert!(second.is_empty());
    }

    #[test]
    fn commands_are_yielded_in_textual_order() {
        let mut p = OutputParser::new();
        let cmds = p.feed("->relay:Alice first\n->relay:Bob second\n->relay:#room third\n");
        let targets: Vec<&str> = cmds
            .iter()
            .map(|c| match c {
                ParsedCommand::Message { to, .. } => to.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(targets, vec!["Alice", "Bob", "#room"]);
    }
}
