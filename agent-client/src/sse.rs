//! SSE framing: `event:`/`data:` fields, blank-line delimited (spec.md §4.4, §6, GLOSSARY).
//!
//! Kept separate from `client.rs` so the framing logic (accumulate lines until a blank line,
//! then decide the event) is unit-testable without a live HTTP connection.

use serde_json::Value;

use crate::error::{AgentClientError, Result};
use crate::types::AgentEvent;

/// Accumulates raw SSE bytes into complete frames and turns each into an [`AgentEvent`].
/// One `Accumulator` per subscription; feed it bytes as they arrive off the wire.
#[derive(Default)]
pub struct Accumulator {
    buf: String,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a raw chunk, returning any complete events extracted from it (a chunk can
    /// contain zero, one, or several frames).
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<AgentEvent>> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();
        loop {
            let Some(idx) = self.buf.find('\n') else { break };
            let line = self.buf[..idx].trim_end_matches('\r').to_string();
            self.buf.drain(..=idx);
            if line.is_empty() {
                if let Some(event) = self.finish_frame() {
                    out.push(event);
                }
                continue;
            }
            if let Some(name) = line.strip_prefix("event:") {
                self.event_name = Some(name.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
            // Other SSE fields (id:, retry:, comments starting with ':') are ignored —
            // the agent protocol doesn't use them (spec.md §4.4).
        }
        out
    }

    fn finish_frame(&mut self) -> Option<Result<AgentEvent>> {
        let event_name = self.event_name.take();
        let data_lines = std::mem::take(&mut self.data_lines);
        if data_lines.is_empty() && event_name.is_none() {
            return None;
        }
        let data = data_lines.join("\n");
        if data.is_empty() {
            return None;
        }
        Some(parse_frame(event_name, &data))
    }
}

fn parse_frame(event_name: Option<String>, data: &str) -> Result<AgentEvent> {
    let payload: Value = serde_json::from_str(data)
        .map_err(|e| AgentClientError::Decode(format!("sse payload: {e}")))?;
    let event_type = event_name
        .or_else(|| payload.get("type").and_then(|v| v.as_str()).map(str::to_string))
        .ok_or_else(|| AgentClientError::Decode("sse event with no type".into()))?;
    let properties = payload
        .get("properties")
        .cloned()
        .unwrap_or_else(|| payload.clone());
    Ok(AgentEvent { event_type, properties })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_with_event_and_data() {
        let mut acc = Accumulator::new();
        let events = acc.feed(b"event: session.idle\ndata: {\"sessionID\":\"s1\"}\n\n");
        assert_eq!(events.len(), 1);
        let ev = events[0].as_ref().unwrap();
        assert_eq!(ev.event_type, "session.idle");
        assert_eq!(ev.session_id(), Some("s1"));
    }

    #[test]
    fn type_from_payload_when_no_event_field() {
        let mut acc = Accumulator::new();
        let events = acc.feed(b"data: {\"type\":\"tool.execute\",\"properties\":{\"sessionID\":\"s2\"}}\n\n");
        let ev = events[0].as_ref().unwrap();
        assert_eq!(ev.event_type, "tool.execute");
        assert_eq!(ev.session_id(), Some("s2"));
    }

    #[test]
    fn multi_line_data_joined_with_newline() {
        let mut acc = Accumulator::new();
        let events = acc.feed(b"event: custom\ndata: {\"properties\":\ndata: {\"x\":1}}\n\n");
        let ev = events[0].as_ref().unwrap();
        assert_eq!(ev.event_type, "custom");
        assert_eq!(ev.properties["x"], 1);
    }

    #[test]
    fn malformed_json_yields_decode_error_not_panic() {
        let mut acc = Accumulator::new();
        let events = acc.feed(b"event: custom\ndata: not json\n\n");
        assert!(matches!(events[0], Err(AgentClientError::Decode(_))));
    }

    #[test]
    fn feeds_across_multiple_chunks() {
        let mut acc = Accumulator::new();
        let mut events = acc.feed(b"event: session.idle\n");
        assert!(events.is_empty());
        events = acc.feed(b"data: {\"sessionID\":\"s1\"}\n");
        assert!(events.is_empty());
        events = acc.feed(b"\n");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn blank_lines_between_frames_separate_events() {
        let mut acc = Accumulator::new();
        let events = acc.feed(
            b"event: a\ndata: {\"sessionID\":\"1\"}\n\nevent: b\ndata: {\"sessionID\":\"2\"}\n\n",
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().event_type, "a");
        assert_eq!(events[1].as_ref().unwrap().event_type, "b");
    }

    #[test]
    fn ignores_comment_and_id_lines() {
        let mut acc = Accumulator::new();
        let events = acc.feed(b": heartbeat\nid: 7\nevent: ping\ndata: {}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap().event_type, "ping");
    }
}
