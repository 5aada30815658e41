//! Server-Sent Events parsing for streaming LLM responses.
//!
//! Providers stream chat completions as `text/event-stream` bodies. The
//! parser is incremental: network chunks can split lines and events
//! arbitrarily, so bytes are buffered until complete lines are available.

/// One parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, when present.
    pub event_type: Option<String>,
    /// Joined `data:` payload.
    pub data: String,
}

impl SseEvent {
    /// Whether this is the `[DONE]` end-of-stream sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE parser fed with raw body chunks.
#[derive(Debug, Default)]
pub struct SseParser {
    line_buffer: String,
    event_type: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a body chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.line_buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(newline) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        // Blank line terminates the current event.
        if line.is_empty() {
            if self.data_lines.is_empty() {
                self.event_type = None;
                return None;
            }
            return Some(SseEvent {
                event_type: self.event_type.take(),
                data: std::mem::take(&mut self.data_lines).join("\n"),
            });
        }

        // Comment lines start with ':'.
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => self.data_lines.push(value.to_owned()),
            "event" => self.event_type = Some(value.to_owned()),
            // `id` and `retry` are irrelevant to completion streams.
            _ => {}
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_event() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: {\"text\":\"hi\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"text\":\"hi\"}");
        assert!(events[0].event_type.is_none());
    }

    #[test]
    fn reassembles_events_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: {\"tok").is_empty());
        assert!(parser.push(b"en\":\"he").is_empty());
        let events = parser.push(b"llo\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"token\":\"hello\"}");
    }

    #[test]
    fn multiple_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: one\n\ndata: two\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].data, "one");
        assert_eq!(events[1].data, "two");
        assert!(events[2].is_done());
    }

    #[test]
    fn multiline_data_joined_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: first\ndata: second\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "first\nsecond");
    }

    #[test]
    fn event_type_and_comments() {
        let mut parser = SseParser::new();
        let events = parser.push(b": keepalive\nevent: message\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_deref(), Some("message"));
    }

    #[test]
    fn crlf_line_endings() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn blank_lines_without_data_emit_nothing() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"\n\n\n").is_empty());
    }
}
