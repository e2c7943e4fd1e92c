//! Incremental Server-Sent-Events parsing for the outbound SSE transport.
//!
//! Remote MCP servers frame both the endpoint announcement and every JSON-RPC
//! response as SSE events on a long-lived stream; chunks arriving from the
//! network can split events at arbitrary byte boundaries.

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// Event name; empty defaults to "message" per the SSE spec.
    pub event: String,
    pub data: String,
}

impl SseEvent {
    pub fn kind(&self) -> &str {
        if self.event.is_empty() {
            "message"
        } else {
            &self.event
        }
    }
}

/// Incremental SSE decoder. Feed chunks as they arrive; completed events come
/// back in order.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: String,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data_lines.is_empty() || !self.event.is_empty() {
                    events.push(SseEvent {
                        event: std::mem::take(&mut self.event),
                        data: self.data_lines.join("\n"),
                    });
                    self.data_lines.clear();
                }
                continue;
            }

            if let Some(value) = line.strip_prefix("event:") {
                self.event = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
            }
            // Comments (`:`) and unknown fields are ignored.
        }

        events
    }
}

/// Decode a complete SSE-formatted body in one pass.
pub fn parse_sse_body(body: &str) -> Vec<SseEvent> {
    let mut parser = SseParser::new();
    let mut events = parser.push(body);
    // Flush a trailing event that was not terminated by a blank line.
    events.extend(parser.push("\n\n"));
    events
}
