//! Line framing for the `text/event-stream` body.

/// Turns arbitrarily split body chunks into complete event payloads.
///
/// Bytes accumulate in a buffer that is only tokenized once it ends in a
/// newline, so a line is never processed in pieces. Within the buffer:
///
/// * `data:<payload>` appends the trimmed payload to the current event,
///   joining successive data lines with `\n`;
/// * a blank line completes the current event;
/// * any other line while an event is being built discards that event.
///
/// Lines outside an event (comments, `event:` or `id:` fields) are ignored.
#[derive(Debug, Default, Clone)]
pub struct SseParser {
    buffer: Vec<u8>,
    current: Option<String>,
}

impl SseParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and collect the payloads of every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.last() != Some(&b'\n') {
            return Vec::new();
        }

        let buffer = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&buffer);
        let mut events = Vec::new();

        // The buffer ends in '\n', so the final split piece is always empty.
        let mut lines: Vec<&str> = text.split('\n').collect();
        lines.pop();

        for line in lines {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if let Some(payload) = line.strip_prefix("data:") {
                let payload = payload.trim();
                match self.current.as_mut() {
                    Some(current) => {
                        current.push('\n');
                        current.push_str(payload);
                    }
                    None => self.current = Some(payload.to_string()),
                }
            } else if line.is_empty() {
                if let Some(event) = self.current.take()
                    && !event.is_empty()
                {
                    events.push(event);
                }
            } else if let Some(dropped) = self.current.take() {
                tracing::debug!(
                    target: "chatcube_net::sse",
                    line,
                    dropped_len = dropped.len(),
                    "unexpected line inside event, dropping it"
                );
            }
        }
        events
    }

    /// Whether an event has started but not yet completed.
    pub fn in_event(&self) -> bool {
        self.current.is_some()
    }

    /// Bytes waiting for a terminating newline.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Forget buffered bytes and any partial event.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.current = None;
    }
}
