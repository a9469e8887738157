//! Incremental server-sent-event framing.
//!
//! Both the classifier client and the translating adapters consume SSE
//! from upstreams that deliver bytes in arbitrary chunk boundaries. The
//! buffer below accumulates bytes and yields one `data:` payload per
//! complete event, so callers can translate each event as soon as it
//! arrives without buffering the response.

/// Accumulates raw SSE bytes and yields complete `data:` payloads.
///
/// Events are delimited by a blank line. Multiple `data:` lines within
/// one event are joined with `\n` per the SSE spec; events carrying no
/// data lines (comments, bare `event:` lines) are skipped.
#[derive(Default)]
pub struct SseEventBuffer {
    buffer: Vec<u8>,
}

impl SseEventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete event's data payload, or None when no full event is
    /// buffered. Loops past data-less events.
    pub fn next_event(&mut self) -> Option<String> {
        loop {
            let pos = self.buffer.windows(2).position(|w| w == b"\n\n")?;
            let event: Vec<u8> = self.buffer.drain(..pos + 2).collect();

            let mut data_segments: Vec<Vec<u8>> = Vec::new();
            for line in event[..event.len() - 2].split(|&b| b == b'\n') {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                if let Some(rest) = line.strip_prefix(b"data:") {
                    let payload = trim_ascii(rest);
                    if !payload.is_empty() {
                        data_segments.push(payload.to_vec());
                    }
                }
            }

            if data_segments.is_empty() {
                continue;
            }
            let joined = data_segments.join(&b'\n');
            return Some(String::from_utf8_lossy(&joined).into_owned());
        }
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|idx| idx + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

/// True for the `[DONE]` stream terminator.
pub fn is_done_marker(data: &str) -> bool {
    data.trim() == "[DONE]"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_events_split_across_chunks() {
        let mut buf = SseEventBuffer::new();
        buf.extend(b"data: {\"a\"");
        assert_eq!(buf.next_event(), None);
        buf.extend(b":1}\n\ndata: [DONE]\n\n");
        assert_eq!(buf.next_event().as_deref(), Some("{\"a\":1}"));
        let done = buf.next_event().unwrap();
        assert!(is_done_marker(&done));
        assert_eq!(buf.next_event(), None);
    }

    #[test]
    fn skips_event_only_frames_and_handles_crlf() {
        let mut buf = SseEventBuffer::new();
        buf.extend(b"event: message_start\r\n\r\ndata: {\"b\":2}\r\n\r\n");
        assert_eq!(buf.next_event().as_deref(), Some("{\"b\":2}"));
    }

    #[test]
    fn joins_multiple_data_lines() {
        let mut buf = SseEventBuffer::new();
        buf.extend(b"data: first\ndata: second\n\n");
        assert_eq!(buf.next_event().as_deref(), Some("first\nsecond"));
    }

    #[test]
    fn event_name_plus_data_yields_data_only() {
        let mut buf = SseEventBuffer::new();
        buf.extend(b"event: content_block_delta\ndata: {\"text\":\"hi\"}\n\n");
        assert_eq!(buf.next_event().as_deref(), Some("{\"text\":\"hi\"}"));
    }
}
