//! Incremental `text/event-stream` parser.

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Turns arbitrary byte chunks into complete frames.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(chunk);
        // Hold back an incomplete UTF-8 sequence split across chunks
        let valid_up_to = match std::str::from_utf8(&self.pending) {
            Ok(text) => text.len(),
            Err(error) => error.valid_up_to(),
        };
        let complete: Vec<u8> = self.pending.drain(..valid_up_to).collect();
        self.buffer.push_str(&String::from_utf8_lossy(&complete));

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');
            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseFrame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn frames_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"type\":").is_empty());
        let frames = decoder.push(b"\"connected\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, r#"{"type":"connected"}"#);
    }

    #[test]
    fn comments_and_crlf_are_handled() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b": keep-alive\r\nevent: change\r\nid: 4\r\ndata: a\r\ndata: b\r\n\r\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: Some("change".to_string()),
                data: "a\nb".to_string(),
                id: Some("4".to_string()),
            }]
        );
    }

    #[test]
    fn multibyte_characters_survive_chunk_boundaries() {
        let mut decoder = SseDecoder::new();
        let payload = "data: caf\u{e9}\n\n".as_bytes();
        let split = payload.len() - 3;
        assert!(decoder.push(&payload[..split]).is_empty());
        let frames = decoder.push(&payload[split..]);
        assert_eq!(frames[0].data, "caf\u{e9}");
    }

    #[test]
    fn blank_lines_without_data_dispatch_nothing() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"\n\n: ping\n\n").is_empty());
    }
}
