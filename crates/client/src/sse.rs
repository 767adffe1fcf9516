/// One server-sent event frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Network chunks can split lines (and multi-byte characters) anywhere, so raw bytes
/// are buffered until a full line is available. Frames are only emitted on the blank
/// separator line.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(line_end) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw_line = self.buffer.drain(..=line_end).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&raw_line[..line_end]);

            if let Some(frame) = self.accept_line(line.trim_end_matches('\r')) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flushes a trailing frame when the body ends without a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = String::from_utf8_lossy(&rest);
        let rest = rest.trim_end_matches('\r');
        if !rest.is_empty() {
            let _ = self.accept_line(rest);
        }
        self.take_frame()
    }

    fn accept_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.take_frame();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn take_frame(&mut self) -> Option<SseFrame> {
        if self.event.is_none() && self.data_lines.is_empty() {
            return None;
        }
        Some(SseFrame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        })
    }
}
