//! Line decoder for `text/event-stream` chat completion bodies.
//!
//! Chat completion backends frame every event as a single `data:` line, so
//! the decoder works line by line rather than assembling multi-line events.
//! Bytes are buffered until a newline arrives, which also keeps multi-byte
//! UTF-8 sequences split across network chunks intact.

/// One decoded protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// Payload of a `data:` line.
    Data(String),
    /// The `[DONE]` sentinel.
    Done,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `[DONE]` has been seen; later input is ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw body bytes and return every complete line they finish.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseLine> {
        if self.done {
            return Vec::new();
        }
        self.buffer.extend_from_slice(bytes);

        let mut out = Vec::new();
        let mut start = 0;
        while let Some(rel) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + rel;
            let line = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            start = end + 1;

            if let Some(decoded) = self.decode_line(&line) {
                out.push(decoded);
                if self.done {
                    break;
                }
            }
        }
        self.buffer.drain(..start);
        if self.done {
            self.buffer.clear();
        }
        out
    }

    /// Flush a trailing line left without a newline when the body ends.
    pub fn finish(&mut self) -> Option<SseLine> {
        if self.done || self.buffer.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        self.decode_line(&line)
    }

    fn decode_line(&mut self, line: &str) -> Option<SseLine> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let data = line.strip_prefix("data:")?;
        let data = data.strip_prefix(' ').unwrap_or(data);

        if data == "[DONE]" {
            self.done = true;
            return Some(SseLine::Done);
        }
        if data.is_empty() {
            return None;
        }
        Some(SseLine::Data(data.to_string()))
    }
}
