use std::fmt::Write as _;

use tracing::debug;

/// One SSE block decomposed into its `event` and `data` fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// Last `event:` value seen in the block.
    pub event: Option<String>,
    /// All `data:` values in source order, joined by `\n`.
    pub data: Option<String>,
}

impl SseFrame {
    /// Serializes the frame back into a blank-line terminated SSE block.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        if let Some(event) = &self.event {
            let _ = writeln!(out, "event: {event}");
        }
        if let Some(data) = &self.data {
            for line in data.split('\n') {
                let _ = writeln!(out, "data: {line}");
            }
        }
        out.push('\n');
        out
    }
}

/// Parses one delimiter-separated SSE block.
///
/// Returns `None` only when the block is blank. Comment lines (`:`), lines
/// without a field separator and unknown field names are dropped. A
/// comment-only block therefore yields an empty frame.
pub fn parse_sse_frame(block: &str) -> Option<SseFrame> {
    let trimmed = block.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut frame = SseFrame::default();
    for raw_line in trimmed.split('\n') {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => frame.event = Some(value.to_string()),
            "data" => match frame.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => frame.data = Some(value.to_string()),
            },
            _ => {}
        }
    }
    Some(frame)
}

/// Incremental SSE decoder fed with raw transport chunks.
///
/// Chunks may split a delimiter, a field name or a multi-byte UTF-8 sequence;
/// only complete blocks are handed to [`parse_sse_frame`].
#[derive(Debug, Default)]
pub struct SseDecoder {
    utf8: Utf8Decoder,
    buffer: String,
}

impl SseDecoder {
    /// Appends a byte chunk and returns every frame completed by it.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.utf8.decode(chunk, &mut self.buffer);
        self.drain_frames()
    }

    /// Appends already-decoded text and returns every frame completed by it.
    pub fn push_str(&mut self, text: &str) -> Vec<SseFrame> {
        self.buffer.push_str(text);
        self.drain_frames()
    }

    /// Signals end of input.
    ///
    /// Flushes any partial UTF-8 sequence, emits the frames that become
    /// complete, then drops an unterminated remainder.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        self.utf8.flush(&mut self.buffer);
        let frames = self.drain_frames();
        if !self.buffer.trim().is_empty() {
            debug!(
                remainder_len = self.buffer.len(),
                "discarding unterminated SSE block at end of stream"
            );
        }
        self.buffer.clear();
        frames
    }

    /// Text received but not yet terminated by a blank line.
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    fn drain_frames(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        while let Some((idx, delim_len)) = find_frame_delimiter(self.buffer.as_bytes()) {
            if let Some(frame) = parse_sse_frame(&self.buffer[..idx]) {
                frames.push(frame);
            }
            self.buffer.drain(..idx + delim_len);
        }
        frames
    }
}

fn find_frame_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len()
            && buf[i] == b'\r'
            && buf[i + 1] == b'\n'
            && buf[i + 2] == b'\r'
            && buf[i + 3] == b'\n'
        {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

/// Streaming UTF-8 decoder that holds back an incomplete trailing sequence.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8], out: &mut String) {
        self.pending.extend_from_slice(chunk);
        let mut start = 0;
        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(text) => {
                    out.push_str(text);
                    start = self.pending.len();
                }
                Err(err) => {
                    let valid_end = start + err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[start..valid_end]));
                    match err.error_len() {
                        Some(invalid_len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + invalid_len;
                        }
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
    }

    fn flush(&mut self, out: &mut String) {
        if !self.pending.is_empty() {
            out.push_str(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
    }
}
