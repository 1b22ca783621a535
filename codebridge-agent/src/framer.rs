// ABOUTME: Line framer that turns stdout byte chunks into output records.
// ABOUTME: Keeps partial lines across chunks; malformed lines are logged and dropped.

use crate::record::OutputRecord;

/// Longest prefix of a rejected line that gets logged
const PREVIEW_CHARS: usize = 200;

/// Splits a byte stream on `\n` and parses each complete line as JSON.
///
/// Splitting happens on raw bytes so a multi-byte UTF-8 character cut in
/// half by a chunk boundary is reassembled before decoding.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every record completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<OutputRecord> {
        self.buffer.extend_from_slice(chunk);

        let Some(last_newline) = self.buffer.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        complete
            .split(|b| *b == b'\n')
            .filter_map(parse_line)
            .collect()
    }

    /// Bytes held back waiting for a line terminator
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// End of stream: attempt whatever fragment is left as a final record
    pub fn finish(&mut self) -> Option<OutputRecord> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(line: &[u8]) -> Option<OutputRecord> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) if value.is_object() => Some(OutputRecord::new(value)),
        Ok(_) | Err(_) => {
            let preview: String = trimmed.chars().take(PREVIEW_CHARS).collect();
            tracing::debug!(line = %preview, "Non-JSON line from CLI");
            None
        }
    }
}
