use log::*;

/// Reassembles `\n`-terminated lines from arbitrarily split byte chunks.
///
/// Bytes are buffered until a newline arrives, so a chunk boundary falling in
/// the middle of a field name, a `\r\n` pair or a multi-byte UTF-8 sequence
/// makes no difference to the lines produced. A `\r` directly before the
/// newline is stripped.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: Vec<u8>,
    // Bytes of `buffer` already searched for a newline.
    scanned: usize,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every line it completed. Empty chunks are
    /// no-ops.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        if chunk.is_empty() {
            return lines;
        }
        self.buffer.extend_from_slice(chunk);

        let mut start = 0;
        let mut position = self.scanned;
        while let Some(offset) = self.buffer[position..].iter().position(|b| *b == b'\n') {
            let end = position + offset;
            let mut line = &self.buffer[start..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
            position = start;
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        lines
    }

    /// Bytes of the unfinished trailing line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Called when the transport ends. A line cut off mid-transmission is not a
    /// valid record, so it is discarded.
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() {
            debug!(
                "Discarding {} bytes of an unterminated line at end of stream",
                self.buffer.len()
            );
        }
        self.buffer.clear();
        self.scanned = 0;
    }
}
