//! Newline-delimited JSON stream framing.
//!
//! Protocol messages arrive one per line on the child's stdout, with no
//! length prefix. `LineBuffer` accumulates raw chunks and yields complete
//! lines; a message split across chunk boundaries is held back until its
//! newline arrives. Mutated only by the single stdout reader task.

/// Growable buffer over raw stdout chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line it closes.
    ///
    /// Splits on `\n`; the final (possibly incomplete) element becomes the
    /// new buffer content. Lines are trimmed and empty lines skipped. Bytes
    /// are only decoded once a full line is available, so multi-byte UTF-8
    /// sequences split across chunks survive intact.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    /// Bytes currently held back waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
