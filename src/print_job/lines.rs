// src/print_job/lines.rs - Newline splitting across chunk boundaries
use std::collections::VecDeque;

/// One command line with the number of file bytes it occupied, excluding
/// the newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    pub byte_len: u64,
}

impl Line {
    fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            text: String::from_utf8_lossy(bytes).into_owned(),
            byte_len: bytes.len() as u64,
        }
    }
}

/// Splits raw file chunks into lines. The fragment after the last newline
/// of a chunk is carried into the next one, so the produced lines do not
/// depend on where chunk boundaries fall.
#[derive(Debug, Default)]
pub struct LineBuffer {
    lines: VecDeque<Line>,
    partial: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        let mut rest = chunk;
        while let Some(newline) = rest.iter().position(|&b| b == b'\n') {
            self.partial.extend_from_slice(&rest[..newline]);
            self.lines.push_back(Line::from_bytes(&self.partial));
            self.partial.clear();
            rest = &rest[newline + 1..];
        }
        self.partial.extend_from_slice(rest);
    }

    /// End of input: queue the carried fragment, if any, as a final line.
    /// Returns whether a line was queued.
    pub fn finish(&mut self) -> bool {
        if self.partial.is_empty() {
            return false;
        }
        self.lines.push_back(Line::from_bytes(&self.partial));
        self.partial.clear();
        true
    }

    pub fn pop(&mut self) -> Option<Line> {
        self.lines.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Drop everything buffered, used after the file is repositioned.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"G28\nG1 X10 ; move\n\nM104 S200\r\nG1 E5";

    fn split_with_chunk(data: &[u8], chunk: usize) -> Vec<Line> {
        let mut buffer = LineBuffer::new();
        let mut out = Vec::new();
        for piece in data.chunks(chunk) {
            buffer.feed(piece);
            while let Some(line) = buffer.pop() {
                out.push(line);
            }
        }
        buffer.finish();
        while let Some(line) = buffer.pop() {
            out.push(line);
        }
        out
    }

    #[test]
    fn same_lines_for_any_chunk_size() {
        let whole = split_with_chunk(SAMPLE, SAMPLE.len());
        for chunk in 1..SAMPLE.len() {
            assert_eq!(split_with_chunk(SAMPLE, chunk), whole, "chunk size {}", chunk);
        }
        let texts: Vec<&str> = whole.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["G28", "G1 X10 ; move", "", "M104 S200\r", "G1 E5"]);
    }

    #[test]
    fn byte_lengths_cover_the_file() {
        let lines = split_with_chunk(SAMPLE, 7);
        let total: u64 = lines.iter().map(|l| l.byte_len + 1).sum();
        // the final line has no newline
        assert_eq!(total, SAMPLE.len() as u64 + 1);
    }

    #[test]
    fn multibyte_split_is_counted_in_bytes() {
        let data = "; é\nG1\n".as_bytes();
        let lines = split_with_chunk(data, 3);
        assert_eq!(lines[0].text, "; é");
        assert_eq!(lines[0].byte_len, 4);
    }

    #[test]
    fn clear_drops_partial() {
        let mut buffer = LineBuffer::new();
        buffer.feed(b"G1 X1\nG1 X");
        buffer.clear();
        buffer.feed(b"2\n");
        assert_eq!(buffer.pop().map(|l| l.text), Some("2".to_string()));
        assert!(!buffer.finish());
    }
}
