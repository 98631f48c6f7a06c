//! Line reassembly for `text/event-stream` bodies.
//!
//! Network reads split frames at arbitrary byte offsets, including inside
//! multi-byte UTF-8 sequences. [`LineBuffer`] keeps the unterminated tail
//! between reads and only releases whole lines.

use bytes::{Buf, BytesMut};

#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a read and returns every line it completed, without the
    /// trailing `\n` / `\r\n`.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw = self.pending.split_to(pos);
            self.pending.advance(1);
            let raw = raw.strip_suffix(b"\r").unwrap_or(&raw[..]);
            lines.push(String::from_utf8_lossy(raw).into_owned());
        }
        lines
    }

    /// Bytes held back because no newline has arrived for them yet.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Flushes the unterminated tail at end of input.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = self.pending.split();
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseLine<'a> {
    Data(&'a str),
    Comment,
    Blank,
    /// `event:`, `id:`, `retry:` and anything else this protocol ignores.
    Other,
}

impl<'a> SseLine<'a> {
    pub fn parse(line: &'a str) -> Self {
        if line.is_empty() {
            return Self::Blank;
        }
        if line.starts_with(':') {
            return Self::Comment;
        }
        match line.strip_prefix("data:") {
            Some(rest) => Self::Data(rest.strip_prefix(' ').unwrap_or(rest)),
            None => Self::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_lines_in_one_read() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"data: {\"chunk\":\"a\"}\n\ndata: [DONE]\n\n");
        assert_eq!(
            lines,
            vec!["data: {\"chunk\":\"a\"}", "", "data: [DONE]", ""]
        );
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_line_split_across_reads() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"data: {\"chu").is_empty());
        assert!(buf.push(b"nk\":\"hel").is_empty());
        assert_eq!(buf.push(b"lo\"}\n"), vec!["data: {\"chunk\":\"hello\"}"]);
    }

    #[test]
    fn test_multibyte_char_split_across_reads() {
        let text = "data: {\"chunk\":\"héllo\"}\n".as_bytes();
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut buf = LineBuffer::new();
        assert!(buf.push(&text[..split]).is_empty());
        assert_eq!(buf.push(&text[split..]), vec!["data: {\"chunk\":\"héllo\"}"]);
    }

    #[test]
    fn test_crlf_is_stripped() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"data: x\r\n\r\n"), vec!["data: x", ""]);
    }

    #[test]
    fn test_finish_returns_tail() {
        let mut buf = LineBuffer::new();
        buf.push(b"data: [DO");
        assert_eq!(buf.finish().as_deref(), Some("data: [DO"));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_parse_line_kinds() {
        assert_eq!(SseLine::parse("data: {\"a\":1}"), SseLine::Data("{\"a\":1}"));
        assert_eq!(SseLine::parse("data:[DONE]"), SseLine::Data("[DONE]"));
        assert_eq!(SseLine::parse(": keep-alive"), SseLine::Comment);
        assert_eq!(SseLine::parse(""), SseLine::Blank);
        assert_eq!(SseLine::parse("event: message"), SseLine::Other);
    }
}
