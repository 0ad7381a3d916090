//! Incremental decoder for `text/event-stream` bodies.
//!
//! Only `data:` fields matter to the progress channel; every other field and
//! comment line is skipped.

use std::collections::VecDeque;

/// Splits a byte stream into event payloads (the joined `data:` lines of each
/// event). Chunks may end anywhere, including mid-line or mid-character.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
    ready: VecDeque<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the body.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.handle_line(&String::from_utf8_lossy(&line));
        }
    }

    /// Next complete event payload, if any.
    pub fn next_event(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    /// Flush an event left unterminated when the body ended.
    pub fn finish(&mut self) -> Option<String> {
        if !self.buf.is_empty() {
            let line = String::from_utf8_lossy(&std::mem::take(&mut self.buf)).into_owned();
            self.handle_line(line.trim_end_matches('\r'));
        }
        self.dispatch();
        self.ready.pop_front()
    }

    fn handle_line(&mut self, line: &str) {
        if line.is_empty() {
            self.dispatch();
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
    }

    fn dispatch(&mut self) {
        if self.data.is_empty() {
            return;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        self.ready.push_back(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut SseDecoder) -> Vec<String> {
        std::iter::from_fn(|| decoder.next_event()).collect()
    }

    #[test]
    fn decodes_events_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: {\"status\":\"proc");
        assert!(decoder.next_event().is_none());
        decoder.push(b"essing\"}\n\ndata: second\n");
        decoder.push(b"\n");

        assert_eq!(
            drain(&mut decoder),
            vec![r#"{"status":"processing"}"#.to_string(), "second".to_string()]
        );
    }

    #[test]
    fn accepts_crlf_and_skips_comments_and_other_fields() {
        let mut decoder = SseDecoder::new();
        decoder.push(b": keep-alive\r\nevent: progress\r\nid: 7\r\ndata: a\r\n\r\n");
        assert_eq!(drain(&mut decoder), vec!["a".to_string()]);
    }

    #[test]
    fn joins_multi_line_data() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: line one\ndata:line two\n\n");
        assert_eq!(drain(&mut decoder), vec!["line one\nline two".to_string()]);
    }

    #[test]
    fn blank_lines_without_data_emit_nothing() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"\n\n\n");
        assert!(decoder.next_event().is_none());
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: tail");
        assert!(decoder.next_event().is_none());
        assert_eq!(decoder.finish(), Some("tail".to_string()));
        assert_eq!(decoder.finish(), None);
    }
}
