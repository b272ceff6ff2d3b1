//! Server-Sent Events framing (Bytes -> VendorEvent)

use crate::error::ChannelError;
use crate::error_code::ErrorKind;
use crate::pipeline::{Decoder, VendorEvent};
use crate::{BoxStream, Error, PipeResult};
use bytes::Bytes;
use futures::{stream, StreamExt};
use serde_json::Value;

const DONE_SIGNAL: &str = "[DONE]";

/// Largest single event (pending line plus joined `data:` lines) accepted.
pub const DEFAULT_MAX_EVENT_BYTES: usize = 16 * 1024 * 1024;

/// Incremental SSE parser. Works on raw bytes and splits on line ends, so a
/// multi-byte character split across network chunks is never corrupted.
///
/// - `event:` names are kept and attached to the following data
/// - multiple `data:` lines in one event are joined with `\n`
/// - comment lines (`:`) and `id:` / `retry:` fields are ignored
/// - `data: [DONE]` becomes [`VendorEvent::Done`]
/// - non-JSON data is skipped
/// - an event growing past the size limit is an error
///
/// Every byte is scanned for a line end once; consumed bytes are compacted
/// away in bulk.
#[derive(Debug)]
pub struct SseParser {
    buf: Vec<u8>,
    /// Bytes before `start` have been consumed.
    start: usize,
    /// `buf[start..scanned]` holds no line end.
    scanned: usize,
    event: Option<String>,
    data: Vec<String>,
    data_len: usize,
    max_event_bytes: usize,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::with_max_event_bytes(DEFAULT_MAX_EVENT_BYTES)
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_event_bytes(max_event_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            start: 0,
            scanned: 0,
            event: None,
            data: Vec::new(),
            data_len: 0,
            max_event_bytes,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.start > 0 && self.start >= self.buf.len() / 2 {
            self.buf.drain(..self.start);
            self.scanned -= self.start;
            self.start = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Drop everything buffered, after a failure.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.start = 0;
        self.scanned = 0;
        self.event = None;
        self.data.clear();
        self.data_len = 0;
    }

    /// Bytes held for the event being assembled. Only meaningful once
    /// [`SseParser::next_event`] has drained every complete line.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len() - self.start + self.data_len
    }

    /// Next complete event from the buffered bytes.
    pub fn next_event(&mut self) -> PipeResult<Option<VendorEvent>> {
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            let mut line = &self.buf[self.start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            self.start = end + 1;
            self.scanned = self.start;
            if let Some(event) = self.feed_line(&line) {
                return Ok(Some(event));
            }
            self.check_size(self.data_len)?;
        }
        self.scanned = self.buf.len();
        self.check_size(self.pending_bytes())?;
        Ok(None)
    }

    /// Flush whatever is left once the byte stream has ended.
    pub fn finish(&mut self) -> PipeResult<Option<VendorEvent>> {
        if self.start < self.buf.len() {
            let line = String::from_utf8_lossy(&self.buf[self.start..])
                .trim_end_matches('\r')
                .to_string();
            self.buf.clear();
            self.start = 0;
            self.scanned = 0;
            if let Some(event) = self.feed_line(&line) {
                return Ok(Some(event));
            }
        }
        self.check_size(self.data_len)?;
        Ok(self.dispatch())
    }

    fn check_size(&self, pending: usize) -> PipeResult<()> {
        if pending > self.max_event_bytes {
            return Err(Error::Channel(ChannelError::new(
                502,
                ErrorKind::BadGateway.name(),
                format!("SSE event exceeds {} bytes ({} buffered)", self.max_event_bytes, pending),
            )));
        }
        Ok(())
    }

    fn feed_line(&mut self, line: &str) -> Option<VendorEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.find(':') {
            Some(i) => {
                let v = &line[i + 1..];
                (&line[..i], v.strip_prefix(' ').unwrap_or(v))
            }
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data_len += value.len() + 1;
                self.data.push(value.to_string());
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<VendorEvent> {
        let event = self.event.take();
        self.data_len = 0;
        if self.data.is_empty() {
            return None;
        }
        let payload = std::mem::take(&mut self.data).join("\n");
        let payload = payload.trim();
        if payload == DONE_SIGNAL {
            return Some(VendorEvent::Done);
        }
        match serde_json::from_str::<Value>(payload) {
            Ok(data) => Some(VendorEvent::Frame { event, data }),
            Err(_) => {
                tracing::debug!(event = ?event, "skipping non-JSON SSE frame");
                None
            }
        }
    }
}

/// SSE decoder used by every JSON-over-SSE vendor.
#[derive(Debug, Clone)]
pub struct SseDecoder {
    max_event_bytes: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self {
            max_event_bytes: DEFAULT_MAX_EVENT_BYTES,
        }
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_event_bytes(max_event_bytes: usize) -> Self {
        Self { max_event_bytes }
    }

    /// Decode an already complete SSE body.
    pub fn decode_all(body: &[u8]) -> PipeResult<Vec<VendorEvent>> {
        let mut parser = SseParser::new();
        parser.push(body);
        let mut events = Vec::new();
        while let Some(ev) = parser.next_event()? {
            events.push(ev);
        }
        events.extend(parser.finish()?);
        Ok(events)
    }
}

#[async_trait::async_trait]
impl Decoder for SseDecoder {
    async fn decode_stream(
        &self,
        input: BoxStream<'static, Bytes>,
    ) -> PipeResult<BoxStream<'static, VendorEvent>> {
        let parser = SseParser::with_max_event_bytes(self.max_event_bytes);
        let stream = stream::unfold(
            (input, parser, false),
            |(mut input, mut parser, mut eof)| async move {
                loop {
                    let step: PipeResult<VendorEvent> = match parser.next_event() {
                        Ok(Some(ev)) => return Some((Ok(ev), (input, parser, eof))),
                        Ok(None) if eof => return None,
                        Ok(None) => match input.next().await {
                            Some(Ok(bytes)) => {
                                parser.push(&bytes);
                                continue;
                            }
                            Some(Err(e)) => Err(e),
                            None => {
                                eof = true;
                                match parser.finish() {
                                    Ok(Some(ev)) => return Some((Ok(ev), (input, parser, eof))),
                                    Ok(None) => return None,
                                    Err(e) => Err(e),
                                }
                            }
                        },
                        Err(e) => Err(e),
                    };
                    // Failures end the stream; nothing buffered is emitted after them.
                    parser.reset();
                    return Some((step, (input, parser, true)));
                }
            },
        );
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::byte_stream;
    use futures::TryStreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn frames_split_across_chunks() {
        let input = byte_stream(vec![
            "event: message_start\r\nda",
            "ta: {\"a\":1}\r\n\r\n: keep-alive\n\n",
            "data: {\"b\":",
            "2}\n\ndata: [DONE]\n\n",
        ]);
        let events: Vec<VendorEvent> = SseDecoder::new()
            .decode_stream(input)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(
            events,
            vec![
                VendorEvent::named("message_start", json!({"a": 1})),
                VendorEvent::data(json!({"b": 2})),
                VendorEvent::Done,
            ]
        );
    }

    #[test]
    fn multibyte_characters_survive_chunk_boundaries() {
        let text = "data: {\"t\":\"héllo\"}\n\n".as_bytes();
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut parser = SseParser::new();
        parser.push(&text[..split]);
        assert!(parser.next_event().unwrap().is_none());
        parser.push(&text[split..]);
        assert_eq!(parser.next_event().unwrap(), Some(VendorEvent::data(json!({"t": "héllo"}))));
    }

    #[test]
    fn trailing_frame_without_blank_line_is_flushed() {
        let events = SseDecoder::decode_all(b"data: {\"x\":1}\n\ndata: {\"y\":2}").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], VendorEvent::data(json!({"y": 2})));
    }

    #[test]
    fn byte_at_a_time_large_frame() {
        let text = "x".repeat(64 * 1024);
        let frame = format!("data: {{\"t\":\"{}\"}}\n\ndata: [DONE]\n\n", text);
        let mut parser = SseParser::new();
        let mut events = Vec::new();
        for b in frame.as_bytes() {
            parser.push(std::slice::from_ref(b));
            while let Some(ev) = parser.next_event().unwrap() {
                events.push(ev);
            }
        }
        assert_eq!(events, vec![VendorEvent::data(json!({"t": text})), VendorEvent::Done]);
        assert_eq!(parser.pending_bytes(), 0);
    }

    #[test]
    fn unterminated_line_past_the_limit_fails() {
        let mut parser = SseParser::with_max_event_bytes(64);
        parser.push(b"data: ");
        assert!(parser.next_event().unwrap().is_none());
        parser.push(&[b'a'; 100]);
        let err = parser.next_event().unwrap_err();
        assert_eq!(err.to_channel_error().status, 502);
    }

    #[test]
    fn many_data_lines_count_toward_the_limit() {
        let mut parser = SseParser::with_max_event_bytes(64);
        for _ in 0..20 {
            parser.push(b"data: 0123456789\n");
        }
        assert!(parser.next_event().is_err());
    }

    #[tokio::test]
    async fn oversized_stream_event_ends_the_stream_with_one_error() {
        let input = byte_stream(vec!["data: {\"a\":1}\n\n", "data: 0123456789012345678901234567890123456789"]);
        let results: Vec<PipeResult<VendorEvent>> = SseDecoder::with_max_event_bytes(32)
            .decode_stream(input)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), &VendorEvent::data(json!({"a": 1})));
        assert!(results[1].is_err());
    }

    #[test]
    fn limit_applies_per_event_not_per_body() {
        let body: String = (0..100).map(|i| format!("data: {{\"i\":{}}}\n\n", i)).collect();
        let mut parser = SseParser::with_max_event_bytes(32);
        parser.push(body.as_bytes());
        let mut count = 0;
        while parser.next_event().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 100);
    }
}
