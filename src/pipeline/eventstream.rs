//! AWS binary event-stream framing (`application/vnd.amazon.eventstream`).
//!
//! ```text
//! [total_len u32][headers_len u32][prelude_crc u32][headers ...][payload ...][message_crc u32]
//! ```
//!
//! Both CRCs are CRC-32 (IEEE). Header values are typed; only string values
//! are interpreted, the others are skipped by size.

use crate::error::ChannelError;
use crate::error_code::ErrorKind;
use crate::pipeline::{Decoder, VendorEvent};
use crate::transport::TransportError;
use crate::{BoxStream, PipeResult};
use bytes::{Buf, Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use serde_json::{json, Value};
use std::io;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

const PRELUDE_LEN: usize = 12;
const MIN_MESSAGE_LEN: usize = PRELUDE_LEN + 4;
const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

const CRC_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { 0xEDB8_8320 ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
};

pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for b in bytes {
        crc = CRC_TABLE[((crc ^ *b as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    !crc
}

#[derive(Debug, thiserror::Error)]
pub enum EventStreamError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("prelude checksum mismatch")]
    PreludeChecksum,

    #[error("message checksum mismatch")]
    MessageChecksum,

    #[error("invalid message length {0}")]
    Length(usize),

    #[error("malformed header: {0}")]
    Header(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventStreamMessage {
    pub headers: Vec<(String, String)>,
    pub payload: Bytes,
}

impl EventStreamMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Encode a message with string headers (used by tests and benches).
    pub fn encode(headers: &[(&str, &str)], payload: &[u8]) -> Bytes {
        let mut hdr = Vec::new();
        for (name, value) in headers {
            hdr.push(name.len() as u8);
            hdr.extend_from_slice(name.as_bytes());
            hdr.push(7);
            hdr.extend_from_slice(&(value.len() as u16).to_be_bytes());
            hdr.extend_from_slice(value.as_bytes());
        }
        let total = PRELUDE_LEN + hdr.len() + payload.len() + 4;
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(total as u32).to_be_bytes());
        out.extend_from_slice(&(hdr.len() as u32).to_be_bytes());
        let prelude_crc = crc32(&out);
        out.extend_from_slice(&prelude_crc.to_be_bytes());
        out.extend_from_slice(&hdr);
        out.extend_from_slice(payload);
        let crc = crc32(&out);
        out.extend_from_slice(&crc.to_be_bytes());
        Bytes::from(out)
    }
}

/// `tokio_util` codec for event-stream messages.
#[derive(Debug, Default)]
pub struct EventStreamCodec;

impl tokio_util::codec::Decoder for EventStreamCodec {
    type Item = EventStreamMessage;
    type Error = EventStreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PRELUDE_LEN {
            return Ok(None);
        }
        let total = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        let headers_len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        let prelude_crc = u32::from_be_bytes([src[8], src[9], src[10], src[11]]);
        if crc32(&src[..8]) != prelude_crc {
            return Err(EventStreamError::PreludeChecksum);
        }
        if total < MIN_MESSAGE_LEN || total > MAX_MESSAGE_LEN || headers_len > total - MIN_MESSAGE_LEN {
            return Err(EventStreamError::Length(total));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let frame = src.split_to(total).freeze();
        let message_crc = u32::from_be_bytes([
            frame[total - 4],
            frame[total - 3],
            frame[total - 2],
            frame[total - 1],
        ]);
        if crc32(&frame[..total - 4]) != message_crc {
            return Err(EventStreamError::MessageChecksum);
        }
        let headers = parse_headers(frame.slice(PRELUDE_LEN..PRELUDE_LEN + headers_len))?;
        let payload = frame.slice(PRELUDE_LEN + headers_len..total - 4);
        Ok(Some(EventStreamMessage { headers, payload }))
    }
}

fn parse_headers(mut buf: Bytes) -> Result<Vec<(String, String)>, EventStreamError> {
    let short = || EventStreamError::Header("truncated header block".to_string());
    let mut headers = Vec::new();
    while buf.has_remaining() {
        let name_len = buf.get_u8() as usize;
        if buf.remaining() < name_len + 1 {
            return Err(short());
        }
        let name = String::from_utf8_lossy(&buf.split_to(name_len)).into_owned();
        let value_type = buf.get_u8();
        let skip = match value_type {
            0 | 1 => 0,
            2 => 1,
            3 => 2,
            4 => 4,
            5 | 8 => 8,
            9 => 16,
            6 | 7 => {
                if buf.remaining() < 2 {
                    return Err(short());
                }
                let len = buf.get_u16() as usize;
                if buf.remaining() < len {
                    return Err(short());
                }
                let raw = buf.split_to(len);
                if value_type == 7 {
                    headers.push((name, String::from_utf8_lossy(&raw).into_owned()));
                }
                continue;
            }
            other => return Err(EventStreamError::Header(format!("unknown value type {}", other))),
        };
        if buf.remaining() < skip {
            return Err(short());
        }
        buf.advance(skip);
    }
    Ok(headers)
}

/// Event-stream decoder for Bedrock ConverseStream.
///
/// `:message-type = event` frames become `Frame { event: :event-type, data }`.
/// `exception` / `error` frames become `Frame { event: "exception", data:
/// {"type", "message"} }` for the normalizer to surface.
#[derive(Debug, Clone, Default)]
pub struct EventStreamDecoder;

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn to_event(message: EventStreamMessage) -> PipeResult<VendorEvent> {
        let payload: Value = if message.payload.is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_slice(&message.payload)?
        };
        match message.header(":message-type").unwrap_or("event") {
            "event" => Ok(VendorEvent::Frame {
                event: message.header(":event-type").map(str::to_string),
                data: payload,
            }),
            _ => {
                let kind = message
                    .header(":exception-type")
                    .or_else(|| message.header(":error-code"))
                    .unwrap_or("unknownException")
                    .to_string();
                let text = payload
                    .get("message")
                    .or_else(|| payload.get("Message"))
                    .and_then(|m| m.as_str())
                    .or_else(|| message.header(":error-message"))
                    .unwrap_or("vendor stream error")
                    .to_string();
                Ok(VendorEvent::named("exception", json!({"type": kind, "message": text})))
            }
        }
    }
}

fn to_io(e: crate::Error) -> io::Error {
    let kind = match &e {
        crate::Error::Transport(t) if t.is_timeout() => io::ErrorKind::TimedOut,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, e.to_string())
}

fn from_codec(e: EventStreamError) -> crate::Error {
    match e {
        EventStreamError::Io(io) if io.kind() == io::ErrorKind::TimedOut => {
            crate::Error::Transport(TransportError::Timeout {
                phase: "body",
                after_ms: 0,
            })
        }
        EventStreamError::Io(io) => crate::Error::Transport(TransportError::Other(io.to_string())),
        framing => crate::Error::Channel(ChannelError::new(
            502,
            ErrorKind::BadGateway.name(),
            format!("event-stream framing: {}", framing),
        )),
    }
}

#[async_trait::async_trait]
impl Decoder for EventStreamDecoder {
    async fn decode_stream(
        &self,
        input: BoxStream<'static, Bytes>,
    ) -> PipeResult<BoxStream<'static, VendorEvent>> {
        let reader = StreamReader::new(input.map_err(to_io));
        let frames = FramedRead::new(reader, EventStreamCodec)
            .map_err(from_codec)
            .and_then(|message| async move { EventStreamDecoder::to_event(message) });
        Ok(Box::pin(frames))
    }
}
