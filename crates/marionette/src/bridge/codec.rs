//! Framed codec for the automation transport.
//!
//! One compact JSON document per newline-terminated line. Decoding yields the
//! raw text so the dispatcher can answer malformed JSON with a structured parse
//! error instead of dropping the peer. Lines that are not UTF-8 are reported as
//! [`Frame::Invalid`] for the same reason. Works over any AsyncRead/AsyncWrite
//! (TCP, pipes, in-memory duplex).

use std::io;

use serde::Serialize;
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest single message accepted from a peer.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// One decoded line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// The line was not valid UTF-8. Carries the decoding error.
    Invalid(String),
}

/// Codec that frames messages by newline and serializes with JSON.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_length: usize,
    /// Bytes of the buffer already searched for a newline.
    next_index: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }
}

fn frame_from(line: &[u8]) -> Option<Frame> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    let frame = match std::str::from_utf8(line) {
        Ok(text) => Frame::Text(text.to_string()),
        Err(e) => Frame::Invalid(e.to_string()),
    };
    tracing::trace!(frame_size_bytes = line.len(), "Decoded frame");
    Some(frame)
}

fn too_long() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "frame exceeds maximum length")
}

impl Decoder for MessageCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let end = src.len().min(self.max_length + 1);
            match src[self.next_index..end].iter().position(|b| *b == b'\n') {
                Some(offset) => {
                    let line = src.split_to(self.next_index + offset + 1);
                    self.next_index = 0;
                    if let Some(frame) = frame_from(&line[..line.len() - 1]) {
                        return Ok(Some(frame));
                    }
                }
                None if src.len() > self.max_length => return Err(too_long()),
                None => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let line = src.split_to(src.len());
        self.next_index = 0;
        Ok(frame_from(&line))
    }
}

impl<T: Serialize> Encoder<T> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(frame_size_bytes = json.len(), "Encoding frame");
        if json.len() > 1_000_000 {
            tracing::info!(
                frame_size_bytes = json.len(),
                frame_size_kb = json.len() / 1024,
                "Large frame being encoded"
            );
        }
        dst.reserve(json.len() + 1);
        dst.put_slice(json.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Request, RequestId, Response, parse_request};
    use serde_json::json;

    fn text(frame: Option<Frame>) -> String {
        match frame {
            Some(Frame::Text(text)) => text,
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn encoded_request_decodes_to_one_line() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();

        let req = Request::new(1, "ping");
        codec.encode(&req, &mut buf).unwrap();
        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 1);

        let line = text(codec.decode(&mut buf).unwrap());
        assert_eq!(parse_request(&line).unwrap(), req);
        assert!(buf.is_empty());
    }

    #[test]
    fn embedded_newlines_are_escaped() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();

        let resp = Response::success(RequestId::Number(4), json!("line one\nline two"));
        codec.encode(resp.clone(), &mut buf).unwrap();

        let line = text(codec.decode(&mut buf).unwrap());
        let back: Response = serde_json::from_str(&line).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&br#"{"id": 1, "met"#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"hod\": \"ping\"}\n");
        let line = text(codec.decode(&mut buf).unwrap());
        assert_eq!(parse_request(&line).unwrap().method, "ping");
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"\n  \r\n{\"id\":1,\"method\":\"ping\"}\r\n"[..]);
        assert_eq!(text(codec.decode(&mut buf).unwrap()), r#"{"id":1,"method":"ping"}"#);
    }

    #[test]
    fn malformed_json_still_frames() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"{oops\n"[..]);
        assert_eq!(text(codec.decode(&mut buf).unwrap()), "{oops");
    }

    #[test]
    fn non_utf8_line_is_reported_and_stream_continues() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"\xff\xfe\n{\"id\":2,\"method\":\"ping\"}\n"[..]);
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(Frame::Invalid(_))));
        let line = text(codec.decode(&mut buf).unwrap());
        assert_eq!(parse_request(&line).unwrap().id, RequestId::Number(2));
    }

    #[test]
    fn oversized_frame_is_an_error() {
        let mut codec = MessageCodec::with_max_length(8);
        let mut buf = BytesMut::from(&b"0123456789abcdef\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut codec = MessageCodec::with_max_length(8);
        let mut buf = BytesMut::from(&b"01234567\n"[..]);
        assert_eq!(text(codec.decode(&mut buf).unwrap()), "01234567");
    }

    #[test]
    fn search_resumes_where_it_stopped() {
        let mut codec = MessageCodec::with_max_length(16);
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"ab\n");
        assert_eq!(text(codec.decode(&mut buf).unwrap()), "0123456789ab");
    }

    #[test]
    fn trailing_frame_without_newline_decodes_at_eof() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&br#"{"id":2,"method":"ping"}"#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let line = text(codec.decode_eof(&mut buf).unwrap());
        assert_eq!(parse_request(&line).unwrap().id, RequestId::Number(2));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }
}
