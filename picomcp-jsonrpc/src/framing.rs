//! Message framing: turning a byte stream into discrete JSON-RPC messages and back.
//!
//! Two disciplines are supported, selected by [`Framing`]:
//!
//! - newline-delimited text, one compact JSON document per line
//! - a 4-byte unsigned big-endian length prefix followed by that many bytes of UTF-8
//!
//! [`FrameCodec`] implements [`tokio_util::codec::Decoder`] and [`tokio_util::codec::Encoder`], so
//! it can be used with [`tokio_util::codec::Framed`] as well as driven by hand from
//! [`crate::Peer`].  The decoder keeps its scan position between calls, so a message that trickles
//! in one byte at a time is assembled exactly once and without rescanning.
//!
//! Every frame, inbound or outbound, is capped at `max_frame_len` bytes.  When an inbound frame
//! exceeds the cap the decoder reports [`FrameError::FrameTooLarge`] once, drops what it had
//! buffered, and silently discards the rest of the offending frame as it arrives.  The next frame
//! after it decodes normally.
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Default cap on the size of a single frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024;

const LENGTH_PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame of {len} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Frame is not valid UTF-8")]
    InvalidUtf8 { source: std::str::Utf8Error },

    #[error("Outbound message contains a raw newline and cannot be newline-framed")]
    EmbeddedDelimiter,

    #[error("I/O error")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// How messages are delimited on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Framing {
    #[default]
    NewlineDelimited,
    LengthPrefixed,
}

/// What the decoder does with bytes belonging to a frame it already rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discard {
    /// Drop everything up to and including the next newline.
    UntilNewline,
    /// Drop this many more bytes.
    Bytes(usize),
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    framing: Framing,
    max_frame_len: usize,
    /// Offset into the buffer up to which we already know there is no newline.
    next_index: usize,
    discarding: Option<Discard>,
}

impl FrameCodec {
    pub fn new(framing: Framing, max_frame_len: usize) -> Self {
        Self {
            framing,
            max_frame_len,
            next_index: 0,
            discarding: None,
        }
    }

    pub fn newline_delimited() -> Self {
        Self::new(Framing::NewlineDelimited, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn length_prefixed() -> Self {
        Self::new(Framing::LengthPrefixed, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Whether the decoder is currently dropping the tail of an oversized frame.
    pub fn is_discarding(&self) -> bool {
        self.discarding.is_some()
    }

    fn decode_line(&mut self, buf: &mut BytesMut) -> Result<Option<String>, FrameError> {
        loop {
            if self.discarding == Some(Discard::UntilNewline) {
                match buf.iter().position(|b| *b == b'\n') {
                    Some(offset) => {
                        buf.advance(offset + 1);
                        self.discarding = None;
                        tracing::trace!("Resynchronized after an oversized frame");
                    }
                    None => {
                        buf.clear();
                        return Ok(None);
                    }
                }
            }

            let start = self.next_index.min(buf.len());
            let Some(offset) = buf[start..].iter().position(|b| *b == b'\n') else {
                // A trailing `\r` may be the first half of a CRLF terminator
                let pending = match buf.last() {
                    Some(b'\r') => buf.len() - 1,
                    _ => buf.len(),
                };
                if pending > self.max_frame_len {
                    let len = buf.len();
                    buf.clear();
                    self.next_index = 0;
                    self.discarding = Some(Discard::UntilNewline);
                    return Err(FrameError::FrameTooLarge {
                        len,
                        max: self.max_frame_len,
                    });
                }
                self.next_index = buf.len();
                return Ok(None);
            };

            let newline_index = start + offset;
            self.next_index = 0;
            let line = buf.split_to(newline_index + 1);
            let mut line = &line[..newline_index];
            if let [rest @ .., b'\r'] = line {
                line = rest;
            }

            if line.len() > self.max_frame_len {
                return Err(FrameError::FrameTooLarge {
                    len: line.len(),
                    max: self.max_frame_len,
                });
            }

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return utf8(line).map(Some);
        }
    }

    fn decode_length_prefixed(&mut self, buf: &mut BytesMut) -> Result<Option<String>, FrameError> {
        loop {
            if let Some(Discard::Bytes(remaining)) = self.discarding {
                let dropped = remaining.min(buf.len());
                buf.advance(dropped);
                if dropped < remaining {
                    self.discarding = Some(Discard::Bytes(remaining - dropped));
                    return Ok(None);
                }
                self.discarding = None;
            }

            if buf.len() < LENGTH_PREFIX_LEN {
                return Ok(None);
            }

            let mut prefix = [0u8; LENGTH_PREFIX_LEN];
            prefix.copy_from_slice(&buf[..LENGTH_PREFIX_LEN]);
            let len = u32::from_be_bytes(prefix) as usize;

            if len > self.max_frame_len {
                buf.advance(LENGTH_PREFIX_LEN);
                let dropped = len.min(buf.len());
                buf.advance(dropped);
                if dropped < len {
                    self.discarding = Some(Discard::Bytes(len - dropped));
                }
                return Err(FrameError::FrameTooLarge {
                    len,
                    max: self.max_frame_len,
                });
            }

            if buf.len() < LENGTH_PREFIX_LEN + len {
                buf.reserve(LENGTH_PREFIX_LEN + len - buf.len());
                return Ok(None);
            }

            buf.advance(LENGTH_PREFIX_LEN);
            let payload = buf.split_to(len);
            if payload.is_empty() {
                continue;
            }

            return utf8(&payload).map(Some);
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::newline_delimited()
    }
}

fn utf8(bytes: &[u8]) -> Result<String, FrameError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|source| FrameError::InvalidUtf8 { source })
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, FrameError> {
        match self.framing {
            Framing::NewlineDelimited => self.decode_line(buf),
            Framing::LengthPrefixed => self.decode_length_prefixed(buf),
        }
    }
}

impl Encoder<&str> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, message: &str, dst: &mut BytesMut) -> Result<(), FrameError> {
        if message.len() > self.max_frame_len {
            return Err(FrameError::FrameTooLarge {
                len: message.len(),
                max: self.max_frame_len,
            });
        }

        match self.framing {
            Framing::NewlineDelimited => {
                if message.contains('\n') {
                    return Err(FrameError::EmbeddedDelimiter);
                }
                dst.reserve(message.len() + 1);
                dst.put_slice(message.as_bytes());
                dst.put_u8(b'\n');
            }
            Framing::LengthPrefixed => {
                // The cap is far below u32::MAX, so the cast is lossless
                dst.reserve(LENGTH_PREFIX_LEN + message.len());
                dst.put_u32(message.len() as u32);
                dst.put_slice(message.as_bytes());
            }
        }

        Ok(())
    }
}

impl Encoder<String> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, message: String, dst: &mut BytesMut) -> Result<(), FrameError> {
        Encoder::<&str>::encode(self, &message, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const MESSAGE: &str = r#"{"jsonrpc":"2.0","id":"1","method":"tools/call","params":{"name":"echo","arguments":{"text":"a\nb"}}}"#;

    fn encode(codec: &mut FrameCodec, message: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        codec.encode(message, &mut buf).unwrap();
        buf
    }

    fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Result<String, FrameError>> {
        let mut out = Vec::new();
        loop {
            match codec.decode(buf) {
                Ok(Some(message)) => out.push(Ok(message)),
                Ok(None) => break,
                Err(e) => out.push(Err(e)),
            }
        }
        out
    }

    /// Feed `bytes` one byte per decode call, collecting every complete message.
    fn feed_byte_by_byte(codec: &mut FrameCodec, bytes: &[u8]) -> Vec<String> {
        let mut buf = BytesMut::new();
        let mut messages = Vec::new();
        for byte in bytes {
            buf.put_u8(*byte);
            if let Some(message) = codec.decode(&mut buf).unwrap() {
                messages.push(message);
            }
        }
        messages
    }

    #[test]
    fn newline_byte_by_byte_matches_single_read() {
        let mut codec = FrameCodec::newline_delimited();
        let wire = encode(&mut codec, MESSAGE);

        let trickled = feed_byte_by_byte(&mut FrameCodec::newline_delimited(), &wire);
        let mut whole = wire.clone();
        let at_once = FrameCodec::newline_delimited().decode(&mut whole).unwrap();

        assert_eq!(trickled, vec![MESSAGE.to_string()]);
        assert_eq!(at_once.as_deref(), Some(MESSAGE));
        assert!(whole.is_empty());
    }

    #[test]
    fn length_prefixed_byte_by_byte_matches_single_read() {
        let mut codec = FrameCodec::length_prefixed();
        let mut wire = encode(&mut codec, MESSAGE);
        wire.extend_from_slice(&encode(&mut codec, "{}"));

        let trickled = feed_byte_by_byte(&mut FrameCodec::length_prefixed(), &wire);
        assert_eq!(trickled, vec![MESSAGE.to_string(), "{}".to_string()]);

        let mut whole = wire.clone();
        let at_once = decode_all(&mut FrameCodec::length_prefixed(), &mut whole);
        assert_eq!(at_once.len(), 2);
        assert_matches!(&at_once[0], Ok(m) if m == MESSAGE);
    }

    #[test]
    fn length_prefix_is_big_endian() {
        let wire = encode(&mut FrameCodec::length_prefixed(), "{}");
        assert_eq!(&wire[..], &[0, 0, 0, 2, b'{', b'}']);
    }

    #[test]
    fn message_near_the_cap_trickles_in() {
        let text = format!(r#"{{"pad":"{}"}}"#, "x".repeat(DEFAULT_MAX_FRAME_LEN - 10));
        assert_eq!(text.len(), DEFAULT_MAX_FRAME_LEN);

        for framing in [Framing::NewlineDelimited, Framing::LengthPrefixed] {
            let wire = encode(&mut FrameCodec::new(framing, DEFAULT_MAX_FRAME_LEN), &text);
            let messages = feed_byte_by_byte(&mut FrameCodec::new(framing, DEFAULT_MAX_FRAME_LEN), &wire);
            assert_eq!(messages, vec![text.clone()], "{framing}");
        }

        // The `\r` of a CRLF terminator does not count against the cap
        let mut wire = text.clone().into_bytes();
        wire.extend_from_slice(b"\r\n");
        let messages = feed_byte_by_byte(&mut FrameCodec::newline_delimited(), &wire);
        assert_eq!(messages, vec![text.clone()]);

        // One byte over still is rejected before the terminator shows up
        let mut codec = FrameCodec::new(Framing::NewlineDelimited, 64);
        let mut buf = BytesMut::from(format!("{}\r", "x".repeat(64)).as_bytes());
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.put_u8(b'x');
        assert_matches!(codec.decode(&mut buf), Err(FrameError::FrameTooLarge { len: 66, max: 64 }));
    }

    #[test]
    fn multiple_lines_in_one_read_are_split() {
        let mut codec = FrameCodec::newline_delimited();
        let mut buf = BytesMut::from("{\"a\":1}\r\n\n   \n{\"b\":2}\n{\"c\"");

        let decoded = decode_all(&mut codec, &mut buf);
        let decoded: Vec<_> = decoded.into_iter().map(Result::unwrap).collect();
        assert_eq!(decoded, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
        assert_eq!(&buf[..], b"{\"c\"");

        buf.extend_from_slice(b":3}\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some(r#"{"c":3}"#));
    }

    #[test]
    fn oversized_line_is_rejected_and_the_next_message_survives() {
        let mut codec = FrameCodec::new(Framing::NewlineDelimited, 64);
        let mut buf = BytesMut::new();

        // More than the cap with no newline yet
        buf.extend_from_slice(&[b'x'; 100]);
        assert_matches!(codec.decode(&mut buf), Err(FrameError::FrameTooLarge { len: 100, max: 64 }));
        assert!(buf.is_empty());
        assert!(codec.is_discarding());

        // The rest of the oversized line, then a good message split across reads
        buf.extend_from_slice(b"yyyyyyyy\n{\"ok\":");
        assert_matches!(codec.decode(&mut buf), Ok(None));
        assert!(!codec.is_discarding());
        buf.extend_from_slice(b"true}\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some(r#"{"ok":true}"#));
    }

    #[test]
    fn oversized_complete_line_is_rejected() {
        let mut codec = FrameCodec::new(Framing::NewlineDelimited, 8);
        let mut buf = BytesMut::from("0123456789\n{}\n");

        assert_matches!(codec.decode(&mut buf), Err(FrameError::FrameTooLarge { len: 10, max: 8 }));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn oversized_length_prefix_is_skipped() {
        let mut codec = FrameCodec::new(Framing::LengthPrefixed, 16);
        let mut buf = BytesMut::new();
        buf.put_u32(40);
        buf.extend_from_slice(&[b'z'; 10]);

        assert_matches!(codec.decode(&mut buf), Err(FrameError::FrameTooLarge { len: 40, max: 16 }));
        assert!(buf.is_empty());
        assert!(codec.is_discarding());

        // Remaining 30 bytes of the bad frame, then a good one
        buf.extend_from_slice(&[b'z'; 30]);
        buf.put_u32(2);
        buf.extend_from_slice(b"[]");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("[]"));
        assert!(!codec.is_discarding());
    }

    #[test]
    fn zero_length_frames_are_skipped() {
        let mut codec = FrameCodec::length_prefixed();
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_u32(2);
        buf.extend_from_slice(b"{}");

        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn invalid_utf8_is_reported_without_losing_sync() {
        let mut codec = FrameCodec::newline_delimited();
        let mut buf = BytesMut::from(&b"\xff\xfe\n{}\n"[..]);

        assert_matches!(codec.decode(&mut buf), Err(FrameError::InvalidUtf8 { .. }));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn encoder_refuses_raw_newlines() {
        let mut codec = FrameCodec::newline_delimited();
        let mut buf = BytesMut::new();

        assert_matches!(codec.encode("{\"a\":\n1}", &mut buf), Err(FrameError::EmbeddedDelimiter));
        assert!(buf.is_empty());

        // Length prefixing has no such restriction
        let mut codec = FrameCodec::length_prefixed();
        codec.encode("{\"a\":\n1}", &mut buf).unwrap();
        assert_eq!(buf.len(), 4 + 8);
    }

    #[test]
    fn encoder_enforces_the_cap() {
        let mut codec = FrameCodec::new(Framing::LengthPrefixed, 4);
        let mut buf = BytesMut::new();
        assert_matches!(
            codec.encode("12345", &mut buf),
            Err(FrameError::FrameTooLarge { len: 5, max: 4 })
        );
    }
}
