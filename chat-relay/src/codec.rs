//! Frame codec for the relay wire protocol.
//!
//! Every frame is `[i32 type][i32 length][length bytes]`, all integers
//! big-endian. Type `1` carries UTF-8 text, type `2` carries raw image bytes.
//! There is no resynchronisation: the first malformed frame makes the stream
//! unusable and the caller is expected to drop the connection.

use std::{io, str::Utf8Error};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{Message, MessageKind};

/// Largest payload accepted or produced unless configured otherwise (16 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const TAG_LEN: usize = 4;
const LENGTH_LEN: usize = 4;
const HEADER_LEN: usize = TAG_LEN + LENGTH_LEN;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown frame type {0}")]
    UnknownType(i32),
    #[error("negative payload length {0}")]
    NegativeLength(i32),
    #[error("payload of {len} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("text payload is not valid UTF-8: {0}")]
    InvalidText(Utf8Error),
    #[error("stream ended with {buffered} bytes of an incomplete frame")]
    Truncated { buffered: usize },
}

impl FrameError {
    /// True for errors caused by the peer's bytes rather than the transport.
    pub fn is_protocol(&self) -> bool {
        !matches!(self, FrameError::Io(_))
    }
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        // The length field is a signed 32-bit integer, so nothing larger can
        // be represented on the wire anyway.
        Self {
            max_payload: max_payload.min(i32::MAX as usize),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Encodes one complete frame. The result is shared between recipients
    /// and written with a single `write_all`.
    pub fn encode_frame(&self, message: &Message) -> Result<Bytes, FrameError> {
        let mut dst = BytesMut::with_capacity(HEADER_LEN + message.payload_len());
        self.encode_into(message, &mut dst)?;
        Ok(dst.freeze())
    }

    fn encode_into(&self, message: &Message, dst: &mut BytesMut) -> Result<(), FrameError> {
        let payload = message.payload();
        if payload.len() > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_payload,
            });
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_i32(message.kind().tag());
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        dst.put_i32(payload.len() as i32);
        dst.put_slice(payload);
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < TAG_LEN {
            return Ok(None);
        }

        // Reject garbage before waiting on a length that means nothing.
        let kind = MessageKind::try_from(i32::from_be_bytes([src[0], src[1], src[2], src[3]]))?;

        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let declared = i32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        let len = usize::try_from(declared).map_err(|_| FrameError::NegativeLength(declared))?;
        if len > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                len,
                max: self.max_payload,
            });
        }

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Message::from_payload(kind, payload).map(Some)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::Truncated {
                buffered: src.len(),
            }),
        }
    }
}

impl<'a> Encoder<&'a Message> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &'a Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode_into(item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: i32, declared: i32, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_i32(tag);
        buf.put_i32(declared);
        buf.put_slice(payload);
        buf
    }

    fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Result<Vec<Message>, FrameError> {
        let mut out = Vec::new();
        while let Some(message) = codec.decode_eof(buf)? {
            out.push(message);
        }
        Ok(out)
    }

    #[test]
    fn text_roundtrip() {
        let mut codec = FrameCodec::new();
        let encoded = codec.encode_frame(&Message::text("hello")).unwrap();
        assert_eq!(&encoded[..], &frame(1, 5, b"hello")[..]);

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = codec.decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(Message::text("hello")));
        assert!(buf.is_empty());
    }

    #[test]
    fn image_roundtrip_preserves_every_byte() {
        let bytes: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(&Message::image(bytes.clone()), &mut buf).unwrap();

        match codec.decode(&mut buf).unwrap() {
            Some(Message::Image(decoded)) => assert_eq!(&decoded[..], &bytes[..]),
            other => panic!("expected image, got {other:?}"),
        }
    }

    #[test]
    fn empty_payloads_are_valid() {
        let mut codec = FrameCodec::new();
        let mut buf = frame(1, 0, b"");
        buf.extend_from_slice(&frame(2, 0, b""));
        let decoded = decode_all(&mut codec, &mut buf).unwrap();
        assert_eq!(decoded, vec![Message::text(""), Message::image(Vec::<u8>::new())]);
    }

    #[test]
    fn waits_for_complete_frame() {
        let mut codec = FrameCodec::new();
        let full = frame(1, 5, b"hello");
        let mut buf = BytesMut::new();

        for byte in &full[..full.len() - 1] {
            buf.put_u8(*byte);
            assert_eq!(codec.decode(&mut buf).unwrap(), None);
        }
        buf.put_u8(full[full.len() - 1]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::text("hello")));
    }

    #[test]
    fn payload_short_by_one_byte_is_truncation() {
        let mut codec = FrameCodec::new();
        let mut buf = frame(2, 10, &[7u8; 9]);
        let err = decode_all(&mut codec, &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { buffered: 17 }));
        assert!(err.is_protocol());
    }

    #[test]
    fn header_only_at_eof_is_truncation() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 0, 0][..]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { buffered: 6 }));
    }

    #[test]
    fn clean_eof_between_frames_ends_stream() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn unknown_tag_fails_before_length_arrives() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 3][..]);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::UnknownType(3))));
    }

    #[test]
    fn negative_length_is_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = frame(2, -4, b"");
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::NegativeLength(-4))));
    }

    #[test]
    fn oversized_declared_length_is_rejected_without_payload() {
        let mut codec = FrameCodec::with_max_payload(1024);
        let mut buf = frame(2, 1025, b"");
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { len: 1025, max: 1024 }));
    }

    #[test]
    fn oversized_message_is_not_encoded() {
        let codec = FrameCodec::with_max_payload(4);
        let err = codec.encode_frame(&Message::text("hello")).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { len: 5, max: 4 }));
    }

    #[test]
    fn invalid_utf8_text_is_a_protocol_error() {
        let mut codec = FrameCodec::new();
        let mut buf = frame(1, 2, &[0xc3, 0x28]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::InvalidText(_)));
    }

    #[test]
    fn consecutive_frames_decode_in_order() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let messages = vec![
            Message::text("first"),
            Message::image(vec![1u8, 2, 3]),
            Message::text("third"),
        ];
        for message in &messages {
            codec.encode(message, &mut buf).unwrap();
        }
        assert_eq!(decode_all(&mut codec, &mut buf).unwrap(), messages);
    }

    #[test]
    fn io_errors_are_not_protocol_errors() {
        let err = FrameError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(!err.is_protocol());
    }
}
