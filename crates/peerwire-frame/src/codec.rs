use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::message::{Action, Message};

/// Frame header: magic (4) + length (4) + type (1) + reserved (1) + crc (4) = 14 bytes.
pub const HEADER_SIZE: usize = 14;

/// Magic bytes: "BAB@".
pub const MAGIC: [u8; 4] = *b"BAB@";

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Frame type code carried in byte 8 of the header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Keep-alive frame with no payload.
    Heartbeat = 0,
    /// Carries a request envelope.
    Request = 1,
    /// Carries a response envelope.
    Response = 2,
}

impl FrameKind {
    /// Decode a wire type code.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Heartbeat),
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            _ => None,
        }
    }

    /// The wire type code.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable name, used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

impl From<Action> for FrameKind {
    fn from(action: Action) -> Self {
        match action {
            Action::Request => Self::Request,
            Action::Response => Self::Response,
        }
    }
}

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub length: u32,
    pub crc: u32,
}

impl FrameHeader {
    /// Parse and validate a raw header.
    pub fn parse(raw: &[u8; HEADER_SIZE]) -> Result<Self> {
        if raw[0..4] != MAGIC {
            return Err(FrameError::BadMagic);
        }
        let mut rest = &raw[4..];
        let length = rest.get_u32();
        let code = rest.get_u8();
        let _reserved = rest.get_u8();
        let crc = rest.get_u32();
        let kind = FrameKind::from_u8(code).ok_or(FrameError::UnknownFrameType(code))?;
        Ok(Self { kind, length, crc })
    }

    /// Payload length as `usize`.
    pub fn payload_len(&self) -> usize {
        self.length as usize
    }
}

/// One wire-level unit: frame type plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The frame type.
    pub kind: FrameKind,
    /// The frame payload (an encoded envelope, empty for heartbeats).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// An empty heartbeat frame.
    pub fn heartbeat() -> Self {
        Self::new(FrameKind::Heartbeat, Bytes::new())
    }

    /// Wrap an envelope in a frame whose type follows the message action.
    pub fn from_message(message: &Message) -> Self {
        Self::new(message.action.into(), message.encode())
    }

    /// Parse the envelope carried by this frame.
    ///
    /// Returns `Ok(None)` for heartbeats.
    pub fn into_message(self) -> Result<Option<Message>> {
        match self.kind {
            FrameKind::Heartbeat => Ok(None),
            FrameKind::Request | FrameKind::Response => Message::decode(self.payload).map(Some),
        }
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// CRC-32 (IEEE) of a payload; zero for an empty payload.
pub fn checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        0
    } else {
        crc32fast::hash(payload)
    }
}

/// Encode a frame into the wire format.
///
/// Wire format (big-endian):
/// ```text
/// ┌────────────┬────────────┬──────┬──────────┬────────────┬──────────────────┐
/// │ Magic (4B) │ Length(4B) │ Type │ Reserved │ CRC-32(4B) │ Payload          │
/// │ "BAB@"     │            │ (1B) │ (1B)     │ IEEE       │ (Length bytes)   │
/// └────────────┴────────────┴──────┴──────────┴────────────┴──────────────────┘
/// ```
pub fn encode_frame(kind: FrameKind, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32(payload.len() as u32);
    dst.put_u8(kind.as_u8());
    dst.put_u8(0);
    dst.put_u32(checksum(payload));
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(&src[..HEADER_SIZE]);
    let header = FrameHeader::parse(&raw)?;

    if header.payload_len() > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: header.payload_len(),
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + header.payload_len();
    if src.len() < total {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(header.payload_len()).freeze();
    verify_checksum(&header, &payload)?;

    Ok(Some(Frame {
        kind: header.kind,
        payload,
    }))
}

pub(crate) fn verify_checksum(header: &FrameHeader, payload: &[u8]) -> Result<()> {
    let actual = checksum(payload);
    if actual != header.crc {
        return Err(FrameError::CrcMismatch {
            expected: header.crc,
            actual,
        });
    }
    Ok(())
}

/// Configuration for frame reading and writing.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(frames: &[(FrameKind, &[u8])]) -> BytesMut {
        let mut out = BytesMut::new();
        for (kind, payload) in frames {
            encode_frame(*kind, payload, &mut out).unwrap();
        }
        out
    }

    fn next(src: &mut BytesMut) -> Result<Option<Frame>> {
        decode_frame(src, DEFAULT_MAX_PAYLOAD)
    }

    #[test]
    fn test_every_kind_survives_encoding() {
        let cases: [(FrameKind, &[u8]); 3] = [
            (FrameKind::Heartbeat, &b""[..]),
            (FrameKind::Request, &b"hello, peerwire!"[..]),
            (FrameKind::Response, &[0u8, 1, 2, 255]),
        ];
        for (kind, payload) in cases {
            let mut src = wire(&[(kind, payload)]);
            assert_eq!(src.len(), HEADER_SIZE + payload.len());

            let frame = next(&mut src).unwrap().expect("complete frame");
            assert_eq!((frame.kind, frame.payload.as_ref()), (kind, payload));
            assert!(src.is_empty());
        }
    }

    #[test]
    fn test_header_layout() {
        let src = wire(&[(FrameKind::Response, &b"abc"[..])]);

        assert_eq!(&src[0..4], b"BAB@");
        assert_eq!(&src[4..8], &3u32.to_be_bytes());
        assert_eq!(src[8], 2);
        assert_eq!(src[9], 0);
        assert_eq!(&src[10..14], &crc32fast::hash(b"abc").to_be_bytes());
        assert_eq!(&src[14..], b"abc");
    }

    #[test]
    fn test_empty_payload_has_zero_crc() {
        let src = wire(&[(FrameKind::Heartbeat, &b""[..])]);
        assert_eq!(&src[10..14], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_partial_input_waits_for_more() {
        let mut header_only = BytesMut::from(&b"BAB@\x00"[..]);
        assert!(next(&mut header_only).unwrap().is_none());

        let mut cut = wire(&[(FrameKind::Request, &b"hello"[..])]);
        cut.truncate(HEADER_SIZE + 2);
        assert!(next(&mut cut).unwrap().is_none());
        assert_eq!(cut.len(), HEADER_SIZE + 2, "partial input must not be consumed");
    }

    #[test]
    fn test_bad_magic_and_unknown_type() {
        let mut junk = BytesMut::from(&[0xFFu8; HEADER_SIZE][..]);
        assert!(matches!(next(&mut junk), Err(FrameError::BadMagic)));

        let mut odd = wire(&[(FrameKind::Request, &b"x"[..])]);
        odd[8] = 7;
        assert!(matches!(next(&mut odd), Err(FrameError::UnknownFrameType(7))));
    }

    #[test]
    fn test_reserved_byte_is_ignored() {
        let mut src = wire(&[(FrameKind::Request, &b"x"[..])]);
        src[9] = 0xAA;
        let frame = next(&mut src).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"x");
    }

    #[test]
    fn test_corrupting_any_payload_byte_fails_crc() {
        let clean = wire(&[(FrameKind::Request, &b"integrity matters"[..])]);

        for i in HEADER_SIZE..clean.len() {
            let mut src = clean.clone();
            src[i] ^= 0x01;
            assert!(
                matches!(next(&mut src), Err(FrameError::CrcMismatch { .. })),
                "byte {i} corruption was not detected"
            );
        }
    }

    #[test]
    fn test_oversized_length_is_rejected_before_payload_arrives() {
        let mut src = BytesMut::new();
        src.put_slice(&MAGIC);
        src.put_u32(32 * 1024 * 1024);
        src.put_u8(FrameKind::Request.as_u8());
        src.put_u8(0);
        src.put_u32(0);

        let err = next(&mut src).unwrap_err();
        assert!(matches!(
            err,
            FrameError::PayloadTooLarge { size, .. } if size == 32 * 1024 * 1024
        ));
    }

    #[test]
    fn test_back_to_back_frames_decode_in_order() {
        let mut src = wire(&[
            (FrameKind::Request, &b"first"[..]),
            (FrameKind::Heartbeat, &b""[..]),
            (FrameKind::Response, &b"second"[..]),
        ]);

        let kinds: Vec<_> = std::iter::from_fn(|| next(&mut src).unwrap())
            .map(|frame| (frame.kind, frame.payload))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (FrameKind::Request, Bytes::from_static(b"first")),
                (FrameKind::Heartbeat, Bytes::new()),
                (FrameKind::Response, Bytes::from_static(b"second")),
            ]
        );
    }

    #[test]
    fn test_frame_message_conversion() {
        let msg = Message::request(9, "echo", Bytes::from_static(b"hi"));
        let frame = Frame::from_message(&msg);
        assert_eq!(frame.kind, FrameKind::Request);
        assert_eq!(frame.into_message().unwrap(), Some(msg));

        assert_eq!(Frame::heartbeat().into_message().unwrap(), None);
        assert_eq!(Frame::heartbeat().wire_size(), HEADER_SIZE);
    }
}
