//! The outer message envelope carried by request and response frames.
//!
//! Envelope layout (big-endian):
//! ```text
//! id u32 | action u8 | service_len u16 | service utf8
//!        | error_flag u8 | [error_len u32 | error utf8]
//!        | payload_len u32 | payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

const ACTION_REQUEST: u8 = 1;
const ACTION_RESPONSE: u8 = 2;

/// Whether a message asks for work or answers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Request,
    Response,
}

/// One logical request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Caller-assigned id correlating a response to its request.
    pub id: u32,
    pub action: Action,
    /// Target service; empty on responses.
    pub service: String,
    /// Serialized arguments (request) or result (response).
    pub payload: Bytes,
    /// Failure description; only meaningful on responses.
    pub error: Option<String>,
}

impl Message {
    /// Build a request for `service`.
    pub fn request(id: u32, service: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            action: Action::Request,
            service: service.into(),
            payload: payload.into(),
            error: None,
        }
    }

    /// Build a successful response.
    pub fn response(id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            action: Action::Response,
            service: String::new(),
            payload: payload.into(),
            error: None,
        }
    }

    /// Build a failed response.
    pub fn error_response(id: u32, error: impl Into<String>) -> Self {
        Self {
            id,
            action: Action::Response,
            service: String::new(),
            payload: Bytes::new(),
            error: Some(error.into()),
        }
    }

    /// True when this message reports a failed call.
    pub fn is_error(&self) -> bool {
        self.error.as_deref().is_some_and(|err| !err.is_empty())
    }

    /// Encoded size of the envelope in bytes.
    pub fn encoded_len(&self) -> usize {
        4 + 1
            + 2
            + self.service.len()
            + 1
            + self.error.as_ref().map_or(0, |err| 4 + err.len())
            + 4
            + self.payload.len()
    }

    /// Serialize the envelope.
    ///
    /// Service names longer than `u16::MAX` bytes are truncated at a char
    /// boundary; registration rejects such names before they reach the wire.
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        dst.put_u32(self.id);
        dst.put_u8(match self.action {
            Action::Request => ACTION_REQUEST,
            Action::Response => ACTION_RESPONSE,
        });

        let service = truncate_utf8(&self.service, u16::MAX as usize);
        dst.put_u16(service.len() as u16);
        dst.put_slice(service.as_bytes());

        match &self.error {
            Some(err) => {
                dst.put_u8(1);
                dst.put_u32(err.len() as u32);
                dst.put_slice(err.as_bytes());
            }
            None => dst.put_u8(0),
        }

        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
        dst.freeze()
    }

    /// Parse an envelope from a frame payload.
    pub fn decode(mut src: Bytes) -> Result<Self> {
        let id = take_u32(&mut src, "id")?;
        let action = match take_u8(&mut src, "action")? {
            ACTION_REQUEST => Action::Request,
            ACTION_RESPONSE => Action::Response,
            other => {
                return Err(FrameError::MalformedEnvelope(format!(
                    "unknown action {other}"
                )))
            }
        };

        let service_len = take_u16(&mut src, "service length")? as usize;
        let service = take_string(&mut src, service_len, "service")?;

        let error = match take_u8(&mut src, "error flag")? {
            0 => None,
            1 => {
                let len = take_u32(&mut src, "error length")? as usize;
                Some(take_string(&mut src, len, "error")?)
            }
            other => {
                return Err(FrameError::MalformedEnvelope(format!(
                    "invalid error flag {other}"
                )))
            }
        };

        let payload_len = take_u32(&mut src, "payload length")? as usize;
        let payload = take_bytes(&mut src, payload_len, "payload")?;

        if src.has_remaining() {
            return Err(FrameError::MalformedEnvelope(format!(
                "{} trailing bytes",
                src.remaining()
            )));
        }

        Ok(Self {
            id,
            action,
            service,
            payload,
            error,
        })
    }
}

fn truncated(field: &str) -> FrameError {
    FrameError::MalformedEnvelope(format!("truncated {field}"))
}

fn take_u8(src: &mut Bytes, field: &str) -> Result<u8> {
    if src.remaining() < 1 {
        return Err(truncated(field));
    }
    Ok(src.get_u8())
}

fn take_u16(src: &mut Bytes, field: &str) -> Result<u16> {
    if src.remaining() < 2 {
        return Err(truncated(field));
    }
    Ok(src.get_u16())
}

fn take_u32(src: &mut Bytes, field: &str) -> Result<u32> {
    if src.remaining() < 4 {
        return Err(truncated(field));
    }
    Ok(src.get_u32())
}

fn take_bytes(src: &mut Bytes, len: usize, field: &str) -> Result<Bytes> {
    if src.remaining() < len {
        return Err(truncated(field));
    }
    Ok(src.split_to(len))
}

fn take_string(src: &mut Bytes, len: usize, field: &str) -> Result<String> {
    let raw = take_bytes(src, len, field)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| FrameError::MalformedEnvelope(format!("{field} is not valid utf-8")))
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
