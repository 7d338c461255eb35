//! Pluggable payload serialization.
//!
//! The runtime only moves opaque bytes; a [`PayloadCodec`] turns call
//! arguments and results into those bytes and back.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Payload serialization failure.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(#[source] BoxError),

    #[error("decode failed: {0}")]
    Decode(#[source] BoxError),
}

/// Serializes call arguments and results.
pub trait PayloadCodec: Send + Sync + 'static {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Serialize a value.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError>;

    /// Deserialize a value.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// JSON payloads via `serde_json`. The default codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|err| CodecError::Encode(Box::new(err)))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|err| CodecError::Decode(Box::new(err)))
    }
}

/// MessagePack payloads via `rmp-serde`, with struct fields encoded by name.
#[cfg(feature = "msgpack")]
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackCodec;

#[cfg(feature = "msgpack")]
impl PayloadCodec for MsgPackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
        rmp_serde::to_vec_named(value)
            .map(Bytes::from)
            .map_err(|err| CodecError::Encode(Box::new(err)))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        rmp_serde::from_slice(bytes).map_err(|err| CodecError::Decode(Box::new(err)))
    }
}
