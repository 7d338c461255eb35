//! Checksummed frame format and message envelope for peerwire.
//!
//! Every unit on the wire is a frame with a fixed 14-byte header:
//! - A 4-byte magic number (`"BAB@"`) for stream synchronization
//! - A 4-byte big-endian payload length
//! - A 1-byte frame type (heartbeat, request, response) and 1 reserved byte
//! - A 4-byte big-endian CRC-32 (IEEE) of the payload
//!
//! Request and response frames carry a [`Message`] envelope as payload.
//! Heartbeat frames carry nothing.

pub mod codec;
pub mod error;
pub mod message;
pub mod reader;
pub mod writer;

pub use codec::{
    checksum, decode_frame, encode_frame, Frame, FrameConfig, FrameHeader, FrameKind,
    DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MAGIC,
};
pub use error::{FrameError, Result};
pub use message::{Action, Message};
pub use reader::FrameReader;
pub use writer::FrameWriter;
