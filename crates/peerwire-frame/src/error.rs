/// Errors that can occur during frame encoding/decoding.
///
/// Every variant is fatal to the frame being processed; the connection that
/// produced it is expected to close.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected \"BAB@\")")]
    BadMagic,

    /// The frame header carries a type code outside {0, 1, 2}.
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    /// The payload checksum does not match the header.
    #[error("payload crc mismatch (header {expected:#010x}, computed {actual:#010x})")]
    CrcMismatch { expected: u32, actual: u32 },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The payload does not contain a well-formed message envelope.
    #[error("malformed message envelope: {0}")]
    MalformedEnvelope(String),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
