use std::time::Duration;

use crate::codec::CodecError;

/// Errors surfaced to callers of the peer API.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The connection is closed, or closed while the call was waiting.
    #[error("connection closed")]
    ClosedConnection,

    /// The remote side answered with an error response.
    #[error("remote error: {0}")]
    Remote(String),

    /// No response arrived within the configured call timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The service name cannot be sent (empty, or longer than 65535 bytes).
    #[error("invalid service name {0:?}")]
    InvalidService(String),

    /// The call registry has no room for another outstanding call.
    #[error("too many pending calls (max {0})")]
    TooManyPendingCalls(usize),

    /// The outbound queue is full and the caller asked not to wait.
    #[error("outbound queue full")]
    Backpressure,

    /// Payload serialization error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] peerwire_frame::FrameError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] peerwire_transport::TransportError),
}

impl RpcError {
    /// True when the failure means the connection is gone and a retry needs a new one.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ClosedConnection | Self::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
