use std::time::Duration;

use peerwire_frame::{FrameConfig, DEFAULT_MAX_PAYLOAD};

use crate::registry::DEFAULT_MAX_PENDING_CALLS;

/// Default cap on inbound requests served at once per connection.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 256;

/// Per-connection pipeline settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for receiving the next frame; refreshed on every frame,
    /// heartbeats included. Default: 10 s.
    pub read_timeout: Duration,
    /// Emit a heartbeat after this long without outbound frames.
    /// `None` disables heartbeats. Default: 3 s.
    pub heartbeat_interval: Option<Duration>,
    /// Decoded messages buffered between the read and dispatch loops.
    pub inbound_capacity: usize,
    /// Frames buffered between `send` callers and the write loop.
    pub outbound_capacity: usize,
    /// Largest accepted frame payload in either direction.
    pub max_payload_size: usize,
    /// Inbound requests served at once on this connection. Requests beyond
    /// the limit are answered with an error response. Default: 256.
    pub max_concurrent_requests: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            heartbeat_interval: Some(Duration::from_secs(3)),
            inbound_capacity: 64,
            outbound_capacity: 64,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
        }
    }
}

impl ConnectionConfig {
    pub(crate) fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_payload_size: self.max_payload_size,
        }
    }
}

/// Client role settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    /// Upper bound on waiting for a response. `None` waits until the
    /// response arrives or the connection closes.
    pub call_timeout: Option<Duration>,
    /// Maximum outstanding calls on the client's registry.
    pub max_pending_calls: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            call_timeout: None,
            max_pending_calls: DEFAULT_MAX_PENDING_CALLS,
        }
    }
}

/// Server role settings, applied to every accepted connection.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub connection: ConnectionConfig,
    /// Timeout for calls the server issues back to a connected peer.
    pub call_timeout: Option<Duration>,
    /// Maximum outstanding server-initiated calls per accepted connection.
    pub max_pending_calls: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            call_timeout: None,
            max_pending_calls: DEFAULT_MAX_PENDING_CALLS,
        }
    }
}
