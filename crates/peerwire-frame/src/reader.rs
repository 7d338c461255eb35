use std::io::ErrorKind;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::codec::{verify_checksum, Frame, FrameConfig, FrameHeader, HEADER_SIZE};
use crate::error::{FrameError, Result};

/// Reads complete frames from any `AsyncRead` stream.
///
/// The fixed header is read first, so the payload buffer is allocated at
/// exactly the announced length and integrity is checked before anything
/// above this layer sees the bytes.
pub struct FrameReader<T> {
    inner: T,
    config: FrameConfig,
}

impl<T: AsyncRead + Unpin> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self { inner, config }
    }

    /// Read exactly one header.
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when the stream ends first.
    pub async fn read_header(&mut self) -> Result<FrameHeader> {
        let mut raw = [0u8; HEADER_SIZE];
        self.inner
            .read_exact(&mut raw)
            .await
            .map_err(map_short_read)?;
        FrameHeader::parse(&raw)
    }

    /// Read and verify the payload announced by `header`.
    pub async fn read_payload(&mut self, header: &FrameHeader) -> Result<Frame> {
        let len = header.payload_len();
        if len > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: len,
                max: self.config.max_payload_size,
            });
        }

        let mut payload = BytesMut::zeroed(len);
        if len > 0 {
            self.inner
                .read_exact(&mut payload)
                .await
                .map_err(map_short_read)?;
        }
        if let Err(err) = verify_checksum(header, &payload) {
            debug!(kind = header.kind.name(), len, error = %err, "rejecting corrupted frame");
            return Err(err);
        }
        trace!(kind = header.kind.name(), len, "frame read");

        Ok(Frame {
            kind: header.kind,
            payload: payload.freeze(),
        })
    }

    /// Read the next complete frame.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let header = self.read_header().await?;
        self.read_payload(&header).await
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

fn map_short_read(err: std::io::Error) -> FrameError {
    if err.kind() == ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(err)
    }
}
