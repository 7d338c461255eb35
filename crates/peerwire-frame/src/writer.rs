use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::codec::{encode_frame, Frame, FrameConfig, FrameKind};
use crate::error::{FrameError, Result};
use crate::message::Message;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames to any `AsyncWrite` stream.
///
/// Each frame is encoded into one buffer and written with a single
/// `write_all`, so a frame is never split by another writer's bytes as long
/// as only one task owns the writer.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: AsyncWrite + Unpin> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write a complete frame and flush.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.send(frame.kind, frame.payload.as_ref()).await
    }

    /// Frame and send a message envelope.
    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        self.send(message.action.into(), &message.encode()).await
    }

    /// Send an empty heartbeat frame.
    pub async fn send_heartbeat(&mut self) -> Result<()> {
        self.send(FrameKind::Heartbeat, &[]).await
    }

    /// Encode and send a payload with the given frame type.
    pub async fn send(&mut self, kind: FrameKind, payload: &[u8]) -> Result<()> {
        if payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }

        self.buf.clear();
        encode_frame(kind, payload, &mut self.buf)?;

        self.inner.write_all(&self.buf).await.map_err(map_write)?;
        self.flush().await
    }

    /// Flush the underlying stream.
    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await.map_err(map_write)
    }

    /// Shut down the write side of the underlying stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await.map_err(FrameError::Io)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

fn map_write(err: std::io::Error) -> FrameError {
    match err.kind() {
        std::io::ErrorKind::WriteZero | std::io::ErrorKind::BrokenPipe => {
            FrameError::ConnectionClosed
        }
        _ => FrameError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use bytes::Bytes;

    use super::*;
    use crate::codec::{decode_frame, HEADER_SIZE};
    use crate::reader::FrameReader;

    fn written(writer: FrameWriter<Cursor<Vec<u8>>>) -> BytesMut {
        BytesMut::from(writer.into_inner().into_inner().as_slice())
    }

    #[tokio::test]
    async fn write_single_frame() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.send(FrameKind::Request, b"hello").await.unwrap();

        let mut wire = written(writer);
        let frame = decode_frame(&mut wire, usize::MAX).unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Request);
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn write_message_and_heartbeat() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let msg = Message::response(5, Bytes::from_static(b"ok"));
        writer.send_message(&msg).await.unwrap();
        writer.send_heartbeat().await.unwrap();

        let mut wire = written(writer);
        let f1 = decode_frame(&mut wire, usize::MAX).unwrap().unwrap();
        let f2 = decode_frame(&mut wire, usize::MAX).unwrap().unwrap();

        assert_eq!(f1.kind, FrameKind::Response);
        assert_eq!(f1.into_message().unwrap(), Some(msg));
        assert_eq!(f2.kind, FrameKind::Heartbeat);
        assert_eq!(f2.wire_size(), HEADER_SIZE);
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn payload_too_large_rejected() {
        let cfg = FrameConfig {
            max_payload_size: 4,
        };
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::<u8>::new()), cfg);

        let err = writer
            .send(FrameKind::Request, b"oversized")
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
        assert!(written(writer).is_empty());
    }

    #[tokio::test]
    async fn write_frame_method() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let frame = Frame::new(FrameKind::Response, "abc");
        writer.write_frame(&frame).await.unwrap();

        let mut wire = written(writer);
        let decoded = decode_frame(&mut wire, usize::MAX).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn connection_closed_when_write_returns_zero() {
        let mut writer = FrameWriter::new(ZeroWriter);
        let err = writer.send(FrameKind::Request, b"x").await.unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[tokio::test]
    async fn written_bytes_decode_through_reader() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.send(FrameKind::Request, b"z").await.unwrap();
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame.kind, FrameKind::Request);
        assert_eq!(frame.payload.as_ref(), b"z");
    }

    struct ZeroWriter;

    impl AsyncWrite for ZeroWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(0))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }
}
