use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// A connected peer stream. Implements `AsyncRead + AsyncWrite`.
///
/// This is the fundamental I/O type returned by transport operations.
/// It wraps either a TCP stream or, on Unix, a Unix domain socket stream.
pub struct PeerStream {
    inner: PeerStreamInner,
}

enum PeerStreamInner {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl PeerStream {
    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        // Request/response traffic is latency-bound; small frames should not wait on Nagle.
        let _ = stream.set_nodelay(true);
        Self {
            inner: PeerStreamInner::Tcp(stream),
        }
    }

    #[cfg(unix)]
    pub(crate) fn from_unix(stream: tokio::net::UnixStream) -> Self {
        Self {
            inner: PeerStreamInner::Unix(stream),
        }
    }

    /// Human-readable description of the remote side, used in logs.
    pub fn peer_label(&self) -> String {
        match &self.inner {
            PeerStreamInner::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| format!("tcp://{addr}"))
                .unwrap_or_else(|_| "tcp://unknown".to_string()),
            #[cfg(unix)]
            PeerStreamInner::Unix(stream) => match stream.peer_cred() {
                Ok(cred) => match cred.pid() {
                    Some(pid) => format!("unix:pid={pid},uid={}", cred.uid()),
                    None => format!("unix:uid={}", cred.uid()),
                },
                Err(_) => "unix:unknown".to_string(),
            },
        }
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            PeerStreamInner::Tcp(_) => "tcp",
            #[cfg(unix)]
            PeerStreamInner::Unix(_) => "unix-domain-socket",
        }
    }
}

impl AsyncRead for PeerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            PeerStreamInner::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            PeerStreamInner::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            PeerStreamInner::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            PeerStreamInner::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            PeerStreamInner::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            PeerStreamInner::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            PeerStreamInner::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            PeerStreamInner::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStream")
            .field("type", &self.transport_name())
            .finish()
    }
}
