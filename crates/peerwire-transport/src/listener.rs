use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::stream::PeerStream;

/// A bound listener for either transport kind.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(crate::uds::UnixDomainSocket),
}

impl Listener {
    /// Bind a listener on `endpoint`.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let listener =
                    TcpListener::bind(addr)
                        .await
                        .map_err(|source| TransportError::Bind {
                            addr: addr.clone(),
                            source,
                        })?;
                info!(addr = %addr, "listening on tcp");
                Ok(Self::Tcp(listener))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Self::Unix(crate::uds::UnixDomainSocket::bind(path)?)),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(TransportError::Unsupported(endpoint.to_string())),
        }
    }

    /// Accept the next connection, returning the stream and a peer label for logs.
    pub async fn accept(&self) -> Result<(PeerStream, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept().await.map_err(TransportError::Accept)?;
                debug!(peer = %addr, "accepted tcp connection");
                Ok((PeerStream::from_tcp(stream), format!("tcp://{addr}")))
            }
            #[cfg(unix)]
            Self::Unix(listener) => {
                let stream = listener.accept().await?;
                let label = stream.peer_label();
                Ok((stream, label))
            }
        }
    }

    /// The endpoint this listener is actually bound to.
    ///
    /// For TCP this reflects the OS-assigned port when binding to port 0.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match self {
            Self::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            #[cfg(unix)]
            Self::Unix(listener) => Ok(Endpoint::Unix(listener.path().to_path_buf())),
        }
    }
}

/// Dial `endpoint`.
pub async fn connect(endpoint: &Endpoint) -> Result<PeerStream> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|source| TransportError::Connect {
                    addr: addr.clone(),
                    source,
                })?;
            debug!(addr = %addr, "connected over tcp");
            Ok(PeerStream::from_tcp(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => crate::uds::UnixDomainSocket::connect(path).await,
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(TransportError::Unsupported(endpoint.to_string())),
    }
}
