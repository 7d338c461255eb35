use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::TransportError;

/// Address of a peer listener.
///
/// Accepted textual forms:
/// - `tcp://127.0.0.1:1600` or a bare `127.0.0.1:1600`
/// - `unix:///run/app.sock` or a bare absolute path `/run/app.sock`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A TCP `host:port` address.
    Tcp(String),
    /// A filesystem-path Unix domain socket.
    Unix(PathBuf),
}

impl Endpoint {
    /// Create a TCP endpoint.
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::Tcp(addr.into())
    }

    /// Create a Unix domain socket endpoint.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix(path.into())
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Unix(_) => "unix-domain-socket",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(addr) = s.strip_prefix("tcp://") {
            return parse_tcp(addr, s);
        }
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(TransportError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') || s.starts_with("./") {
            return Ok(Self::Unix(PathBuf::from(s)));
        }
        parse_tcp(s, s)
    }
}

fn parse_tcp(addr: &str, original: &str) -> Result<Endpoint, TransportError> {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(Endpoint::Tcp(addr.to_string()))
        }
        _ => Err(TransportError::InvalidEndpoint(original.to_string())),
    }
}
