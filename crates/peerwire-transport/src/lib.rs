//! Async stream transport for peerwire.
//!
//! Provides a unified interface over the stream sockets peerwire runs on:
//! - TCP (`tcp://host:port`)
//! - Unix domain sockets (`unix:///path/to.sock`, Unix only)
//!
//! This is the lowest layer of peerwire. The RPC runtime only needs a duplex
//! byte stream, and everything above builds on the [`PeerStream`] type
//! provided here.

pub mod endpoint;
pub mod error;
pub mod listener;
pub mod stream;

#[cfg(unix)]
pub mod uds;

pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use listener::{connect, Listener};
pub use stream::PeerStream;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
