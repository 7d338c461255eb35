//! Symmetric RPC peers over a single duplex stream.
//!
//! Either end of a connection can issue calls and serve them at the same
//! time. A [`Connection`] runs the read, dispatch and write loops; a
//! [`CallRegistry`] matches responses to waiting callers; a
//! [`ServiceRegistry`] turns requests into handler invocations. [`Client`] and
//! [`Server`] compose these into the two peer roles, and every connection a
//! server accepts is exposed as a [`RemotePeer`] that can call back.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod server;
pub mod service;

mod router;

pub use client::Client;
#[cfg(feature = "msgpack")]
pub use codec::MsgPackCodec;
pub use codec::{CodecError, JsonCodec, PayloadCodec};
pub use config::{
    ClientConfig, ConnectionConfig, ServerConfig, DEFAULT_MAX_CONCURRENT_REQUESTS,
};
pub use connection::{
    Connection, ConnectionDriver, ConnectionHandler, ConnectionId, ConnectionState,
};
pub use error::{Result, RpcError};
pub use registry::{CallRegistry, PendingCall, DEFAULT_MAX_PENDING_CALLS};
pub use server::{RemotePeer, Server};
pub use service::{CallContext, DispatchError, ServiceHandler, ServiceRegistry};
