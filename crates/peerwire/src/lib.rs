//! Symmetric peer-to-peer RPC over checksummed frames.
//!
//! peerwire lets both ends of one stream call each other: a client dials a
//! server, and the server can call services the client registered over the
//! very same connection.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP and Unix-domain-socket endpoints, listeners and streams
//! - [`frame`]: The checksummed frame format and the message envelope
//! - [`peer`]: Connections, call correlation, service dispatch, client and
//!   server roles (behind `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use peerwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use peerwire_frame::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use peerwire_peer::*;
}
