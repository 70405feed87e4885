//! Call multiplexing between local clients and daemons.
//!
//! A client opens one connection to a daemon's Unix socket and issues many
//! concurrent calls over it; the daemon routes each call by operation id to a
//! registered handler and replies on the same connection.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix domain socket listener and connector
//! - [`frame`]: length-prefixed framing and the call envelope
//! - [`peer`]: client sessions, correlation, and daemon dispatch (behind `peer`)

pub use bytes::Bytes;

/// Re-export transport types.
pub mod transport {
    pub use courier_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use courier_frame::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use courier_peer::*;
}

#[cfg(feature = "peer")]
pub use courier_peer::{
    CallContext, CourierError, HandlerError, HandlerResult, Operation, Result, Server,
    ServerHandle, Session,
};

/// Version of this library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    #[test]
    fn version_matches_manifest() {
        assert_eq!(super::version(), env!("CARGO_PKG_VERSION"));
        assert!(!super::version().is_empty());
    }
}
