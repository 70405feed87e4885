//! Call multiplexing over local IPC connections.
//!
//! Two roles share one wire protocol:
//!
//! - A client opens a [`Session`] and issues calls; many calls may be in
//!   flight on one connection and each resolves exactly once, with its
//!   response, a remote error, a timeout, cancellation, or connection loss.
//! - A daemon binds a [`Server`], registers handlers by operation id, and
//!   serves connections. Handlers run on a worker pool, so a slow call never
//!   blocks the connection it arrived on.
//!
//! ```no_run
//! use std::time::Duration;
//! use courier_peer::{CallContext, HandlerResult, Server, Session};
//!
//! # fn main() -> courier_peer::Result<()> {
//! let mut server = Server::listen("/tmp/echo.sock")?;
//! server.register(1, |_: &CallContext, body: bytes::Bytes| -> HandlerResult { Ok(body) })?;
//! let handle = server.handle();
//! let daemon = std::thread::spawn(move || server.serve());
//!
//! let session = Session::connect("/tmp/echo.sock")?;
//! let reply = session.call(1, &b"hello"[..], Duration::from_secs(1))?;
//! assert_eq!(&reply[..], b"hello");
//!
//! handle.shutdown();
//! # let _ = daemon.join();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod handshake;
mod pool;
pub mod registry;
pub mod server;
pub mod session;
#[cfg(test)]
mod test_support;
pub mod typed;

pub use config::{DuplicatePolicy, ReconnectPolicy, ServerConfig, SessionConfig};
pub use connection::{Connection, ConnectionState};
pub use correlation::{CompletionSlot, CorrelationTable};
pub use error::{CourierError, ErrorCode, HandlerError, RemoteError, Result};
pub use handshake::{
    handshake_client, handshake_client_with_config, handshake_server, handshake_server_with_config,
    HandshakeConfig, HandshakeRequest, HandshakeResponse, HandshakeResult,
};
pub use registry::{CallContext, DispatchRegistry, Handler, HandlerResult, OperationInfo};
pub use server::{Server, ServerHandle};
pub use session::{PendingReply, Session};
pub use typed::{decode_body, encode_body, Operation};
