//! Local transport for courier.
//!
//! A daemon binds a filesystem endpoint and clients connect to it:
//! - Unix domain sockets (Linux/macOS)
//!
//! This is the lowest layer of courier. Framing, correlation and dispatch
//! all build on the [`IpcStream`] type provided here.

pub mod error;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use traits::IpcStream;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
