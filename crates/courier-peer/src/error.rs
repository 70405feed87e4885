use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use courier_frame::FrameError;
use courier_transport::TransportError;
use serde::{Deserialize, Serialize};

/// Errors surfaced by sessions, servers, and the correlation table.
#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    /// Frame-level error. `FrameTooLarge` and `MalformedFrame` are connection-fatal.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Transport-level error other than an occupied endpoint.
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// Another daemon already serves this endpoint.
    #[error("address already in use: {}", path.display())]
    AddressInUse { path: PathBuf },

    /// The two sides speak incompatible protocol versions.
    #[error("incompatible protocol: local {local}, remote {remote}")]
    IncompatibleProtocol { local: String, remote: String },

    /// Handshake failed for a reason other than version mismatch.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A call with this id is already pending.
    #[error("call id {0} is already pending")]
    DuplicateCallId(u64),

    /// An operation with this id is already registered.
    #[error("operation {0} is already registered")]
    DuplicateOperation(u32),

    /// The operation id falls in the reserved range.
    #[error("operation id {0:#010x} is reserved")]
    ReservedOperation(u32),

    /// The call did not resolve before its deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The connection carrying the call went away.
    #[error("connection lost")]
    ConnectionLost,

    /// Too many calls queued, either for a reconnect or for the writer.
    #[error("too many calls queued (limit {0})")]
    Overloaded(usize),

    /// The call was cancelled before a response arrived.
    #[error("call cancelled")]
    Cancelled,

    /// The session was closed.
    #[error("session closed")]
    SessionClosed,

    /// The daemon answered with an ERROR envelope.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// OS-level error outside the transport (thread spawn, clock).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CourierError {
    /// Whether a fresh call may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CourierError::Timeout(_)
                | CourierError::ConnectionLost
                | CourierError::Overloaded(_)
                | CourierError::DuplicateCallId(_)
        )
    }

    /// Remote error code, if the daemon produced this error.
    pub fn remote_code(&self) -> Option<ErrorCode> {
        match self {
            CourierError::Remote(remote) => Some(remote.code),
            _ => None,
        }
    }
}

impl From<TransportError> for CourierError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::AddressInUse { path } => CourierError::AddressInUse { path },
            other => CourierError::Transport(other),
        }
    }
}

impl From<RemoteError> for CourierError {
    fn from(err: RemoteError) -> Self {
        CourierError::Remote(err)
    }
}

pub type Result<T> = std::result::Result<T, CourierError>;

/// Machine-readable reason carried in an ERROR envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownOperation,
    Application,
    HandlerPanicked,
    MalformedRequest,
    ShuttingDown,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UnknownOperation => "unknown_operation",
            ErrorCode::Application => "application",
            ErrorCode::HandlerPanicked => "handler_panicked",
            ErrorCode::MalformedRequest => "malformed_request",
            ErrorCode::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of an ERROR envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unknown_operation(operation_id: u32) -> Self {
        Self::new(
            ErrorCode::UnknownOperation,
            format!("operation {operation_id} is not registered"),
        )
    }

    pub fn shutting_down() -> Self {
        Self::new(ErrorCode::ShuttingDown, "daemon is shutting down")
    }

    /// Encode as an ERROR envelope body.
    pub fn to_body(&self) -> Bytes {
        match serde_json::to_vec(self) {
            Ok(json) => Bytes::from(json),
            Err(_) => Bytes::from(self.message.clone()),
        }
    }

    /// Decode an ERROR envelope body.
    ///
    /// Bodies that are not a JSON `RemoteError` are kept verbatim as an
    /// application error message.
    pub fn from_body(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_else(|_| {
            Self::new(
                ErrorCode::Application,
                String::from_utf8_lossy(body).into_owned(),
            )
        })
    }
}

/// Error returned by a handler; becomes an ERROR envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    code: ErrorCode,
    message: String,
}

impl HandlerError {
    /// Application-level failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Application,
            message: message.into(),
        }
    }

    /// The request body could not be understood.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::MalformedRequest,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::malformed(err.to_string())
    }
}

impl From<HandlerError> for RemoteError {
    fn from(err: HandlerError) -> Self {
        RemoteError::new(err.code, err.message)
    }
}
