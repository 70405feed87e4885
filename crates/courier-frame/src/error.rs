use courier_transport::TransportError;

/// Errors that can occur during frame encoding/decoding.
///
/// `FrameTooLarge` and `MalformedFrame` are connection-fatal: once either is
/// returned, the byte stream can no longer be trusted to be frame-aligned.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A declared or submitted payload length exceeds the configured maximum.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Truncated or garbage input that cannot be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed cleanly on a frame boundary.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    /// Whether the stream must be abandoned after this error.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            FrameError::FrameTooLarge { .. } | FrameError::MalformedFrame(_)
        )
    }
}

impl From<TransportError> for FrameError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(io) | TransportError::Accept(io) => FrameError::Io(io),
            TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => {
                FrameError::Io(source)
            }
            other => FrameError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
