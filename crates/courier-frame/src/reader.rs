use std::io::{ErrorKind, Read};

use courier_transport::IpcStream;
use tracing::trace;

use crate::codec::{Frame, FrameConfig, FrameDecoder};
use crate::envelope::Envelope;
use crate::error::{FrameError, Result};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames from any `Read` stream.
///
/// Handles partial reads internally: callers always get complete frames.
pub struct FrameReader<T> {
    inner: T,
    decoder: FrameDecoder,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(config.max_payload_size),
            config,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF lands on a frame
    /// boundary, and `Err(FrameError::MalformedFrame)` when the stream ends in
    /// the middle of a frame.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                trace!(len = frame.payload.len(), "read frame");
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                self.decoder.finish()?;
                return Err(FrameError::ConnectionClosed);
            }

            self.decoder.extend(&chunk[..read]);
        }
    }

    /// Read the next frame and decode its envelope.
    pub fn read_envelope(&mut self) -> Result<Envelope> {
        let frame = self.read_frame()?;
        Envelope::decode(frame.payload)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame decoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
        self.decoder.set_max_payload_size(max_payload_size);
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<IpcStream> {
    /// Create a frame reader for `IpcStream` and apply read timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner.set_read_timeout(config.read_timeout)?;
        Ok(Self::with_config(inner, config))
    }

    /// Change the read timeout on the underlying stream.
    pub fn set_read_timeout(&mut self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout)?;
        self.config.read_timeout = timeout;
        Ok(())
    }
}
