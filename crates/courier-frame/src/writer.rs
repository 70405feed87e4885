use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use courier_transport::IpcStream;

use crate::codec::{encode_frame, Frame, FrameConfig};
use crate::envelope::Envelope;
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames to any `Write` stream.
///
/// Each frame is encoded into one buffer and written in full before `send`
/// returns, so callers that serialize access to a writer never interleave
/// partial frames.
///
/// With `write_timeout` unset, `WouldBlock` is retried. With it set, a
/// `WouldBlock` or `TimedOut` write is the timeout firing and is returned as
/// an error; the frame may be partially written, so the stream is unusable.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write a complete frame (blocking).
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.send(frame.payload.as_ref())
    }

    /// Encode an envelope and send it as one frame.
    pub fn send_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        self.send(&envelope.encode())
    }

    /// Encode and send a payload.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.config.max_payload_size {
            return Err(FrameError::FrameTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }

        self.buf.clear();
        encode_frame(payload, &mut self.buf)?;

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if self.should_retry(&err) => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if self.should_retry(&err) => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    fn should_retry(&self, err: &std::io::Error) -> bool {
        err.kind() == ErrorKind::WouldBlock && self.config.write_timeout.is_none()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame encoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameWriter<IpcStream> {
    /// Create a frame writer for `IpcStream` and apply write timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner.set_write_timeout(config.write_timeout)?;
        Ok(Self::with_config(inner, config))
    }

    /// Change the write timeout on the underlying stream.
    pub fn set_write_timeout(&mut self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.inner.set_write_timeout(timeout)?;
        self.config.write_timeout = timeout;
        Ok(())
    }
}
