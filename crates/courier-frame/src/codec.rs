use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::{FrameError, Result};

/// Frame header: a single big-endian `u32` payload length.
pub const HEADER_SIZE: usize = 4;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// One length-delimited message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The message payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// The declared length of this frame, as written in its header.
    pub fn length(&self) -> u32 {
        self.payload.len() as u32
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a payload into the wire format, appending to `dst`.
///
/// Wire format:
/// ```text
/// ┌──────────────┬─────────────────┐
/// │ Length       │ Payload         │
/// │ (4B BE)      │ (Length bytes)  │
/// └──────────────┴─────────────────┘
/// ```
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::FrameTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Encode a payload into a freshly allocated frame.
pub fn encode(payload: &[u8]) -> Result<Bytes> {
    let mut dst = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    encode_frame(payload, &mut dst)?;
    Ok(dst.freeze())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer. An oversized length
/// is rejected as soon as the header is visible, before any payload arrives.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&src[..HEADER_SIZE]);
    let payload_len = u32::from_be_bytes(header) as usize;

    if payload_len > max_payload {
        debug!(size = payload_len, max = max_payload, "rejecting oversized frame");
        return Err(FrameError::FrameTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame { payload }))
}

/// Incremental, push-style frame decoder.
///
/// Bytes are fed in whatever chunks the transport delivers; complete frames
/// are pulled out as they become available. One decoder belongs to exactly one
/// connection: its buffered state is meaningless on any other stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_payload: usize,
    failed: bool,
}

impl FrameDecoder {
    /// Create a decoder that rejects payloads above `max_payload` bytes.
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_payload,
            failed: false,
        }
    }

    /// Append bytes received from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pull the next complete frame, if one is buffered.
    ///
    /// Once an error has been returned, every later call returns
    /// `MalformedFrame`: the stream is no longer frame-aligned.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.failed {
            return Err(FrameError::MalformedFrame(
                "decoder already failed on this connection".to_string(),
            ));
        }
        match decode_frame(&mut self.buf, self.max_payload) {
            Ok(frame) => Ok(frame),
            Err(err) => {
                self.failed = true;
                Err(err)
            }
        }
    }

    /// Lazily iterate over every complete frame currently buffered.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames {
            decoder: self,
            done: false,
        }
    }

    /// Signal end of stream.
    ///
    /// Succeeds only if the stream ended exactly on a frame boundary.
    pub fn finish(&self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(FrameError::MalformedFrame(format!(
                "stream ended with {} bytes of an incomplete frame",
                self.buf.len()
            )))
        }
    }

    /// Number of bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Update maximum payload size for subsequent frames.
    pub fn set_max_payload_size(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    /// Current maximum payload size.
    pub fn max_payload_size(&self) -> usize {
        self.max_payload
    }
}

/// Iterator returned by [`FrameDecoder::frames`].
///
/// Yields `Ok(frame)` for each complete frame, then stops. A decode error is
/// yielded once and ends the iteration.
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
    done: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.decoder.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
