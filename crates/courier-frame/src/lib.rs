//! Length-prefixed framing and call envelopes for courier.
//!
//! Every message on the wire is a frame:
//! - A 4-byte big-endian payload length
//! - The payload itself, bounded by a configured maximum
//!
//! Each payload carries one [`Envelope`]: a call id, a kind
//! (request/response/error), the operation id for requests, and an opaque body.
//! Partial reads are absorbed by [`FrameDecoder`]; callers only ever see
//! complete frames.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod operation;
pub mod reader;
#[cfg(feature = "async")]
pub mod tokio_codec;
pub mod writer;

pub use codec::{
    decode_frame, encode, encode_frame, Frame, FrameConfig, FrameDecoder, Frames,
    DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use envelope::{Envelope, EnvelopeKind};
pub use error::{FrameError, Result};
pub use operation::{is_reserved, LIST_OPERATIONS, RESERVED_OPERATION_START};
pub use reader::FrameReader;
#[cfg(feature = "async")]
pub use tokio_codec::CourierCodec;
pub use writer::FrameWriter;
