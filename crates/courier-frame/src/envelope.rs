use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;
const KIND_ERROR: u8 = 2;

/// call_id (8) + kind (1).
const FIXED_HEADER: usize = 9;

/// What an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// A call to `operation_id`, sent by a client.
    Request { operation_id: u32 },
    /// A successful result, echoed back with the request's call id.
    Response,
    /// A terminal failure for the call (unknown operation, handler error).
    Error,
}

impl EnvelopeKind {
    fn code(self) -> u8 {
        match self {
            EnvelopeKind::Request { .. } => KIND_REQUEST,
            EnvelopeKind::Response => KIND_RESPONSE,
            EnvelopeKind::Error => KIND_ERROR,
        }
    }
}

/// The decoded payload of one frame.
///
/// Wire layout (big-endian):
/// ```text
/// ┌─────────────┬──────────┬────────────────────────────┬──────────┐
/// │ call_id (8) │ kind (1) │ operation_id (4, REQUEST)  │ body ... │
/// └─────────────┴──────────┴────────────────────────────┴──────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub call_id: u64,
    pub kind: EnvelopeKind,
    pub body: Bytes,
}

impl Envelope {
    pub fn request(call_id: u64, operation_id: u32, body: impl Into<Bytes>) -> Self {
        Self {
            call_id,
            kind: EnvelopeKind::Request { operation_id },
            body: body.into(),
        }
    }

    pub fn response(call_id: u64, body: impl Into<Bytes>) -> Self {
        Self {
            call_id,
            kind: EnvelopeKind::Response,
            body: body.into(),
        }
    }

    pub fn error(call_id: u64, body: impl Into<Bytes>) -> Self {
        Self {
            call_id,
            kind: EnvelopeKind::Error,
            body: body.into(),
        }
    }

    /// The operation id, for requests.
    pub fn operation_id(&self) -> Option<u32> {
        match self.kind {
            EnvelopeKind::Request { operation_id } => Some(operation_id),
            _ => None,
        }
    }

    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        let op_len = match self.kind {
            EnvelopeKind::Request { .. } => 4,
            _ => 0,
        };
        FIXED_HEADER + op_len + self.body.len()
    }

    /// Append the encoded envelope to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u64(self.call_id);
        dst.put_u8(self.kind.code());
        if let EnvelopeKind::Request { operation_id } = self.kind {
            dst.put_u32(operation_id);
        }
        dst.put_slice(&self.body);
    }

    /// Encode into a new buffer, ready to be used as a frame payload.
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut dst);
        dst.freeze()
    }

    /// Decode an envelope from a frame payload without copying the body.
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.len() < FIXED_HEADER {
            return Err(FrameError::MalformedFrame(format!(
                "envelope too short ({} bytes, need at least {FIXED_HEADER})",
                payload.len()
            )));
        }

        let call_id = payload.get_u64();
        let kind = match payload.get_u8() {
            KIND_REQUEST => {
                if payload.len() < 4 {
                    return Err(FrameError::MalformedFrame(
                        "request envelope missing operation id".to_string(),
                    ));
                }
                EnvelopeKind::Request {
                    operation_id: payload.get_u32(),
                }
            }
            KIND_RESPONSE => EnvelopeKind::Response,
            KIND_ERROR => EnvelopeKind::Error,
            other => {
                return Err(FrameError::MalformedFrame(format!(
                    "unknown envelope kind {other}"
                )))
            }
        };

        Ok(Self {
            call_id,
            kind,
            body: payload,
        })
    }
}
