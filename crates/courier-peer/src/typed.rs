//! Typed request/response pairs layered over opaque bodies.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// A daemon operation with a fixed id and serde request/response types.
///
/// Both sides share the definition; bodies are JSON on the wire.
pub trait Operation: 'static {
    const ID: u32;
    const NAME: &'static str;
    type Request: Serialize + DeserializeOwned + Send + 'static;
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

pub fn encode_body<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}
