//! `tokio_util::codec` adapter for async callers.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_frame, encode_frame, Frame, DEFAULT_MAX_PAYLOAD};
use crate::envelope::Envelope;
use crate::error::FrameError;

/// Frame codec for `FramedRead`/`FramedWrite` over tokio streams.
#[derive(Debug, Clone)]
pub struct CourierCodec {
    max_payload_size: usize,
}

impl CourierCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}

impl Default for CourierCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for CourierCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src, self.max_payload_size)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::MalformedFrame(format!(
                "stream ended with {} bytes of an incomplete frame",
                src.len()
            ))),
        }
    }
}

impl Encoder<Bytes> for CourierCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_payload_size {
            return Err(FrameError::FrameTooLarge {
                size: item.len(),
                max: self.max_payload_size,
            });
        }
        encode_frame(&item, dst)
    }
}

impl Encoder<&Envelope> for CourierCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<Bytes>::encode(self, item.encode(), dst)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;

    #[tokio::test]
    async fn frames_cross_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(64);
        let mut sink = FramedWrite::new(client, CourierCodec::default());
        let mut stream = FramedRead::new(server, CourierCodec::default());

        let writer = tokio::spawn(async move {
            for i in 0..16u32 {
                sink.send(Bytes::from(format!("frame-{i}"))).await.unwrap();
            }
        });

        for i in 0..16u32 {
            let frame = stream.next().await.unwrap().unwrap();
            assert_eq!(frame.payload, Bytes::from(format!("frame-{i}")));
        }
        writer.await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn envelopes_encode_through_the_sink() {
        let (client, server) = tokio::io::duplex(256);
        let mut sink = FramedWrite::new(client, CourierCodec::default());
        let mut stream = FramedRead::new(server, CourierCodec::default());

        let env = Envelope::request(5, 2, &b"olleh"[..]);
        sink.send(&env).await.unwrap();

        let frame = stream.next().await.unwrap().unwrap();
        assert_eq!(Envelope::decode(frame.payload).unwrap(), env);
    }

    #[tokio::test]
    async fn truncated_stream_is_malformed() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut stream = FramedRead::new(server, CourierCodec::default());

        client.write_all(&[0, 0, 0, 10, b'a', b'b']).await.unwrap();
        drop(client);

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, FrameError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn oversize_encode_is_rejected() {
        let mut codec = CourierCodec::new(2);
        let mut dst = BytesMut::new();
        let err = Encoder::<Bytes>::encode(&mut codec, Bytes::from_static(b"abc"), &mut dst)
            .unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { size: 3, max: 2 }));
        assert!(dst.is_empty());
    }
}
