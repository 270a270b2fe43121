//! Client frame codec
//!
//! Every direction of a client connection is a sequence of frames:
//! a 16-bit big-endian payload size followed by the payload bytes. The
//! payload is the encoded message envelope. A zero size is a protocol
//! violation and terminates the connection.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::message::Envelope;

/// Size of the length prefix in bytes
pub const HEADER_LEN: usize = 2;

/// Largest payload expressible with the 16-bit length prefix
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum FrameError {
    /// A frame with a zero-length payload was received
    #[error("zero-size frame")]
    ZeroSize,

    /// A message did not fit into the 16-bit length prefix
    #[error("payload of {0} bytes exceeds the frame size limit")]
    Oversized(usize),

    /// The payload did not decode into a known message
    #[error("payload decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Length-prefixed codec carrying message envelopes
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Envelope;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>, FrameError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let size = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if size == 0 {
            return Err(FrameError::ZeroSize);
        }

        if buf.len() < HEADER_LEN + size {
            buf.reserve(HEADER_LEN + size - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let payload = buf.split_to(size);
        let envelope = Envelope::from_payload(&payload)?;
        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, envelope: Envelope, buf: &mut BytesMut) -> Result<(), FrameError> {
        let payload = envelope.to_payload();
        if payload.is_empty() {
            return Err(FrameError::ZeroSize);
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::Oversized(payload.len()));
        }

        buf.reserve(HEADER_LEN + payload.len());
        buf.put_u16(payload.len() as u16);
        buf.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::Body;

    fn roundtrip(body: Body) -> Envelope {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Envelope::from(body), &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_frame_roundtrip() {
        let body = Body::read(1, 2, 3, false);
        let decoded = roundtrip(body.clone());
        assert_eq!(decoded.body, Some(body));
    }

    #[test]
    fn test_size_prefix_is_big_endian() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Envelope::from(Body::bool_response(true)), &mut buf)
            .unwrap();
        let size = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        assert_eq!(size, buf.len() - HEADER_LEN);
    }

    #[test]
    fn test_u16_size_roundtrip() {
        for size in [0u16, 1, 255, 256, 65535] {
            let bytes = size.to_be_bytes();
            assert_eq!(u16::from_be_bytes(bytes), size);
        }
    }

    #[test]
    fn test_zero_size_frame_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[0u8, 0, 1, 2, 3][..]);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::ZeroSize)));
    }

    #[test]
    fn test_partial_frame_needs_more() {
        let mut codec = FrameCodec;
        let mut full = BytesMut::new();
        codec
            .encode(Envelope::from(Body::read(0, 0, 42, false)), &mut full)
            .unwrap();

        // Feed the frame one byte at a time; only the last byte completes it.
        let mut partial = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            partial.put_u8(*byte);
            let result = codec.decode(&mut partial).unwrap();
            if i + 1 < full.len() {
                assert!(result.is_none());
            } else {
                assert_eq!(result.unwrap().body, Some(Body::read(0, 0, 42, false)));
            }
        }
    }
}
