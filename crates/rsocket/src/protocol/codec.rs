//! Length-prefixed framing for stream transports.

use crate::error::ProtocolError;

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame expressible with the 24-bit length prefix.
pub const MAX_FRAME_SIZE: usize = 0xFF_FFFF;

/// Size of the length prefix preceding each frame.
pub const FRAME_LENGTH_SIZE: usize = 3;

/// Codec splitting a byte stream into RSocket frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec accepting frames up to [`MAX_FRAME_SIZE`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a smaller max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = if size < MAX_FRAME_SIZE {
            size
        } else {
            MAX_FRAME_SIZE
        };
        self
    }

    fn too_large(&self, size: usize) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            },
        )
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    #[allow(clippy::cast_possible_truncation)]
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        if buf.len() < FRAME_LENGTH_SIZE {
            return Ok(None);
        }

        let frame_len = (&buf[..FRAME_LENGTH_SIZE]).get_uint(FRAME_LENGTH_SIZE) as usize;
        if frame_len > self.max_frame_size {
            return Err(self.too_large(frame_len));
        }

        let total = FRAME_LENGTH_SIZE + frame_len;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_LENGTH_SIZE);
        Ok(Some(buf.split_to(frame_len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        if frame.len() > self.max_frame_size {
            return Err(self.too_large(frame.len()));
        }

        dst.reserve(FRAME_LENGTH_SIZE + frame.len());
        dst.put_uint(frame.len() as u64, FRAME_LENGTH_SIZE);
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_frames_wait_for_more() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(Bytes::from_static(b"first"), &mut buf)
            .unwrap();
        codec
            .encode(Bytes::from_static(b"second"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..3], &[0, 0, 5]);

        let mut partial = buf.split_to(4);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);

        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Bytes::from_static(b"first"))
        );
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Bytes::from_static(b"second"))
        );
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frames_are_rejected() {
        let mut codec = FrameCodec::new().with_max_frame_size(4);
        let mut buf = BytesMut::new();

        assert!(codec.encode(Bytes::from_static(b"12345"), &mut buf).is_err());

        let mut incoming = BytesMut::from(&[0u8, 0, 9, 1, 2][..]);
        let err = codec.decode(&mut incoming).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
