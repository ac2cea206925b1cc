use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Size of the body length prefix.
pub const LENGTH_FIELD_SIZE: usize = 2;

/// Frame header: body length (2) + kind (1) = 3 bytes.
pub const HEADER_SIZE: usize = LENGTH_FIELD_SIZE + 1;

/// Largest payload whose body length (`1 + payload`) still fits in a `u16`.
pub const MAX_PAYLOAD: usize = u16::MAX as usize - 1;

/// A framed message: a kind discriminator plus its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The message kind this payload encodes.
    pub kind: u8,
    /// The message payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(kind: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Value of the body length field (kind byte + payload).
    pub fn body_length(&self) -> usize {
        1 + self.payload.len()
    }

    /// The total wire size of this frame (length prefix + body).
    pub fn wire_size(&self) -> usize {
        LENGTH_FIELD_SIZE + self.body_length()
    }

    /// Encode this frame into a freshly allocated buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(self.wire_size());
        encode_frame(self.kind, &self.payload, &mut dst)?;
        Ok(dst.freeze())
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────────┬───────────┬──────────────────────────┐
/// │ Body length (2B) │ Kind (1B) │ Payload                  │
/// │ LE, 1 + payload  │           │ (body length - 1 bytes)  │
/// └──────────────────┴───────────┴──────────────────────────┘
/// ```
pub fn encode_frame(kind: u8, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u16_le((1 + payload.len()) as u16);
    dst.put_u8(kind);
    dst.put_slice(payload);
    Ok(())
}

/// Decode the next frame from a stream accumulation buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes exactly one frame from the front of the buffer.
///
/// A zero body length cannot carry a kind byte; the two length bytes are
/// consumed and `MalformedFrame` is returned so the stream can continue.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Frame>> {
    if src.len() < LENGTH_FIELD_SIZE {
        return Ok(None);
    }

    let body_len = u16::from_le_bytes([src[0], src[1]]) as usize;
    if body_len == 0 {
        src.advance(LENGTH_FIELD_SIZE);
        return Err(FrameError::malformed("zero body length"));
    }

    let total = LENGTH_FIELD_SIZE + body_len;
    if src.len() < total {
        return Ok(None);
    }

    src.advance(LENGTH_FIELD_SIZE);
    let kind = src.get_u8();
    let payload = src.split_to(body_len - 1).freeze();

    Ok(Some(Frame { kind, payload }))
}

/// Parse a buffer that must hold exactly one frame (e.g. one datagram).
pub fn parse_frame(data: &[u8]) -> Result<Frame> {
    if data.len() < HEADER_SIZE {
        return Err(FrameError::malformed(format!(
            "{} bytes is shorter than the {HEADER_SIZE}-byte header",
            data.len()
        )));
    }

    let body_len = u16::from_le_bytes([data[0], data[1]]) as usize;
    let actual = data.len() - LENGTH_FIELD_SIZE;
    if body_len != actual {
        return Err(FrameError::malformed(format!(
            "declared body length {body_len} but {actual} bytes present"
        )));
    }

    Ok(Frame {
        kind: data[2],
        payload: Bytes::copy_from_slice(&data[HEADER_SIZE..]),
    })
}
