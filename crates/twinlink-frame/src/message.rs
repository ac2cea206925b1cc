use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{parse_frame, Frame};
use crate::error::{FrameError, Result};
use crate::kind::{kind_name, IDENTITY_ASSIGNMENT, PEER_BIND, TEXT};

/// Payload of a [`Message::PeerBind`]: request when `ack == false`,
/// acknowledgement when `ack == true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerBind {
    pub ack: bool,
    pub identity: u32,
}

impl PeerBind {
    /// Unacknowledged request sent by the client over the unreliable channel.
    pub fn request(identity: u32) -> Self {
        Self {
            ack: false,
            identity,
        }
    }

    /// Acknowledgement sent by the server over the reliable channel.
    pub fn ack(identity: u32) -> Self {
        Self {
            ack: true,
            identity,
        }
    }
}

/// A typed view over a frame's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text, no terminator.
    Text(String),
    /// Identity the server assigned to this client.
    IdentityAssignment(u32),
    /// Unreliable-channel binding handshake.
    PeerBind(PeerBind),
    /// A kind this crate does not interpret, preserved verbatim.
    ///
    /// Only for application kinds: decoding never yields `Raw` for a
    /// built-in kind, and [`Message::encode`] refuses to produce one.
    Raw(Frame),
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// The kind byte this message is framed with.
    pub fn kind(&self) -> u8 {
        match self {
            Self::Text(_) => TEXT,
            Self::IdentityAssignment(_) => IDENTITY_ASSIGNMENT,
            Self::PeerBind(_) => PEER_BIND,
            Self::Raw(frame) => frame.kind,
        }
    }

    /// Build the frame carrying this message. A `Raw` frame is returned
    /// as-is, whatever its kind.
    pub fn to_frame(&self) -> Frame {
        match self {
            Self::Text(text) => Frame::new(TEXT, Bytes::copy_from_slice(text.as_bytes())),
            Self::IdentityAssignment(identity) => Frame::new(
                IDENTITY_ASSIGNMENT,
                Bytes::copy_from_slice(&identity.to_le_bytes()),
            ),
            Self::PeerBind(bind) => {
                let mut payload = BytesMut::with_capacity(5);
                payload.put_u8(u8::from(bind.ack));
                payload.put_u32_le(bind.identity);
                Frame::new(PEER_BIND, payload.freeze())
            }
            Self::Raw(frame) => frame.clone(),
        }
    }

    /// Encode to wire bytes (length prefix, kind, payload).
    ///
    /// Fails with `MalformedFrame` for a `Raw` message that carries a
    /// built-in kind; use the typed variant instead.
    pub fn encode(&self) -> Result<Bytes> {
        if let Self::Raw(frame) = self {
            if matches!(frame.kind, TEXT | IDENTITY_ASSIGNMENT | PEER_BIND) {
                return Err(FrameError::malformed(format!(
                    "raw message uses built-in kind {}",
                    kind_name(frame.kind)
                )));
            }
        }
        self.to_frame().encode()
    }

    /// Interpret a validated frame.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        match frame.kind {
            TEXT => match String::from_utf8(frame.payload.to_vec()) {
                Ok(text) => Ok(Self::Text(text)),
                Err(_) => Err(FrameError::malformed("text payload is not valid UTF-8")),
            },
            IDENTITY_ASSIGNMENT => {
                let bytes: [u8; 4] = frame.payload.as_ref().try_into().map_err(|_| {
                    FrameError::malformed(format!(
                        "identity assignment expects 4 payload bytes, got {}",
                        frame.payload.len()
                    ))
                })?;
                Ok(Self::IdentityAssignment(u32::from_le_bytes(bytes)))
            }
            PEER_BIND => {
                let payload = frame.payload.as_ref();
                if payload.len() != 5 {
                    return Err(FrameError::malformed(format!(
                        "peer bind expects 5 payload bytes, got {}",
                        payload.len()
                    )));
                }
                let ack = match payload[0] {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(FrameError::malformed(format!(
                            "peer bind ack flag must be 0 or 1, got {other}"
                        )))
                    }
                };
                let identity = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                Ok(Self::PeerBind(PeerBind { ack, identity }))
            }
            _ => Ok(Self::Raw(frame)),
        }
    }

    /// Decode a buffer holding exactly one frame.
    pub fn decode(data: &[u8]) -> Result<Self> {
        Self::from_frame(parse_frame(data)?)
    }
}

impl From<PeerBind> for Message {
    fn from(bind: PeerBind) -> Self {
        Self::PeerBind(bind)
    }
}
