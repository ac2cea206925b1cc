//! Length-prefixed binary framing for twinlink.
//!
//! Every message on either channel is a single frame:
//! - A 2-byte little-endian body length (kind byte + payload)
//! - A 1-byte message kind
//! - The payload
//!
//! [`Message`] gives the built-in kinds a typed view; unknown kinds are kept
//! as raw frames so newer peers can add kinds without breaking older ones.

pub mod codec;
pub mod error;
pub mod kind;
pub mod message;

pub use codec::{
    decode_frame, encode_frame, parse_frame, Frame, HEADER_SIZE, LENGTH_FIELD_SIZE, MAX_PAYLOAD,
};
pub use error::{FrameError, Result};
pub use kind::{kind_name, IDENTITY_ASSIGNMENT, PEER_BIND, TEXT};
pub use message::{Message, PeerBind};
