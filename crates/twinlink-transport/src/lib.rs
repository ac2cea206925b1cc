//! Reliable and unreliable frame channels.
//!
//! Two transports carry the same frame format:
//! - [`ReliableChannel`] over a TCP stream (ordered, reassembled from chunks)
//! - [`UnreliableChannel`] over a UDP socket (one frame per datagram)
//!
//! Both push inbound frames into an [`Inbound`] sink from their own receive
//! loop and serialize outbound sends with a per-channel lock.

pub mod error;
pub mod reliable;
pub mod traits;
pub mod unreliable;

pub use error::{Result, TransportError};
pub use reliable::{DisconnectSignal, ReliableChannel, READ_CHUNK_SIZE};
pub use traits::{ChannelKind, Inbound, Origin};
pub use unreliable::{UnreliableChannel, MAX_DATAGRAM_SIZE};
